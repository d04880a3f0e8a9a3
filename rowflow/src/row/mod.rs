//! Rows: the unit of data flowing through the graph.
//!
//! A row is an ordered sequence of named, typed values. The layout is shared
//! behind an [`Arc`] so cloning a row copies only the values.

mod meta;
mod value;

pub use meta::{FieldMeta, RowMeta, ShapeMismatchError};
pub use value::{Value, ValueType};

use std::fmt;
use std::sync::Arc;

/// One unit of structured data.
///
/// Rows are immutable by convention once handed to a queue; mutation happens
/// by building a new row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    meta: Arc<RowMeta>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row over a shared layout.
    ///
    /// The value count must match the layout; a mismatch is a programming
    /// error in the producing stage and is caught by safe-mode checking.
    #[must_use]
    pub fn new(meta: Arc<RowMeta>, values: Vec<Value>) -> Self {
        Self { meta, values }
    }

    /// Returns the shared layout.
    #[must_use]
    pub fn meta(&self) -> &Arc<RowMeta> {
        &self.meta
    }

    /// Returns the values in field order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the value of a named field, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.meta.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Returns the value at a field index.
    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Returns a new row with the given fields appended.
    ///
    /// Used for error-row augmentation; the extended layout is supplied by
    /// the caller so it can be cached across rows.
    #[must_use]
    pub fn extended(&self, meta: Arc<RowMeta>, extra: Vec<Value>) -> Self {
        let mut values = self.values.clone();
        values.extend(extra);
        Self { meta, values }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

/// Builds a row and its layout in one go, mostly for tests and sources.
#[derive(Debug, Default)]
pub struct RowBuilder {
    fields: Vec<FieldMeta>,
    values: Vec<Value>,
}

impl RowBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a named field with a value.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.fields.push(FieldMeta::new(name, value.value_type()));
        self.values.push(value);
        self
    }

    /// Builds the row, allocating a fresh layout.
    #[must_use]
    pub fn build(self) -> Row {
        Row::new(Arc::new(RowMeta::new(self.fields)), self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_builder_and_lookup() {
        let row = RowBuilder::new().field("id", 7i64).field("name", "x").build();

        assert_eq!(row.meta().len(), 2);
        assert_eq!(row.get("ID"), Some(&Value::Integer(7)));
        assert_eq!(row.get("name"), Some(&Value::from("x")));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_row_clone_shares_meta() {
        let row = RowBuilder::new().field("id", 1i64).build();
        let copy = row.clone();
        assert!(Arc::ptr_eq(row.meta(), copy.meta()));
        assert_eq!(row, copy);
    }

    #[test]
    fn test_row_extended() {
        let row = RowBuilder::new().field("id", 1i64).build();
        let extended_meta = Arc::new(
            RowMeta::clone(row.meta())
                .with_field(FieldMeta::new("errors", ValueType::Integer)),
        );
        let out = row.extended(extended_meta, vec![Value::Integer(1)]);

        assert_eq!(out.meta().len(), 2);
        assert_eq!(out.get("errors"), Some(&Value::Integer(1)));
        // Original untouched.
        assert_eq!(row.meta().len(), 1);
    }
}
