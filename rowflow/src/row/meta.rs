//! Row shape metadata: ordered, named, typed fields.

use super::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error raised when two row shapes do not line up.
///
/// Produced by safe-mode checking: mixing differently shaped rows on one
/// queue is a bug in the upstream stage, not recoverable data trouble.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ShapeMismatchError {
    /// The error message.
    pub message: String,
}

impl ShapeMismatchError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Metadata for one field: name plus declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    /// Field name. Unique within a row, case-insensitively.
    pub name: String,
    /// Declared field type.
    pub value_type: ValueType,
}

impl FieldMeta {
    /// Creates a new field descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// The ordered field layout shared by all rows on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowMeta {
    fields: Vec<FieldMeta>,
}

impl RowMeta {
    /// Creates a row layout from an ordered field list.
    #[must_use]
    pub fn new(fields: Vec<FieldMeta>) -> Self {
        Self { fields }
    }

    /// Returns the fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the layout has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a field index by name, case-insensitively.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Appends a field, returning the extended layout.
    #[must_use]
    pub fn with_field(mut self, field: FieldMeta) -> Self {
        self.fields.push(field);
        self
    }

    /// Returns the name of the first duplicated field, if any.
    ///
    /// Names compare case-insensitively.
    #[must_use]
    pub fn find_duplicate_name(&self) -> Option<&str> {
        let mut names: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable_by_key(|n| n.to_ascii_lowercase());
        names
            .windows(2)
            .find(|w| w[0].eq_ignore_ascii_case(w[1]))
            .map(|w| w[0])
    }

    /// Compares this layout field-by-field against a reference layout.
    ///
    /// Any difference in field count, name (case-insensitive) or type is an
    /// error. Used by safe-mode checking with the first received row as the
    /// reference.
    pub fn check_compatible(&self, reference: &RowMeta) -> Result<(), ShapeMismatchError> {
        if reference.len() != self.len() {
            return Err(ShapeMismatchError::new(format!(
                "row has {} fields where the reference row has {}: {}",
                self.len(),
                reference.len(),
                self
            )));
        }
        for (i, (reference_field, field)) in
            reference.fields.iter().zip(self.fields.iter()).enumerate()
        {
            if !reference_field.name.eq_ignore_ascii_case(&field.name) {
                return Err(ShapeMismatchError::new(format!(
                    "field #{} is named '{}' where the reference row has '{}'",
                    i + 1,
                    field.name,
                    reference_field.name
                )));
            }
            if reference_field.value_type != field.value_type {
                return Err(ShapeMismatchError::new(format!(
                    "field '{}' has type {} where the reference row has {}",
                    field.name, field.value_type, reference_field.value_type
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RowMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", field.name, field.value_type)?;
        }
        write!(f, "]")
    }
}
