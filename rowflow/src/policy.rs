//! Per-stage error-row policy: diversion and rejection-rate thresholds.

use crate::errors::EngineError;
use crate::row::{FieldMeta, Row, RowMeta, Value, ValueType};
use crate::topology::ErrorRoutingConfig;
use std::sync::Arc;

/// The diagnostics a stage attaches to one bad row.
#[derive(Debug, Clone, Default)]
pub struct RowError {
    /// Number of errors found in the row.
    pub count: u64,
    /// Human-readable error descriptions.
    pub descriptions: String,
    /// Names of the offending fields.
    pub fields: String,
    /// Machine-readable error codes.
    pub codes: String,
}

impl RowError {
    /// Creates a single-error diagnostic with a description.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            count: 1,
            descriptions: description.into(),
            ..Self::default()
        }
    }

    /// Sets the offending field names.
    #[must_use]
    pub fn with_fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = fields.into();
        self
    }

    /// Sets the error codes.
    #[must_use]
    pub fn with_codes(mut self, codes: impl Into<String>) -> Self {
        self.codes = codes.into();
        self
    }
}

/// Applies one stage's [`ErrorRoutingConfig`] to its bad rows.
///
/// Builds the augmented error rows (diagnostic fields appended in the fixed
/// order count, descriptions, fields, codes — only those with a configured
/// name) and evaluates the rejection thresholds after each one.
#[derive(Debug)]
pub struct ErrorRoutingPolicy {
    stage: String,
    config: ErrorRoutingConfig,
    // Augmented layout, cached after the first error row.
    error_meta: Option<Arc<RowMeta>>,
}

impl ErrorRoutingPolicy {
    /// Creates the policy for one stage.
    #[must_use]
    pub fn new(stage: impl Into<String>, config: ErrorRoutingConfig) -> Self {
        Self {
            stage: stage.into(),
            config,
            error_meta: None,
        }
    }

    /// Returns true when failed rows are diverted instead of failing the
    /// worker.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Builds the augmented error row for a rejected input row.
    pub fn error_row(&mut self, row: &Row, error: &RowError) -> Row {
        let meta = match &self.error_meta {
            Some(meta) => Arc::clone(meta),
            None => {
                let mut meta = RowMeta::clone(row.meta());
                if let Some(name) = &self.config.count_field {
                    meta = meta.with_field(FieldMeta::new(name.clone(), ValueType::Integer));
                }
                if let Some(name) = &self.config.descriptions_field {
                    meta = meta.with_field(FieldMeta::new(name.clone(), ValueType::String));
                }
                if let Some(name) = &self.config.fields_field {
                    meta = meta.with_field(FieldMeta::new(name.clone(), ValueType::String));
                }
                if let Some(name) = &self.config.codes_field {
                    meta = meta.with_field(FieldMeta::new(name.clone(), ValueType::String));
                }
                let meta = Arc::new(meta);
                self.error_meta = Some(Arc::clone(&meta));
                meta
            }
        };

        let mut extra = Vec::new();
        #[allow(clippy::cast_possible_wrap)]
        if self.config.count_field.is_some() {
            extra.push(Value::Integer(error.count as i64));
        }
        if self.config.descriptions_field.is_some() {
            extra.push(Value::String(error.descriptions.clone()));
        }
        if self.config.fields_field.is_some() {
            extra.push(Value::String(error.fields.clone()));
        }
        if self.config.codes_field.is_some() {
            extra.push(Value::String(error.codes.clone()));
        }
        row.extended(meta, extra)
    }

    /// Evaluates the rejection thresholds.
    ///
    /// Returns the fatal error when the absolute count or the percentage
    /// limit is breached; both default to disabled. The percentage is only
    /// evaluated once the minimum row count has been read.
    #[must_use]
    pub fn check_thresholds(&self, rejected: u64, read: u64) -> Option<EngineError> {
        if self.config.max_errors > 0 && rejected > self.config.max_errors {
            return Some(EngineError::ThresholdBreached {
                stage: self.stage.clone(),
                rejected,
                read,
            });
        }

        if self.config.max_error_percentage > 0
            && rejected > 0
            && (self.config.min_rows_for_percentage == 0
                || read >= self.config.min_rows_for_percentage)
            && read > 0
        {
            let percentage = (100 * rejected).div_ceil(read);
            if percentage > u64::from(self.config.max_error_percentage) {
                return Some(EngineError::ThresholdBreached {
                    stage: self.stage.clone(),
                    rejected,
                    read,
                });
            }
        }

        None
    }
}
