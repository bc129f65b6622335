//! Error taxonomy shared by every crate in the workspace.
//!
//! * [`ConfigError`]: raised once, while building a dataset. Always fatal.
//! * [`SftError`]: raised per record or per batch. The caller decides whether
//!   to drop the record or abort.
//! * [`LengthOverflowWarning`]: non-fatal; logged and attached to the example.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid dataset configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("placeholder {placeholder} must appear in prompt template {template:?}")]
    MissingPlaceholder {
        placeholder: String,
        template: String,
    },
    #[error("placeholder {placeholder} appears more than once in prompt template")]
    DuplicatePlaceholder { placeholder: String },
    #[error("label placeholder {placeholder} must be at the end of the prompt template")]
    LabelNotLast { placeholder: String },
    #[error("truncation field {field:?} is not one of the context keys {context_keys:?}")]
    TruncationFieldNotContext {
        field: String,
        context_keys: Vec<String>,
    },
    #[error("unknown truncation method {0:?} (expected one of: left, right, random)")]
    UnknownTruncationMethod(String),
    #[error("add_sep is enabled but no sep_id was configured")]
    MissingSepId,
    #[error("context_keys must name at least one field")]
    NoContextKeys,
    #[error("field {0:?} is used both as a context key and as the label key")]
    LabelIsContext(String),
    #[error("max_seq_length must be positive")]
    ZeroMaxSeqLength,
    #[error("special token {0:?} not found in tokenizer vocabulary")]
    MissingSpecialToken(String),
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Per-record / per-batch failure.
#[derive(Debug, Error)]
pub enum SftError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{field} is not long enough to truncate: has {available} tokens, {requested} must be removed")]
    FieldTruncation {
        field: String,
        available: usize,
        requested: usize,
    },
    #[error("sequence exceeds max length by {deficit} tokens but no truncatable field is present")]
    NoTruncatableField { deficit: usize },
    #[error("failed to load record {index}: {reason}")]
    RecordAccess { index: usize, reason: String },
    #[error("record is missing field {0:?}")]
    MissingField(String),
    #[error("field {field:?} must be a string or an array of token ids, got {found}")]
    InvalidField { field: String, found: String },
    #[error("tokenizer: {0}")]
    Tokenizer(String),
    #[error("collate: {0}")]
    Collate(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SftResult<T> = std::result::Result<T, SftError>;

/// The assembled sequence was longer than `max_seq_length` and was clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthOverflowWarning {
    pub length: usize,
    pub max_seq_length: usize,
}

impl fmt::Display for LengthOverflowWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input ids length {} exceeds max sequence length {}",
            self.length, self.max_seq_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_truncation_message_names_field() {
        let err = SftError::FieldTruncation {
            field: "context".into(),
            available: 2,
            requested: 5,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("context is not long enough to truncate"));
        assert!(msg.contains("has 2 tokens"));
    }

    #[test]
    fn config_error_converts_into_sft_error() {
        let err: SftError = ConfigError::MissingSepId.into();
        assert!(matches!(err, SftError::Config(ConfigError::MissingSepId)));
    }

    #[test]
    fn overflow_warning_display() {
        let w = LengthOverflowWarning {
            length: 12,
            max_seq_length: 10,
        };
        assert_eq!(
            w.to_string(),
            "input ids length 12 exceeds max sequence length 10"
        );
    }
}
