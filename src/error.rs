//! Error types for BIDS organisation steps.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for the BIDS modules.
pub type Result<T> = std::result::Result<T, BidsError>;

/// Errors raised while reshaping tables or driving the conversion tools.
#[derive(Debug, Error)]
pub enum BidsError {
    /// A table lacks columns the operation needs. Nothing has been written.
    #[error("{context} is missing required columns {missing:?} (required: {required:?})")]
    InvalidInput {
        /// What was being validated, e.g. `event table`.
        context: String,
        /// Required columns absent from the table.
        missing: Vec<String>,
        /// Full required column set.
        required: Vec<String>,
    },

    /// A cell cannot be used as a BIDS entity label. Nothing has been written.
    #[error("{context}: invalid label {value:?} ({reason})")]
    InvalidLabel {
        context: String,
        value: String,
        reason: String,
    },

    /// An external converter exited unsuccessfully or could not be started.
    #[error("{tool} failed: {message}")]
    ExternalTool {
        /// Program name as invoked.
        tool: String,
        /// The tool's own error output, verbatim.
        message: String,
    },

    /// Filesystem failure at a known path.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Delimited text could not be read or written.
    #[error("table error at {}: {source}", .path.display())]
    Table {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// A record carries more fields than the header row.
    #[error("{}: line {line} has {fields} fields but the header has {columns}", .path.display())]
    RaggedRow {
        path: PathBuf,
        line: u64,
        fields: usize,
        columns: usize,
    },

    #[error("JSON error at {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl BidsError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn table(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Table {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// True for schema violations that a batch caller may choose to downgrade.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput { .. } | Self::InvalidLabel { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_lists_columns() {
        let err = BidsError::InvalidInput {
            context: "event table".into(),
            missing: vec!["onset".into()],
            required: vec!["run".into(), "onset".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("event table"));
        assert!(msg.contains("\"onset\""));
        assert!(msg.contains("required: [\"run\", \"onset\"]"));
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_external_tool_keeps_message_verbatim() {
        let err = BidsError::ExternalTool {
            tool: "dcm2bids".into(),
            message: "Config file not found: x.json".into(),
        };
        assert_eq!(err.to_string(), "dcm2bids failed: Config file not found: x.json");
        assert!(!err.is_invalid_input());
    }

    #[test]
    fn test_invalid_label_counts_as_invalid_input() {
        let err = BidsError::InvalidLabel {
            context: "event table".into(),
            value: "x/y".into(),
            reason: "task labels must be alphanumeric".into(),
        };
        assert_eq!(
            err.to_string(),
            "event table: invalid label \"x/y\" (task labels must be alphanumeric)"
        );
        assert!(err.is_invalid_input());
    }
}
