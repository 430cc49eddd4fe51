// ABOUTME: Error taxonomy for node-tree compilation and sync cycles
// ABOUTME: Separates structural, transport, application and fatal failures

use thiserror::Error;

/// Errors surfaced by node-tree validation, document compilation and the
/// sync orchestrator.
///
/// Structural variants describe a defect in the node declaration and are
/// never retried. `Transport` wraps failures talking to the relational
/// source, the replication slot or the sink; the orchestrator retries those
/// with backoff. `Fatal` stops the job.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("node {path} is missing required attribute \"table\"")]
    MissingTable { path: String },

    #[error("unknown node attribute \"{attribute}\" on {path}")]
    UnknownAttribute { path: String, attribute: String },

    #[error("Column \"{column}\" not present on table \"{table}\"")]
    UnknownColumn { column: String, table: String },

    #[error("Table \"{table}\" not present in schema")]
    UnknownTable { table: String },

    #[error("no foreign key relates table \"{child}\" to parent table \"{parent}\"")]
    RelationshipNotFound { parent: String, child: String },

    #[error("invalid node {path}: {message}")]
    InvalidNode { path: String, message: String },

    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),

    #[error("failed to apply {table} record {identity}: {message}")]
    Application {
        table: String,
        identity: String,
        message: String,
    },

    #[error("fatal error: {0:#}")]
    Fatal(anyhow::Error),
}

impl SyncError {
    pub fn invalid_node(path: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::InvalidNode {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for configuration defects in the node tree.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::MissingTable { .. }
                | SyncError::UnknownAttribute { .. }
                | SyncError::UnknownColumn { .. }
                | SyncError::UnknownTable { .. }
                | SyncError::RelationshipNotFound { .. }
                | SyncError::InvalidNode { .. }
        )
    }

    /// Returns `true` if retrying the cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_column_names_column_and_table() {
        let err = SyncError::UnknownColumn {
            column: "foo".into(),
            table: "book".into(),
        };
        assert_eq!(
            err.to_string(),
            "Column \"foo\" not present on table \"book\""
        );
        assert!(err.is_structural());
        assert!(!err.is_transient());
    }

    #[test]
    fn transport_errors_are_transient() {
        let err = SyncError::Transport(anyhow::anyhow!("connection refused"));
        assert!(err.is_transient());
        assert!(!err.is_structural());
        assert!(err.to_string().contains("connection refused"));
    }
}
