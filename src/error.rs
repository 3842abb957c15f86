//! Item-scoped error kinds.
//!
//! Every failure that can happen while moving one [`SourceItem`](crate::models::SourceItem)
//! through the pipeline is an [`IngestError`]. These never abort sibling items;
//! the orchestrator records them in the run summary. Configuration-level
//! failures (bad parameters, unreachable store, missing credentials) are
//! plain `anyhow` errors and stop the whole run instead.

use thiserror::Error;

/// A failure scoped to a single source item.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("source read failed: {0}")]
    Source(String),

    #[error("unsupported format '{content_type}'")]
    UnsupportedFormat { content_type: String },

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("no extractable text: {0}")]
    Chunking(String),

    #[error("embedding failed after {attempts} attempt(s): {reason}")]
    EmbeddingFailed { attempts: u32, reason: String },

    #[error("{} index record write(s) failed: {}", failures.len(), summarize(failures))]
    IndexWrite { failures: Vec<RecordFailure> },

    #[error("cancelled")]
    Cancelled,
}

impl IngestError {
    /// Short machine-friendly kind label used in summaries and JSON progress.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::NotFound(_) => "not_found",
            IngestError::AccessDenied(_) => "access_denied",
            IngestError::Source(_) => "source",
            IngestError::UnsupportedFormat { .. } => "unsupported_format",
            IngestError::Parse(_) => "parse",
            IngestError::Chunking(_) => "chunking",
            IngestError::EmbeddingFailed { .. } => "embedding_failed",
            IngestError::IndexWrite { .. } => "index_write",
            IngestError::Cancelled => "cancelled",
        }
    }
}

/// The store operation a [`RecordFailure`] refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOp {
    Read,
    Upsert,
    Reposition,
    Delete,
}

/// A per-record write failure collected by the index manager.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub record_id: String,
    pub op: RecordOp,
    pub reason: String,
}

fn summarize(failures: &[RecordFailure]) -> String {
    let mut parts: Vec<String> = failures
        .iter()
        .take(3)
        .map(|f| {
            let op = match f.op {
                RecordOp::Read => "read",
                RecordOp::Upsert => "upsert",
                RecordOp::Reposition => "reposition",
                RecordOp::Delete => "delete",
            };
            format!("{} {} ({})", op, f.record_id, f.reason)
        })
        .collect();
    if failures.len() > 3 {
        parts.push(format!("and {} more", failures.len() - 3));
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_write_message_lists_first_failures() {
        let failures = (0..5)
            .map(|i| RecordFailure {
                record_id: format!("r{}", i),
                op: RecordOp::Upsert,
                reason: "disk full".to_string(),
            })
            .collect();
        let err = IngestError::IndexWrite { failures };
        let msg = err.to_string();
        assert!(msg.starts_with("5 index record write(s) failed"));
        assert!(msg.contains("upsert r0 (disk full)"));
        assert!(msg.contains("and 2 more"));
        assert_eq!(err.kind(), "index_write");
    }

    #[test]
    fn unsupported_format_names_content_type() {
        let err = IngestError::UnsupportedFormat {
            content_type: "application/x-msdownload".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unsupported format 'application/x-msdownload'"
        );
    }
}
