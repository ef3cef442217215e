// 🚨 Error Taxonomy - Pipeline failures by blast radius
// Only Store / BatchFatal stop a batch. Everything else is scoped to one
// filing, one entity, or one rule evaluation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed filing. The filing is skipped.
    #[error("parse failure: {0}")]
    ParseFailure(String),

    /// Tag absent from a record. The field stays null.
    #[error("{entity} {period}: field '{field}' missing")]
    FieldMissing {
        entity: String,
        period: String,
        field: &'static str,
    },

    /// Listing or download failed. Triggers fallback or skip.
    #[error("source '{source_name}' unavailable for {entity}: {reason}")]
    SourceUnavailable {
        source_name: String,
        entity: String,
        reason: String,
    },

    /// A rule raised on bad data. Treated as no signal.
    #[error("rule {code} failed for {entity}: {reason}")]
    RuleEvaluation {
        code: &'static str,
        entity: String,
        reason: String,
    },

    /// Standalone record lost to a stored consolidated one.
    /// Only built for audit logging; the merge resolves it silently.
    #[error("{entity} {period}: consolidated record kept over standalone")]
    PersistenceConflict { entity: String, period: String },

    /// Unexpected top-level failure. Aborts the run.
    #[error("batch aborted: {0}")]
    BatchFatal(String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Infrastructure failures abort a multi-entity batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Store(_) | PipelineError::BatchFatal(_))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_infrastructure_errors_are_fatal() {
        let parse = PipelineError::ParseFailure("bad xml".to_string());
        let source = PipelineError::SourceUnavailable {
            source_name: "primary".to_string(),
            entity: "ACME".to_string(),
            reason: "timeout".to_string(),
        };
        let store = PipelineError::Store(rusqlite::Error::InvalidQuery);

        assert!(!parse.is_fatal());
        assert!(!source.is_fatal());
        assert!(store.is_fatal());
        assert!(PipelineError::BatchFatal("db gone".to_string()).is_fatal());
    }

    #[test]
    fn test_messages_carry_entity_context() {
        let err = PipelineError::FieldMissing {
            entity: "ACME".to_string(),
            period: "FY2024".to_string(),
            field: "interest_expense",
        };
        assert_eq!(err.to_string(), "ACME FY2024: field 'interest_expense' missing");
    }
}
