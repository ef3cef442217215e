// Flagium Core - financial statement risk flagging
// Extraction, source reconciliation, red-flag rules and risk scoring

pub mod config;
pub mod db;
pub mod deduplication;  // One candidate per (entity, year, quarter)
pub mod error;
pub mod fiscal;         // Indian fiscal calendar (April - March)
pub mod jobs;           // Job-status side channel
pub mod parser;         // XBRL statement extractor
pub mod reconciliation; // Source reconciler + batch runners
pub mod rules;          // Red Flag Engine (F1-F5)
pub mod scoring;        // Risk Scorer
pub mod sources;        // Filing sources, fallback chain, cache

// Re-export commonly used types
pub use config::PipelineConfig;
pub use db::{
    CanonicalRecord, EnrichedFlag, FlagRecord, Metric, RuleDefinition, UpsertOutcome,
    setup_database, upsert_financial_record, get_financial_series,
    upsert_flag, delete_flag, get_enriched_flags, seed_rule_definitions,
};
pub use deduplication::{DedupResult, DeduplicationEngine};
pub use error::{PipelineError, PipelineResult};
pub use fiscal::{FiscalPeriod, PeriodType};
pub use jobs::{JobState, JobStatus, JobStatusStore, MemoryJobStatus, SqliteJobStatus};
pub use parser::{ExtractedPeriod, StatementParser, XbrlParser};
pub use reconciliation::{
    BatchReport, CoverageGap, EntityOutcome, EntityStatus, Reconciler,
    INGESTION_JOB, GAP_BACKFILL_JOB,
};
pub use rules::{
    RiskRule, RuleDescriptor, RuleEngine, Severity, Signal, SweepMode, SweepReport,
    RULE_ENGINE_JOB,
};
pub use scoring::{compute_risk_score, score_entity, RiskScore, RiskStatus};
pub use sources::{FilingCache, FilingDescriptor, FilingSource, SourceChain};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
