// ⚖️ Source Reconciler - filings from many sources → one canonical series
//
// Per entity:
//   list (chain with fallback) → delta filter → download + cache →
//   bounded parse → dedup → priority merge (one transaction) → PBT backfill
//
// Entities run one after another with a jittered pause. Parsing is the only
// concurrent step and is capped by a semaphore.

use crate::config::PipelineConfig;
use crate::db::{self, CanonicalRecord, UpsertOutcome};
use crate::deduplication::DeduplicationEngine;
use crate::error::{PipelineError, PipelineResult};
use crate::fiscal::FiscalPeriod;
use crate::jobs::{report, JobState, JobStatusStore};
use crate::parser::{StatementParser, XbrlParser};
use crate::sources::{FilingCache, FilingDescriptor, SourceChain};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INGESTION_JOB: &str = "Ingestion Job";
pub const GAP_BACKFILL_JOB: &str = "Gap Backfill Job";

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Success,
    /// Some filings failed to download or parse, but records were persisted
    Partial,
    NoFilings,
    NoRecords,
    Error,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Success => "success",
            EntityStatus::Partial => "partial",
            EntityStatus::NoFilings => "no_filings",
            EntityStatus::NoRecords => "no_records",
            EntityStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub status: EntityStatus,
    pub source_name: Option<String>,
    pub filings_found: usize,
    pub skipped_legacy: usize,
    pub skipped_delta: usize,
    pub downloaded: usize,
    pub failed_filings: usize,
    pub records_parsed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub kept_consolidated: usize,
    pub pbt_backfilled: usize,
    pub pending_revisions: usize,
    pub error: Option<String>,
}

impl EntityOutcome {
    fn new(entity_id: &str) -> Self {
        EntityOutcome {
            entity_id: entity_id.to_string(),
            status: EntityStatus::NoFilings,
            source_name: None,
            filings_found: 0,
            skipped_legacy: 0,
            skipped_delta: 0,
            downloaded: 0,
            failed_filings: 0,
            records_parsed: 0,
            inserted: 0,
            updated: 0,
            kept_consolidated: 0,
            pbt_backfilled: 0,
            pending_revisions: 0,
            error: None,
        }
    }

    fn failed(entity_id: &str, error: &PipelineError) -> Self {
        let mut outcome = EntityOutcome::new(entity_id);
        outcome.status = EntityStatus::Error;
        outcome.error = Some(error.to_string());
        outcome
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} ({} filings, {} parsed, {} inserted, {} updated, {} kept consolidated, {} failed)",
            self.entity_id,
            self.status.as_str(),
            self.filings_found,
            self.records_parsed,
            self.inserted,
            self.updated,
            self.kept_consolidated,
            self.failed_filings
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<EntityOutcome>,
}

impl BatchReport {
    pub fn count(&self, status: EntityStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Entity below the quarterly coverage target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageGap {
    pub entity_id: String,
    pub quarterly_records: usize,
}

/// Delta rule: strictly later on the quarterly timeline (annual sits at Q4),
/// or an annual filing for the year whose Q4 is the latest stored period.
/// Filings with no inferable period, and entities with nothing stored, pass.
pub fn is_newer(candidate: Option<FiscalPeriod>, latest: Option<FiscalPeriod>) -> bool {
    match (candidate, latest) {
        (Some(candidate), Some(latest)) => {
            let position = candidate.timeline_position();
            let stored = latest.timeline_position();
            position > stored || (position == stored && candidate.is_annual() && !latest.is_annual())
        }
        _ => true,
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct Reconciler {
    config: PipelineConfig,
    chain: SourceChain,
    parser: Arc<dyn StatementParser>,
    cache: FilingCache,
    parse_slots: Arc<Semaphore>,
    dedup: DeduplicationEngine,
}

impl Reconciler {
    pub fn new(config: PipelineConfig, chain: SourceChain) -> Self {
        let config = config.normalized();
        Reconciler {
            cache: FilingCache::new(&config.cache_dir),
            parse_slots: Arc::new(Semaphore::new(config.max_concurrent_parses)),
            parser: Arc::new(XbrlParser::new()),
            dedup: DeduplicationEngine::new(),
            chain,
            config,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn StatementParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Full pipeline for one entity
    pub async fn ingest_entity(&self, conn: &mut Connection, entity: &str) -> PipelineResult<EntityOutcome> {
        let mut outcome = EntityOutcome::new(entity);

        let listing = self.chain.list_consolidated(entity).await;
        outcome.source_name = listing.source_name.clone();
        outcome.filings_found = listing.filings.len();
        outcome.pending_revisions = listing.revisions.len();

        if listing.filings.is_empty() {
            warn!(
                entity = entity,
                standalone_skipped = listing.standalone_skipped,
                listing_errors = listing.listing_errors,
                "No consolidated filings from any source"
            );
            return Ok(outcome);
        }

        let mut filings = listing.filings;

        if self.config.delta_mode {
            let latest = db::latest_period(conn, entity)?;
            let before = filings.len();
            filings.retain(|f| is_newer(f.inferred_period(), latest));
            outcome.skipped_delta = before - filings.len();

            if filings.is_empty() {
                info!(entity = entity, latest = ?latest.map(|p| p.label()), "Up to date, nothing new to fetch");
                return Ok(outcome);
            }
        }

        let (candidates, fetched) = self.fetch_and_parse(&filings, &mut outcome).await?;
        outcome.records_parsed = candidates.len();

        if candidates.is_empty() {
            warn!(entity = entity, failed = outcome.failed_filings, "No financial records parsed");
            outcome.status = EntityStatus::NoRecords;
            return Ok(outcome);
        }

        self.persist(conn, entity, candidates, &mut outcome)?;

        outcome.status = if outcome.failed_filings > 0 {
            EntityStatus::Partial
        } else {
            EntityStatus::Success
        };

        if !self.config.keep_files {
            let mut removed = 0;
            for filing in &fetched {
                if self.cache.remove(filing).await {
                    removed += 1;
                }
            }
            debug!(entity = entity, removed = removed, "Cleaned up cached filings");
        }

        info!(entity = entity, "{}", outcome.summary());
        Ok(outcome)
    }

    /// Ingest a filing already on disk through the same dedup/merge path
    pub async fn ingest_local_file(
        &self,
        conn: &mut Connection,
        path: &Path,
        entity: &str,
        is_consolidated: bool,
    ) -> PipelineResult<EntityOutcome> {
        let mut outcome = EntityOutcome::new(entity);
        outcome.filings_found = 1;

        let bytes = tokio::fs::read(path).await?;
        outcome.downloaded = 1;

        let periods = {
            let _permit = self.acquire_slot().await?;
            let parser = Arc::clone(&self.parser);
            tokio::task::spawn_blocking(move || parser.extract(&bytes))
                .await
                .map_err(|e| PipelineError::ParseFailure(format!("parse task failed: {}", e)))?
        };

        let candidates: Vec<CanonicalRecord> = match periods {
            Ok(periods) => periods
                .into_iter()
                .map(|p| p.into_record(entity, is_consolidated))
                .collect(),
            Err(e) => {
                warn!(entity = entity, path = ?path, error = %e, "Local filing failed to parse");
                outcome.failed_filings = 1;
                Vec::new()
            }
        };
        outcome.records_parsed = candidates.len();

        if candidates.is_empty() {
            outcome.status = EntityStatus::NoRecords;
            return Ok(outcome);
        }

        self.persist(conn, entity, candidates, &mut outcome)?;
        outcome.status = EntityStatus::Success;
        Ok(outcome)
    }

    /// Ingest every entity in order. Only store failures abort the batch.
    pub async fn run_batch(
        &self,
        conn: &mut Connection,
        entities: &[String],
        jobs: &dyn JobStatusStore,
    ) -> anyhow::Result<BatchReport> {
        self.run_named_batch(INGESTION_JOB, conn, entities, jobs).await
    }

    /// Entities with fewer quarterly records than the coverage target
    pub fn coverage_gaps(&self, conn: &Connection) -> PipelineResult<Vec<CoverageGap>> {
        let gaps = db::quarterly_coverage(conn)?
            .into_iter()
            .filter(|(_, count)| *count < self.config.min_quarters)
            .map(|(entity_id, quarterly_records)| CoverageGap {
                entity_id,
                quarterly_records,
            })
            .collect();
        Ok(gaps)
    }

    /// Re-run ingestion for exactly the entities below the coverage target
    pub async fn run_gap_backfill(
        &self,
        conn: &mut Connection,
        jobs: &dyn JobStatusStore,
    ) -> anyhow::Result<BatchReport> {
        let gaps = self
            .coverage_gaps(conn)
            .context("Failed to compute coverage gaps")?;

        for gap in &gaps {
            debug!(entity = %gap.entity_id, quarters = gap.quarterly_records, target = self.config.min_quarters, "Coverage gap");
        }

        let entities: Vec<String> = gaps.into_iter().map(|g| g.entity_id).collect();
        self.run_named_batch(GAP_BACKFILL_JOB, conn, &entities, jobs).await
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    async fn run_named_batch(
        &self,
        job: &str,
        conn: &mut Connection,
        entities: &[String],
        jobs: &dyn JobStatusStore,
    ) -> anyhow::Result<BatchReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = entities.len();

        info!(run_id = %run_id, job = job, entities = total, "Batch started");
        report(jobs, job, JobState::Running, &format!("Starting run for {} entities", total));

        let mut outcomes = Vec::with_capacity(total);

        for (i, entity) in entities.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.entity_delay()).await;
            }

            match self.ingest_entity(conn, entity).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_fatal() => {
                    report(jobs, job, JobState::Failed, &e.to_string());
                    return Err(anyhow::Error::new(e).context(format!(
                        "{} aborted at entity {} ({}/{})",
                        job,
                        entity,
                        i + 1,
                        total
                    )));
                }
                Err(e) => {
                    warn!(run_id = %run_id, entity = %entity, error = %e, "Entity ingestion failed");
                    outcomes.push(EntityOutcome::failed(entity, &e));
                }
            }

            if (i + 1) % self.config.progress_every == 0 {
                report(jobs, job, JobState::Running, &format!("Processed {}/{}", i + 1, total));
            }
        }

        let batch = BatchReport {
            run_id,
            job_name: job.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };

        let message = format!(
            "Processed {} entities. Success: {}, partial: {}, errors: {}",
            total,
            batch.count(EntityStatus::Success),
            batch.count(EntityStatus::Partial),
            batch.count(EntityStatus::Error)
        );
        info!(run_id = %run_id, job = job, "{}", message);
        report(jobs, job, JobState::Completed, &message);

        Ok(batch)
    }

    fn entity_delay(&self) -> Duration {
        let (low, high) = self.config.entity_delay_ms;
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    async fn acquire_slot(&self) -> PipelineResult<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.parse_slots)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::BatchFatal("parse semaphore closed".to_string()))
    }

    /// Download sequentially, parse concurrently (bounded).
    /// Returns candidates in filing order plus the filings that reached the cache.
    async fn fetch_and_parse(
        &self,
        filings: &[FilingDescriptor],
        outcome: &mut EntityOutcome,
    ) -> PipelineResult<(Vec<CanonicalRecord>, Vec<FilingDescriptor>)> {
        let mut parses: JoinSet<(usize, PipelineResult<Vec<CanonicalRecord>>)> = JoinSet::new();
        let mut fetched = Vec::new();

        for (index, filing) in filings.iter().enumerate() {
            let filing_id = filing.filing_id();

            if let Some(year) = filing.inferred_year() {
                if year < self.config.legacy_cutoff_year {
                    debug!(entity = %filing.entity_id, filing_id = %filing_id, year = year, "Skipping legacy filing");
                    outcome.skipped_legacy += 1;
                    continue;
                }
            }

            let bytes = match self.fetch(filing).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(entity = %filing.entity_id, filing_id = %filing_id, period = %filing.period_label(), error = %e, "Download failed");
                    outcome.failed_filings += 1;
                    continue;
                }
            };
            outcome.downloaded += 1;
            fetched.push(filing.clone());

            let permit = self.acquire_slot().await?;
            let parser = Arc::clone(&self.parser);
            let entity = filing.entity_id.clone();
            let consolidated = filing.is_consolidated();

            parses.spawn_blocking(move || {
                let _permit = permit;
                let records = parser.extract(&bytes).map(|periods| {
                    periods
                        .into_iter()
                        .map(|p| p.into_record(&entity, consolidated))
                        .collect()
                });
                (index, records)
            });
        }

        let mut parsed: Vec<(usize, Vec<CanonicalRecord>)> = Vec::new();
        while let Some(joined) = parses.join_next().await {
            match joined {
                Ok((index, Ok(records))) => {
                    debug!(entity = %filings[index].entity_id, filing_id = %filings[index].filing_id(), records = records.len(), "Parsed filing");
                    parsed.push((index, records));
                }
                Ok((index, Err(e))) => {
                    warn!(entity = %filings[index].entity_id, filing_id = %filings[index].filing_id(), error = %e, "Filing failed to parse");
                    outcome.failed_filings += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Parse task panicked or was cancelled");
                    outcome.failed_filings += 1;
                }
            }
        }

        // Completion order is arbitrary; dedup ties depend on filing order
        parsed.sort_by_key(|(index, _)| *index);
        let candidates = parsed.into_iter().flat_map(|(_, records)| records).collect();

        Ok((candidates, fetched))
    }

    /// Cache hit, or download and cache
    async fn fetch(&self, filing: &FilingDescriptor) -> PipelineResult<Vec<u8>> {
        if let Some(bytes) = self.cache.load(filing).await? {
            debug!(entity = %filing.entity_id, filing_id = %filing.filing_id(), "Using cached filing");
            return Ok(bytes);
        }

        let bytes = self.chain.download(filing).await?;
        if let Err(e) = self.cache.store(filing, &bytes).await {
            warn!(entity = %filing.entity_id, filing_id = %filing.filing_id(), error = %e, "Could not cache filing");
        }
        Ok(bytes)
    }

    /// Dedup, then merge every survivor plus the PBT backfill in one transaction
    fn persist(
        &self,
        conn: &mut Connection,
        entity: &str,
        candidates: Vec<CanonicalRecord>,
        outcome: &mut EntityOutcome,
    ) -> PipelineResult<()> {
        let deduped = self.dedup.deduplicate(candidates);
        debug!(entity = entity, unique = deduped.records.len(), dropped = deduped.dropped, "Deduplicated candidates");

        let tx = conn.transaction()?;
        for record in &deduped.records {
            match db::upsert_financial_record(&tx, record)? {
                UpsertOutcome::Inserted => outcome.inserted += 1,
                UpsertOutcome::Updated => outcome.updated += 1,
                UpsertOutcome::KeptConsolidated => {
                    let conflict = PipelineError::PersistenceConflict {
                        entity: entity.to_string(),
                        period: record.period().label(),
                    };
                    debug!(entity = entity, period = %record.period(), "{}", conflict);
                    outcome.kept_consolidated += 1;
                }
            }
        }

        outcome.pbt_backfilled = db::backfill_annual_pbt(&tx, entity)?;
        if outcome.pbt_backfilled > 0 {
            debug!(entity = entity, count = outcome.pbt_backfilled, "Backfilled annual PBT from Q4");
        }

        tx.commit()?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
