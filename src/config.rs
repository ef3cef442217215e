// ⚙️ Pipeline Configuration - loaded from JSON, every field defaulted

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where downloaded filings are cached, keyed by filing id
    pub cache_dir: PathBuf,

    /// Keep cached filings after a successful ingestion pass
    pub keep_files: bool,

    /// Filings whose inferred year predates this are skipped
    pub legacy_cutoff_year: i32,

    /// Simultaneous statement parses (memory bound)
    pub max_concurrent_parses: usize,

    /// Randomized pause between entities, in milliseconds
    pub entity_delay_ms: (u64, u64),

    /// Timeout for a single listing/download call
    pub fetch_timeout_secs: u64,

    /// Only download filings newer than what is stored
    pub delta_mode: bool,

    /// Job-status checkpoint frequency (entities)
    pub progress_every: usize,

    /// Coverage target for gap detection (quarterly records per entity)
    pub min_quarters: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            cache_dir: PathBuf::from("data/xbrl"),
            keep_files: false,
            legacy_cutoff_year: 2019,
            max_concurrent_parses: 2,
            entity_delay_ms: (1_000, 3_000),
            fetch_timeout_secs: 30,
            delta_mode: false,
            progress_every: 10,
            min_quarters: 8,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file. Missing keys fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: PipelineConfig =
            serde_json::from_str(&content).context("Failed to parse pipeline config JSON")?;

        Ok(config.normalized())
    }

    /// Clamp values that would stall the pipeline
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_parses = self.max_concurrent_parses.max(1);
        self.progress_every = self.progress_every.max(1);
        if self.entity_delay_ms.0 > self.entity_delay_ms.1 {
            self.entity_delay_ms = (self.entity_delay_ms.1, self.entity_delay_ms.0);
        }
        self
    }
}
