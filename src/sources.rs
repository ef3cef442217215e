// 🌐 Filing Sources - ordered chain of listing/download providers
//
// Sources share one contract and are tried in chain order. Timeouts live
// here and nowhere else in the pipeline.

use crate::error::{PipelineError, PipelineResult};
use crate::fiscal::{FiscalPeriod, PeriodType};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// FILING DESCRIPTOR
// ============================================================================

/// One filing as announced by a source listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingDescriptor {
    pub entity_id: String,

    /// Name of the source that listed it (downloads go back to the same source)
    pub source_name: String,

    /// Download link; also the identity of the filing
    pub link: String,

    pub period_kind: PeriodType,

    /// Period end as the source prints it ("31-Mar-2024", "2024-03-31", ...)
    #[serde(default)]
    pub period_text: Option<String>,

    /// Consolidation metadata field ("Consolidated", "Non-Consolidated", ...)
    #[serde(default)]
    pub consolidated: Option<String>,

    /// Announcement subject line
    #[serde(default)]
    pub subject: Option<String>,
}

const PERIOD_FORMATS: &[&str] = &["%d-%b-%Y", "%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%d %b %Y", "%d-%B-%Y"];

impl FilingDescriptor {
    pub fn new(entity_id: &str, source_name: &str, link: &str, period_kind: PeriodType) -> Self {
        FilingDescriptor {
            entity_id: entity_id.to_string(),
            source_name: source_name.to_string(),
            link: link.to_string(),
            period_kind,
            period_text: None,
            consolidated: None,
            subject: None,
        }
    }

    pub fn with_period(mut self, period_text: &str) -> Self {
        self.period_text = Some(period_text.to_string());
        self
    }

    pub fn with_consolidated(mut self, consolidated: &str) -> Self {
        self.consolidated = Some(consolidated.to_string());
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    /// Consolidation field first, subject line second, otherwise not consolidated
    pub fn is_consolidated(&self) -> bool {
        if let Some(field) = self.consolidated.as_deref().map(str::to_lowercase) {
            if !field.trim().is_empty() {
                return field.contains("consolidated") && !field.contains("non") && !field.contains("not");
            }
        }

        if let Some(subject) = self.subject.as_deref().map(str::to_lowercase) {
            if !subject.trim().is_empty() {
                return subject.contains("consolidated") && !subject.contains("standalone");
            }
        }

        false
    }

    /// First 12 hex chars of SHA-256(link)
    pub fn filing_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.link.as_bytes());
        let hex = format!("{:x}", hasher.finalize());
        hex[..12].to_string()
    }

    pub fn period_end(&self) -> Option<NaiveDate> {
        let text = self.period_text.as_deref()?.trim();
        PERIOD_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
    }

    /// Year from the period end, or the trailing number of the period text
    pub fn inferred_year(&self) -> Option<i32> {
        if let Some(end) = self.period_end() {
            return Some(end.year());
        }
        self.period_text
            .as_deref()?
            .rsplit(|c: char| c == '-' || c == '/' || c == ' ')
            .next()
            .and_then(|tail| tail.trim().parse::<i32>().ok())
    }

    pub fn inferred_period(&self) -> Option<FiscalPeriod> {
        self.period_end()
            .map(|end| FiscalPeriod::from_period_end(end, self.period_kind == PeriodType::Annual))
    }

    /// Label used in cache file names
    pub fn period_label(&self) -> String {
        self.period_text
            .as_deref()
            .map(|p| p.trim().replace(['/', ' '], "-"))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A revision announced on a source's feed that has not been filed yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRevision {
    pub entity_id: String,
    pub subject: String,
    pub announced: Option<NaiveDate>,
}

// ============================================================================
// SOURCE CONTRACT
// ============================================================================

#[async_trait]
pub trait FilingSource: Send + Sync {
    fn name(&self) -> &str;

    async fn list_filings(&self, entity: &str, period: PeriodType) -> PipelineResult<Vec<FilingDescriptor>>;

    async fn download(&self, filing: &FilingDescriptor) -> PipelineResult<Vec<u8>>;

    /// Announcement probe. Sources without a feed report nothing.
    async fn pending_revisions(&self, _entity: &str) -> PipelineResult<Vec<PendingRevision>> {
        Ok(Vec::new())
    }
}

/// Result of walking the chain for one entity
#[derive(Debug, Clone, Default)]
pub struct ChainListing {
    /// Source that produced the filings (None when every source came up empty)
    pub source_name: Option<String>,
    pub filings: Vec<FilingDescriptor>,
    pub standalone_skipped: usize,
    pub listing_errors: usize,
    pub revisions: Vec<PendingRevision>,
}

pub struct SourceChain {
    sources: Vec<Arc<dyn FilingSource>>,
    timeout: Duration,
}

impl SourceChain {
    pub fn new(timeout: Duration) -> Self {
        SourceChain {
            sources: Vec::new(),
            timeout,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn FilingSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    async fn timed<T, F>(&self, source: &str, entity: &str, call: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::SourceUnavailable {
                source_name: source.to_string(),
                entity: entity.to_string(),
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            }),
        }
    }

    /// Consolidated filings from the first source that has any.
    /// Fallback sources are also probed for pending revisions.
    pub async fn list_consolidated(&self, entity: &str) -> ChainListing {
        let mut listing = ChainListing::default();

        for (position, source) in self.sources.iter().enumerate() {
            let name = source.name();
            let mut found = Vec::new();

            for kind in [PeriodType::Annual, PeriodType::Quarterly] {
                match self.timed(name, entity, source.list_filings(entity, kind)).await {
                    Ok(filings) => {
                        let total = filings.len();
                        let consolidated: Vec<FilingDescriptor> =
                            filings.into_iter().filter(|f| f.is_consolidated()).collect();
                        let skipped = total - consolidated.len();
                        listing.standalone_skipped += skipped;

                        if !consolidated.is_empty() {
                            debug!(entity = entity, source = name, period = kind.as_str(), count = consolidated.len(), "Consolidated filings listed");
                        } else if skipped > 0 {
                            debug!(entity = entity, source = name, period = kind.as_str(), skipped = skipped, "Only standalone filings listed");
                        }
                        found.extend(consolidated);
                    }
                    Err(e) => {
                        listing.listing_errors += 1;
                        warn!(entity = entity, source = name, period = kind.as_str(), error = %e, "Listing failed");
                    }
                }
            }

            if position > 0 {
                match self.timed(name, entity, source.pending_revisions(entity)).await {
                    Ok(revisions) => {
                        if !revisions.is_empty() {
                            info!(entity = entity, source = name, count = revisions.len(), "Pending revisions announced");
                        }
                        listing.revisions.extend(revisions);
                    }
                    Err(e) => {
                        debug!(entity = entity, source = name, error = %e, "Revision probe failed");
                    }
                }
            }

            if !found.is_empty() {
                if position > 0 {
                    info!(entity = entity, source = name, "Using fallback source");
                }
                listing.source_name = Some(name.to_string());
                listing.filings = found;
                return listing;
            }
        }

        listing
    }

    /// Download through the source that listed the filing
    pub async fn download(&self, filing: &FilingDescriptor) -> PipelineResult<Vec<u8>> {
        let source = self
            .sources
            .iter()
            .find(|s| s.name() == filing.source_name)
            .ok_or_else(|| PipelineError::SourceUnavailable {
                source_name: filing.source_name.clone(),
                entity: filing.entity_id.clone(),
                reason: "source not in chain".to_string(),
            })?;

        self.timed(&filing.source_name, &filing.entity_id, source.download(filing))
            .await
    }
}

// ============================================================================
// FILING CACHE
// ============================================================================

/// Downloaded filings on disk, keyed by (entity, period label, filing id)
#[derive(Debug, Clone)]
pub struct FilingCache {
    dir: PathBuf,
}

impl FilingCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FilingCache {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, filing: &FilingDescriptor) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.xml",
            filing.entity_id,
            filing.period_label(),
            filing.filing_id()
        ))
    }

    pub async fn load(&self, filing: &FilingDescriptor) -> PipelineResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(filing)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn store(&self, filing: &FilingDescriptor, bytes: &[u8]) -> PipelineResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(filing);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Remove a cached filing. Missing files are fine; other errors are logged.
    pub async fn remove(&self, filing: &FilingDescriptor) -> bool {
        let path = self.path_for(filing);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(entity = %filing.entity_id, path = ?path, error = %e, "Failed to clean up cached filing");
                false
            }
        }
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory source with canned listings and payloads
    #[derive(Default)]
    pub struct StaticSource {
        pub name: String,
        pub listings: HashMap<PeriodType, Vec<FilingDescriptor>>,
        pub payloads: HashMap<String, Vec<u8>>,
        pub revisions: Vec<PendingRevision>,
        pub fail_listing: bool,
        pub downloads: AtomicUsize,
    }

    impl StaticSource {
        pub fn new(name: &str) -> Self {
            StaticSource {
                name: name.to_string(),
                ..Default::default()
            }
        }

        pub fn with_filing(mut self, filing: FilingDescriptor, payload: Option<Vec<u8>>) -> Self {
            if let Some(bytes) = payload {
                self.payloads.insert(filing.link.clone(), bytes);
            }
            self.listings.entry(filing.period_kind).or_default().push(filing);
            self
        }

        pub fn download_count(&self) -> usize {
            self.downloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FilingSource for StaticSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_filings(&self, entity: &str, period: PeriodType) -> PipelineResult<Vec<FilingDescriptor>> {
            if self.fail_listing {
                return Err(PipelineError::SourceUnavailable {
                    source_name: self.name.clone(),
                    entity: entity.to_string(),
                    reason: "blocked".to_string(),
                });
            }
            Ok(self
                .listings
                .get(&period)
                .map(|filings| filings.iter().filter(|f| f.entity_id == entity).cloned().collect())
                .unwrap_or_default())
        }

        async fn download(&self, filing: &FilingDescriptor) -> PipelineResult<Vec<u8>> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.payloads
                .get(&filing.link)
                .cloned()
                .ok_or_else(|| PipelineError::SourceUnavailable {
                    source_name: self.name.clone(),
                    entity: filing.entity_id.clone(),
                    reason: "404".to_string(),
                })
        }

        async fn pending_revisions(&self, _entity: &str) -> PipelineResult<Vec<PendingRevision>> {
            Ok(self.revisions.clone())
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::test_support::StaticSource;
    use super::*;

    fn filing(link: &str) -> FilingDescriptor {
        FilingDescriptor::new("ACME", "primary", link, PeriodType::Annual)
    }

    #[test]
    fn test_consolidation_field_takes_precedence() {
        assert!(filing("a").with_consolidated("Consolidated").is_consolidated());
        assert!(!filing("a").with_consolidated("Non-Consolidated").is_consolidated());
        assert!(!filing("a").with_consolidated("Not Consolidated").is_consolidated());
        // Field present and negative: subject is not consulted
        assert!(!filing("a")
            .with_consolidated("Standalone")
            .with_subject("Consolidated results")
            .is_consolidated());
    }

    #[test]
    fn test_subject_line_fallback() {
        assert!(filing("a").with_subject("Consolidated Financial Results").is_consolidated());
        assert!(!filing("a")
            .with_subject("Standalone and Consolidated Results")
            .is_consolidated());
        assert!(!filing("a").is_consolidated());
    }

    #[test]
    fn test_filing_id_is_stable_hash_prefix() {
        let id = filing("https://example.com/a.xml").filing_id();
        assert_eq!(id.len(), 12);
        assert_eq!(id, filing("https://example.com/a.xml").filing_id());
        assert_ne!(id, filing("https://example.com/b.xml").filing_id());
    }

    #[test]
    fn test_inferred_period() {
        let annual = filing("a").with_period("31-Mar-2024");
        assert_eq!(annual.inferred_period(), Some(FiscalPeriod::annual(2024)));

        let mut quarter = filing("b").with_period("30-06-2024");
        quarter.period_kind = PeriodType::Quarterly;
        assert_eq!(quarter.inferred_period(), Some(FiscalPeriod::new(2025, 1)));

        let odd = filing("c").with_period("FY-2018");
        assert_eq!(odd.inferred_period(), None);
        assert_eq!(odd.inferred_year(), Some(2018));
        assert_eq!(filing("d").inferred_year(), None);
    }

    #[test]
    fn test_cache_path_uses_entity_period_and_id() {
        let cache = FilingCache::new("/tmp/cache");
        let f = filing("x").with_period("31 Mar 2024");
        let path = cache.path_for(&f);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ACME_31-Mar-2024_"));
        assert!(name.ends_with(".xml"));
    }

    #[tokio::test]
    async fn test_cache_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FilingCache::new(dir.path());
        let f = filing("x").with_period("31-Mar-2024");

        assert!(cache.load(&f).await.unwrap().is_none());
        cache.store(&f, b"<xbrl/>").await.unwrap();
        assert_eq!(cache.load(&f).await.unwrap(), Some(b"<xbrl/>".to_vec()));
        assert!(cache.remove(&f).await);
        assert!(!cache.remove(&f).await);
    }

    #[tokio::test]
    async fn test_chain_falls_back_when_primary_has_only_standalone() {
        let primary = StaticSource::new("primary").with_filing(
            filing("p1").with_consolidated("Non-Consolidated"),
            None,
        );
        let mut fallback = StaticSource::new("fallback").with_filing(
            FilingDescriptor::new("ACME", "fallback", "f1", PeriodType::Quarterly)
                .with_subject("Consolidated Financial Results"),
            None,
        );
        fallback.revisions.push(PendingRevision {
            entity_id: "ACME".to_string(),
            subject: "Revised results".to_string(),
            announced: None,
        });

        let chain = SourceChain::new(Duration::from_secs(5))
            .with_source(Arc::new(primary))
            .with_source(Arc::new(fallback));

        let listing = chain.list_consolidated("ACME").await;

        assert_eq!(listing.source_name.as_deref(), Some("fallback"));
        assert_eq!(listing.filings.len(), 1);
        assert_eq!(listing.standalone_skipped, 1);
        assert_eq!(listing.revisions.len(), 1);
    }

    #[tokio::test]
    async fn test_listing_errors_are_counted_not_fatal() {
        let mut primary = StaticSource::new("primary");
        primary.fail_listing = true;

        let chain = SourceChain::new(Duration::from_secs(5)).with_source(Arc::new(primary));
        let listing = chain.list_consolidated("ACME").await;

        assert!(listing.filings.is_empty());
        assert!(listing.source_name.is_none());
        assert_eq!(listing.listing_errors, 2);
    }

    #[tokio::test]
    async fn test_download_routes_to_listing_source() {
        let f = filing("p1").with_consolidated("Consolidated");
        let primary = StaticSource::new("primary").with_filing(f.clone(), Some(b"<x/>".to_vec()));
        let chain = SourceChain::new(Duration::from_secs(5)).with_source(Arc::new(primary));

        assert_eq!(chain.download(&f).await.unwrap(), b"<x/>".to_vec());

        let mut orphan = f.clone();
        orphan.source_name = "elsewhere".to_string();
        assert!(matches!(
            chain.download(&orphan).await,
            Err(PipelineError::SourceUnavailable { .. })
        ));
    }
}
