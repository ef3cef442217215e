// 🔍 Deduplication Engine - one candidate per (entity, year, quarter)
// The same period shows up in several filings (annual + Q4, original + revision).
// Completeness decides: fewer null metrics wins, ties keep the earlier candidate.

use crate::db::CanonicalRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// ============================================================================
// DEDUP RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupResult {
    /// Survivors, in order of first appearance of their key
    pub records: Vec<CanonicalRecord>,

    /// Candidates that lost to a more complete one
    pub dropped: usize,
}

// ============================================================================
// DEDUPLICATION ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct DeduplicationEngine;

impl DeduplicationEngine {
    pub fn new() -> Self {
        DeduplicationEngine
    }

    pub fn deduplicate(&self, candidates: Vec<CanonicalRecord>) -> DedupResult {
        let mut slots: HashMap<(String, i32, u8), usize> = HashMap::new();
        let mut records: Vec<CanonicalRecord> = Vec::new();
        let mut dropped = 0;

        for candidate in candidates {
            let key = (
                candidate.entity_id.clone(),
                candidate.fiscal_year,
                candidate.fiscal_quarter,
            );

            match slots.get(&key) {
                None => {
                    slots.insert(key, records.len());
                    records.push(candidate);
                }
                Some(&slot) => {
                    dropped += 1;
                    if candidate.null_count() < records[slot].null_count() {
                        debug!(
                            entity = %candidate.entity_id,
                            period = %candidate.period(),
                            nulls = candidate.null_count(),
                            "More complete candidate replaces earlier one"
                        );
                        records[slot] = candidate;
                    }
                }
            }
        }

        DedupResult { records, dropped }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::FiscalPeriod;

    fn candidate(period: FiscalPeriod, revenue: Option<f64>, net: Option<f64>, debt: Option<f64>) -> CanonicalRecord {
        let mut r = CanonicalRecord::new("ACME", period);
        r.revenue = revenue;
        r.net_profit = net;
        r.total_debt = debt;
        r
    }

    #[test]
    fn test_fewer_nulls_wins() {
        let sparse = candidate(FiscalPeriod::annual(2024), Some(100.0), None, None);
        let full = candidate(FiscalPeriod::annual(2024), Some(100.0), Some(10.0), Some(50.0));

        let result = DeduplicationEngine::new().deduplicate(vec![sparse, full.clone()]);

        assert_eq!(result.records, vec![full]);
        assert_eq!(result.dropped, 1);
    }

    #[test]
    fn test_tie_keeps_first() {
        let first = candidate(FiscalPeriod::new(2025, 1), Some(100.0), None, None);
        let second = candidate(FiscalPeriod::new(2025, 1), Some(999.0), None, None);

        let result = DeduplicationEngine::new().deduplicate(vec![first.clone(), second]);

        assert_eq!(result.records, vec![first]);
    }

    #[test]
    fn test_distinct_periods_and_annual_vs_q4_kept_apart() {
        let annual = candidate(FiscalPeriod::annual(2024), Some(1.0), None, None);
        let q4 = candidate(FiscalPeriod::new(2024, 4), Some(1.0), None, None);
        let other_entity = {
            let mut r = annual.clone();
            r.entity_id = "BETA".to_string();
            r
        };

        let result = DeduplicationEngine::new().deduplicate(vec![annual, q4, other_entity]);

        assert_eq!(result.records.len(), 3);
        assert_eq!(result.dropped, 0);
    }
}
