// 📈 Risk Scorer - flags → 0-100 score, 6-quarter trend, projection, narrative
// Computed on demand from the stored flag set; never persisted.

use crate::db::{self, EnrichedFlag, FlagRecord};
use crate::error::PipelineResult;
use crate::fiscal::{trailing_from, FiscalPeriod};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const HISTORY_QUARTERS: usize = 6;

const DEFAULT_CATEGORY: &str = "Other Risk";
const DEFAULT_IMPACT: i64 = 10;
const NO_DRIVER: &str = "No Active Risk";

/// Categories always reported, with their saturation point
const BASE_CATEGORIES: &[(&str, i64)] = &[
    ("Balance Sheet Stress", 25),
    ("Earnings Quality", 20),
    ("Governance", 20),
];
const DEFAULT_CATEGORY_MAX: i64 = 20;

// ============================================================================
// OUTPUT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskStatus {
    Stable,
    Watchlist,
    EarlyStress,
    StructuralDeterioration,
}

impl RiskStatus {
    pub fn from_score(score: i64) -> Self {
        if score >= 60 {
            RiskStatus::StructuralDeterioration
        } else if score >= 35 {
            RiskStatus::EarlyStress
        } else if score >= 15 {
            RiskStatus::Watchlist
        } else {
            RiskStatus::Stable
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskStatus::Stable => "Stable",
            RiskStatus::Watchlist => "Watchlist",
            RiskStatus::EarlyStress => "Early Stress",
            RiskStatus::StructuralDeterioration => "Structural Deterioration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFlag {
    pub flag: FlagRecord,
    pub category: String,
    pub impact_weight: i64,
    /// Contribution to the score (15 or 10)
    pub score_weight: i64,
    pub first_triggered: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: String,
    pub raw: i64,
    /// 10 = clean, 0 = saturated
    pub score: f64,
    pub percentile: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictive {
    pub slope: f64,
    pub volatility: f64,
    pub projected_base: i64,
    pub projected_stress: i64,
    pub escalation_probability: i64,
    pub acceleration: usize,
    pub delta_qoq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub period: String,
    pub event: String,
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub score: i64,
    pub status: RiskStatus,
    /// Oldest first; last entry is the current quarter
    pub history: Vec<i64>,
    pub history_periods: Vec<FiscalPeriod>,
    pub primary_driver: String,
    pub narrative: String,
    pub category_scores: Vec<CategoryScore>,
    pub predictive: Predictive,
    /// Newest first
    pub timeline: Vec<TimelineEvent>,
    pub flags: Vec<ScoredFlag>,
}

// ============================================================================
// SCORING
// ============================================================================

fn score_weight(impact: i64) -> i64 {
    if impact >= 5 {
        15
    } else {
        10
    }
}

fn first_triggered(flag: &FlagRecord) -> String {
    match (flag.fiscal_year, flag.fiscal_quarter) {
        (0, _) => flag.created_at.format("%Y-%m-%d").to_string(),
        (year, 0) => format!("FY{}", year),
        (year, quarter) => format!("Q{} FY{}", quarter, year),
    }
}

/// One entry per rule code, first occurrence wins
fn dedup_flags(flags: &[EnrichedFlag]) -> Vec<ScoredFlag> {
    let mut seen: HashSet<&str> = HashSet::new();
    flags
        .iter()
        .filter(|f| seen.insert(f.flag.rule_code.as_str()))
        .map(|f| {
            let impact_weight = f.impact_weight.unwrap_or(DEFAULT_IMPACT);
            ScoredFlag {
                flag: f.flag.clone(),
                category: f
                    .category
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
                impact_weight,
                score_weight: score_weight(impact_weight),
                first_triggered: first_triggered(&f.flag),
            }
        })
        .collect()
}

fn category_scores(flags: &[ScoredFlag]) -> Vec<CategoryScore> {
    // Insertion order matters: primary-driver ties go to the earlier category
    let mut raw: Vec<(String, i64)> = BASE_CATEGORIES
        .iter()
        .map(|(name, _)| (name.to_string(), 0))
        .collect();

    for flag in flags {
        match raw.iter_mut().find(|(name, _)| *name == flag.category) {
            Some((_, total)) => *total += flag.score_weight,
            None => raw.push((flag.category.clone(), flag.score_weight)),
        }
    }

    raw.into_iter()
        .map(|(category, raw)| {
            let max = BASE_CATEGORIES
                .iter()
                .find(|(name, _)| *name == category)
                .map(|(_, max)| *max)
                .unwrap_or(DEFAULT_CATEGORY_MAX);
            let score = (10.0 - raw as f64 / 5.0).max(0.0);
            let percentile = (100.0 - raw as f64 / max as f64 * 100.0).max(0.0);
            CategoryScore {
                category,
                raw,
                score: (score * 10.0).round() / 10.0,
                percentile: percentile.round() as i64,
            }
        })
        .collect()
}

fn primary_driver(score: i64, categories: &[CategoryScore]) -> String {
    if score == 0 {
        return NO_DRIVER.to_string();
    }
    let mut best: Option<&CategoryScore> = None;
    for category in categories {
        if best.map(|b| category.raw > b.raw).unwrap_or(true) {
            best = Some(category);
        }
    }
    best.map(|c| c.category.clone())
        .unwrap_or_else(|| NO_DRIVER.to_string())
}

/// Replay the score at each trailing quarter. A flag counts from its own
/// period onward; annual flags count from Q4 of their fiscal year.
fn history(flags: &[ScoredFlag], today: NaiveDate) -> (Vec<FiscalPeriod>, Vec<i64>) {
    let current = flags
        .iter()
        .map(|f| f.flag.period().timeline_position())
        .fold(FiscalPeriod::current(today), |latest, p| latest.max(p));

    let periods = trailing_from(current, HISTORY_QUARTERS);
    let values = periods
        .iter()
        .map(|bucket| {
            let total: i64 = flags
                .iter()
                .filter(|f| f.flag.period().timeline_position() <= *bucket)
                .map(|f| f.score_weight)
                .sum();
            total.min(100)
        })
        .collect();

    (periods, values)
}

fn predictive(score: i64, history: &[i64]) -> Predictive {
    let steps = (history.len().max(2) - 1) as f64;
    let first = history.first().copied().unwrap_or(0) as f64;
    let last = history.last().copied().unwrap_or(0) as f64;

    let slope = (last - first) / steps;
    let volatility = history
        .windows(2)
        .map(|w| (w[1] - w[0]).abs() as f64)
        .sum::<f64>()
        / steps;

    let score = score as f64;
    let projected_base = ((score + slope * 1.5) as i64).min(100);
    let projected_stress = ((score + slope * 2.0 + volatility * 2.0) as i64).min(100);
    let escalation_probability = if slope > 0.0 {
        ((projected_stress as f64 * 0.8 + 20.0) as i64).min(99)
    } else {
        15
    };

    let acceleration = history
        .windows(2)
        .rev()
        .take_while(|w| w[1] > w[0])
        .count();

    Predictive {
        slope,
        volatility,
        projected_base,
        projected_stress,
        escalation_probability,
        acceleration,
        delta_qoq: slope as i64,
    }
}

fn narrative(status: RiskStatus, driver: &str, acceleration: usize, active: usize) -> String {
    match status {
        RiskStatus::StructuralDeterioration => format!(
            "{} indicators have deteriorated for {} consecutive quarters across {} active flags. \
             Stress is structural rather than cyclical.",
            driver, acceleration, active
        ),
        RiskStatus::EarlyStress => format!(
            "{} stress is building, with risk rising for {} consecutive quarters.",
            driver, acceleration
        ),
        RiskStatus::Watchlist => format!(
            "Early signs of {} pressure; risk has risen for {} consecutive quarters.",
            driver, acceleration
        ),
        RiskStatus::Stable => {
            "Credit profile remains robust with no significant structural weaknesses.".to_string()
        }
    }
}

/// Score an entity's flags. Input order decides which duplicate survives,
/// so pass flags earliest-first (as `get_enriched_flags` returns them).
pub fn compute_risk_score(flags: &[EnrichedFlag], today: NaiveDate) -> RiskScore {
    let scored = dedup_flags(flags);

    let score = scored.iter().map(|f| f.score_weight).sum::<i64>().min(100);
    let status = RiskStatus::from_score(score);
    let categories = category_scores(&scored);
    let driver = primary_driver(score, &categories);
    let (history_periods, history) = history(&scored, today);
    let predictive = predictive(score, &history);
    let narrative = narrative(status, &driver, predictive.acceleration, scored.len());

    let timeline = scored
        .iter()
        .rev()
        .map(|f| TimelineEvent {
            period: f.first_triggered.clone(),
            event: f.flag.rule_name.clone(),
            severity: f.flag.severity.clone(),
        })
        .collect();

    RiskScore {
        score,
        status,
        history,
        history_periods,
        primary_driver: driver,
        narrative,
        category_scores: categories,
        predictive,
        timeline,
        flags: scored,
    }
}

/// Load an entity's enriched flags and score them
pub fn score_entity(conn: &Connection, entity_id: &str, today: NaiveDate) -> PipelineResult<RiskScore> {
    let flags = db::get_enriched_flags(conn, entity_id)?;
    Ok(compute_risk_score(&flags, today))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::PeriodType;
    use chrono::Utc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn enriched(code: &str, period: FiscalPeriod, category: &str, weight: i64) -> EnrichedFlag {
        EnrichedFlag {
            flag: FlagRecord {
                entity_id: "ACME".to_string(),
                rule_code: code.to_string(),
                rule_name: format!("Rule {}", code),
                severity: "MEDIUM".to_string(),
                period_type: period.period_type(),
                fiscal_year: period.year,
                fiscal_quarter: period.quarter,
                message: String::new(),
                details: serde_json::Value::Null,
                created_at: Utc::now(),
            },
            category: Some(category.to_string()),
            impact_weight: Some(weight),
        }
    }

    #[test]
    fn test_single_medium_coverage_flag_is_watchlist() {
        let flags = vec![enriched("F4", FiscalPeriod::annual(2024), "Balance Sheet Stress", 5)];

        let result = compute_risk_score(&flags, date(2024, 5, 1));

        assert_eq!(result.score, 15);
        assert_eq!(result.status, RiskStatus::Watchlist);
        assert_eq!(result.status.label(), "Watchlist");
        assert_eq!(result.primary_driver, "Balance Sheet Stress");
        assert_eq!(result.flags[0].first_triggered, "FY2024");
    }

    #[test]
    fn test_no_flags_is_stable_zero() {
        let result = compute_risk_score(&[], date(2024, 5, 1));

        assert_eq!(result.score, 0);
        assert_eq!(result.status, RiskStatus::Stable);
        assert_eq!(result.history, vec![0; HISTORY_QUARTERS]);
        assert_eq!(result.primary_driver, "No Active Risk");
        assert_eq!(result.predictive.escalation_probability, 15);
    }

    #[test]
    fn test_score_is_capped_at_100() {
        let flags: Vec<EnrichedFlag> = (1..=10)
            .map(|i| enriched(&format!("F{}", i), FiscalPeriod::annual(2024), "Governance", 5))
            .collect();

        let result = compute_risk_score(&flags, date(2024, 5, 1));

        assert_eq!(result.score, 100);
        assert_eq!(result.status, RiskStatus::StructuralDeterioration);
        assert!(result.history.iter().all(|h| (0..=100).contains(h)));
        assert!(result.predictive.projected_stress <= 100);
    }

    #[test]
    fn test_duplicate_codes_count_once_first_wins() {
        let flags = vec![
            enriched("F5", FiscalPeriod::new(2024, 2), "Earnings Quality", 5),
            enriched("F5", FiscalPeriod::new(2025, 1), "Earnings Quality", 5),
        ];

        let result = compute_risk_score(&flags, date(2024, 5, 1));

        assert_eq!(result.score, 15);
        assert_eq!(result.flags.len(), 1);
        assert_eq!(result.flags[0].first_triggered, "Q2 FY2024");
    }

    #[test]
    fn test_flag_counts_from_its_quarter_onward() {
        // 2023-02-15 sits in FY2023 Q4; window FY2022 Q3 .. FY2023 Q4
        let flags = vec![enriched("F5", FiscalPeriod::new(2023, 2), "Earnings Quality", 5)];

        let result = compute_risk_score(&flags, date(2023, 2, 15));

        assert_eq!(result.history, vec![0, 0, 0, 15, 15, 15]);
        assert_eq!(result.history_periods[3], FiscalPeriod::new(2023, 2));

        let p = &result.predictive;
        assert_eq!(p.slope, 3.0);
        assert_eq!(p.volatility, 3.0);
        assert_eq!(p.projected_base, 19);
        assert_eq!(p.projected_stress, 27);
        assert_eq!(p.escalation_probability, 41);
        assert_eq!(p.acceleration, 0);
        assert_eq!(p.delta_qoq, 3);
    }

    #[test]
    fn test_newer_flag_moves_current_quarter_forward() {
        let flags = vec![enriched("F4", FiscalPeriod::new(2026, 2), "Balance Sheet Stress", 5)];

        let result = compute_risk_score(&flags, date(2024, 5, 1));

        assert_eq!(result.history_periods.last(), Some(&FiscalPeriod::new(2026, 2)));
        assert_eq!(result.history.last(), Some(&15));
    }

    #[test]
    fn test_acceleration_counts_recent_strict_increases() {
        assert_eq!(predictive(40, &[0, 0, 10, 20, 30, 40]).acceleration, 4);
        assert_eq!(predictive(40, &[0, 10, 20, 20, 30, 40]).acceleration, 2);
    }

    #[test]
    fn test_category_scores_and_unknown_category() {
        let mut unknown = enriched("F9", FiscalPeriod::annual(2024), "", 3);
        unknown.category = None;
        let flags = vec![
            enriched("F3", FiscalPeriod::annual(2024), "Balance Sheet Stress", 5),
            enriched("F4", FiscalPeriod::annual(2024), "Balance Sheet Stress", 5),
            unknown,
        ];

        let result = compute_risk_score(&flags, date(2024, 5, 1));
        let bss = &result.category_scores[0];
        assert_eq!(bss.category, "Balance Sheet Stress");
        assert_eq!(bss.raw, 30);
        assert_eq!(bss.score, 4.0);
        assert_eq!(bss.percentile, 0);

        let other = result
            .category_scores
            .iter()
            .find(|c| c.category == "Other Risk")
            .unwrap();
        assert_eq!(other.raw, 10);
        assert_eq!(other.percentile, 50);
        assert_eq!(result.score, 40);
        assert_eq!(result.status, RiskStatus::EarlyStress);
    }

    #[test]
    fn test_timeline_is_newest_first() {
        let flags = vec![
            enriched("F1", FiscalPeriod::annual(2023), "Earnings Quality", 4),
            enriched("F4", FiscalPeriod::new(2024, 3), "Balance Sheet Stress", 5),
        ];

        let result = compute_risk_score(&flags, date(2024, 5, 1));

        assert_eq!(result.timeline[0].period, "Q3 FY2024");
        assert_eq!(result.timeline[1].period, "FY2023");
        assert_eq!(result.flags[0].flag.period_type, PeriodType::Annual);
    }

    #[test]
    fn test_score_entity_reads_store() {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        db::seed_rule_definitions(&conn, &crate::rules::rule_definitions()).unwrap();
        db::upsert_flag(&conn, &enriched("F4", FiscalPeriod::annual(2024), "ignored", 1).flag).unwrap();

        let result = score_entity(&conn, "ACME", date(2024, 5, 1)).unwrap();

        assert_eq!(result.score, 15);
        assert_eq!(result.flags[0].category, "Balance Sheet Stress");
    }

    #[test]
    fn test_coverage_of_two_scores_watchlist_end_to_end() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        db::seed_rule_definitions(&conn, &crate::rules::rule_definitions()).unwrap();

        let mut fy24 = db::CanonicalRecord::new("ACME", FiscalPeriod::annual(2024));
        fy24.profit_before_tax = Some(10.0);
        fy24.interest_expense = Some(10.0);
        fy24.is_consolidated = true;
        db::upsert_financial_record(&conn, &fy24).unwrap();

        let today = date(2024, 5, 10);
        let engine = crate::rules::RuleEngine::from_store(&conn).unwrap();
        engine
            .sweep(
                &mut conn,
                None,
                crate::rules::SweepMode::Current,
                today,
                &crate::jobs::MemoryJobStatus::new(),
            )
            .unwrap();

        let result = score_entity(&conn, "ACME", today).unwrap();

        let fired: Vec<(&str, &str)> = result
            .flags
            .iter()
            .map(|f| (f.flag.rule_code.as_str(), f.flag.severity.as_str()))
            .collect();
        assert_eq!(fired, vec![("F4", "MEDIUM")]);
        assert_eq!(result.score, 15);
        assert_eq!(result.status, RiskStatus::Watchlist);
    }
}
