// 🚩 Risk Rules - deterministic flags over one entity's canonical series
//
// Each rule is a pure function of (series, period type). The engine decides
// which periods to evaluate and owns persistence: one transaction per
// entity/period, upsert on signal, delete on silence.

use crate::db::{self, CanonicalRecord, FlagRecord, Metric, RuleDefinition};
use crate::error::{PipelineError, PipelineResult};
use crate::fiscal::{trailing_quarters, FiscalPeriod, PeriodType};
use crate::jobs::{report, JobState, JobStatusStore};
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RULE_ENGINE_JOB: &str = "Red Flag Engine";

const CASH_PROFIT_LOOKBACK: usize = 3;
const CASH_PROFIT_MIN_HITS: usize = 2;
const CASH_BURN_STREAK: usize = 3;
const COVERAGE_THRESHOLD: f64 = 2.5;
const COVERAGE_HIGH_THRESHOLD: f64 = 1.5;
const PROFIT_COLLAPSE_RATIO: f64 = 0.5;

// ============================================================================
// SIGNAL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Medium,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
        }
    }
}

/// A triggered rule, pinned to the latest period the rule examined
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub code: &'static str,
    pub name: &'static str,
    pub severity: Severity,
    pub period_type: PeriodType,
    pub period: FiscalPeriod,
    pub message: String,
    pub details: serde_json::Value,
}

impl Signal {
    pub fn into_flag(self, entity_id: &str) -> FlagRecord {
        FlagRecord {
            entity_id: entity_id.to_string(),
            rule_code: self.code.to_string(),
            rule_name: self.name.to_string(),
            severity: self.severity.as_str().to_string(),
            period_type: self.period_type,
            fiscal_year: self.period.year,
            fiscal_quarter: self.period.quarter,
            message: self.message,
            details: self.details,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// RULE CATALOGUE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleDescriptor {
    pub code: &'static str,
    pub name: &'static str,
    pub category: &'static str,
    pub weight: i64,
    pub supports_quarterly: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskRule {
    /// F1: OCF below net profit in most recent years
    CashProfitDivergence,
    /// F2: negative FCF streak
    SustainedCashBurn,
    /// F3: revenue down while debt up
    LeverageRevenueDivergence,
    /// F4: low interest coverage
    DebtServiceStrain,
    /// F5: net profit more than halved
    ProfitCollapse,
}

impl RiskRule {
    pub const ALL: [RiskRule; 5] = [
        RiskRule::CashProfitDivergence,
        RiskRule::SustainedCashBurn,
        RiskRule::LeverageRevenueDivergence,
        RiskRule::DebtServiceStrain,
        RiskRule::ProfitCollapse,
    ];

    pub fn descriptor(&self) -> RuleDescriptor {
        match self {
            RiskRule::CashProfitDivergence => RuleDescriptor {
                code: "F1",
                name: "Cash-Profit Divergence",
                category: "Earnings Quality",
                weight: 4,
                supports_quarterly: false,
                description: "Operating cash flow below net profit in at least 2 of the last 3 years",
            },
            RiskRule::SustainedCashBurn => RuleDescriptor {
                code: "F2",
                name: "Sustained Cash Burn",
                category: "Governance",
                weight: 4,
                supports_quarterly: false,
                description: "Free cash flow negative for 3 consecutive years",
            },
            RiskRule::LeverageRevenueDivergence => RuleDescriptor {
                code: "F3",
                name: "Leverage-Revenue Divergence",
                category: "Balance Sheet Stress",
                weight: 5,
                supports_quarterly: false,
                description: "Revenue falling while total debt rises year over year",
            },
            RiskRule::DebtServiceStrain => RuleDescriptor {
                code: "F4",
                name: "Debt-Service Strain",
                category: "Balance Sheet Stress",
                weight: 5,
                supports_quarterly: true,
                description: "Interest coverage (PBT + interest) / interest below 2.5x",
            },
            RiskRule::ProfitCollapse => RuleDescriptor {
                code: "F5",
                name: "Profit Collapse",
                category: "Earnings Quality",
                weight: 5,
                supports_quarterly: true,
                description: "Net profit below half of the comparable prior period",
            },
        }
    }

    pub fn code(&self) -> &'static str {
        self.descriptor().code
    }

    pub fn from_code(code: &str) -> Option<RiskRule> {
        RiskRule::ALL.into_iter().find(|r| r.code() == code)
    }

    pub fn supports(&self, period_type: PeriodType) -> bool {
        match period_type {
            PeriodType::Annual => true,
            PeriodType::Quarterly => self.descriptor().supports_quarterly,
        }
    }

    /// Evaluate against a series ordered oldest first.
    /// FieldMissing means "not enough data", never a finding.
    pub fn evaluate(
        &self,
        entity: &str,
        series: &[CanonicalRecord],
        period_type: PeriodType,
    ) -> PipelineResult<Option<Signal>> {
        if !self.supports(period_type) {
            return Ok(None);
        }

        match self {
            RiskRule::CashProfitDivergence => cash_profit_divergence(entity, series),
            RiskRule::SustainedCashBurn => sustained_cash_burn(entity, series),
            RiskRule::LeverageRevenueDivergence => leverage_revenue_divergence(entity, series),
            RiskRule::DebtServiceStrain => debt_service_strain(entity, series, period_type),
            RiskRule::ProfitCollapse => profit_collapse(entity, series, period_type),
        }
    }
}

/// Definitions seeded into the store (category + weight feed the scorer)
pub fn rule_definitions() -> Vec<RuleDefinition> {
    RiskRule::ALL
        .iter()
        .map(|rule| {
            let d = rule.descriptor();
            RuleDefinition {
                rule_code: d.code.to_string(),
                rule_name: d.name.to_string(),
                category: d.category.to_string(),
                impact_weight: d.weight,
                description: d.description.to_string(),
                is_active: true,
            }
        })
        .collect()
}

// ============================================================================
// SERIES HELPERS
// ============================================================================

/// Annual records, newest first
fn annual_desc(series: &[CanonicalRecord]) -> Vec<&CanonicalRecord> {
    let mut annual: Vec<&CanonicalRecord> = series.iter().filter(|r| r.is_annual()).collect();
    annual.sort_by(|a, b| b.fiscal_year.cmp(&a.fiscal_year));
    annual
}

fn latest_quarter(series: &[CanonicalRecord]) -> Option<&CanonicalRecord> {
    series
        .iter()
        .filter(|r| !r.is_annual())
        .max_by_key(|r| r.period())
}

/// Latest record of the given type: the period a rule pass speaks for
pub fn evaluated_period(series: &[CanonicalRecord], period_type: PeriodType) -> Option<FiscalPeriod> {
    match period_type {
        PeriodType::Annual => annual_desc(series).first().map(|r| r.period()),
        PeriodType::Quarterly => latest_quarter(series).map(|r| r.period()),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn pct_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        0.0
    } else {
        (current - previous) / previous * 100.0
    }
}

// ============================================================================
// RULES
// ============================================================================

fn cash_profit_divergence(entity: &str, series: &[CanonicalRecord]) -> PipelineResult<Option<Signal>> {
    let window: Vec<&CanonicalRecord> = annual_desc(series)
        .into_iter()
        .take(CASH_PROFIT_LOOKBACK)
        .collect();
    if window.len() < CASH_PROFIT_LOOKBACK {
        return Ok(None);
    }

    // Years with a missing metric simply don't count
    let evidence: Vec<serde_json::Value> = window
        .iter()
        .filter_map(|r| match (r.operating_cash_flow, r.net_profit) {
            (Some(ocf), Some(pat)) if ocf < pat => Some(json!({
                "year": r.fiscal_year,
                "ocf": ocf,
                "pat": pat,
                "diff": ocf - pat,
            })),
            _ => None,
        })
        .collect();

    if evidence.len() < CASH_PROFIT_MIN_HITS {
        return Ok(None);
    }

    let d = RiskRule::CashProfitDivergence.descriptor();
    Ok(Some(Signal {
        code: d.code,
        name: d.name,
        severity: Severity::High,
        period_type: PeriodType::Annual,
        period: window[0].period(),
        message: format!(
            "{}: OCF below Net Profit in {}/{} recent years.",
            entity,
            evidence.len(),
            window.len()
        ),
        details: json!({
            "triggered_count": evidence.len(),
            "threshold": CASH_PROFIT_MIN_HITS,
            "years_analyzed": window.len(),
            "evidence": evidence,
        }),
    }))
}

fn sustained_cash_burn(entity: &str, series: &[CanonicalRecord]) -> PipelineResult<Option<Signal>> {
    let window: Vec<&CanonicalRecord> = annual_desc(series).into_iter().take(CASH_BURN_STREAK).collect();
    if window.len() < CASH_BURN_STREAK {
        return Ok(None);
    }

    let mut streak = Vec::with_capacity(CASH_BURN_STREAK);
    for record in &window {
        let fcf = record.require(Metric::FreeCashFlow)?;
        if fcf >= 0.0 {
            return Ok(None);
        }
        streak.push(json!({ "year": record.fiscal_year, "free_cash_flow": fcf }));
    }

    let d = RiskRule::SustainedCashBurn.descriptor();
    Ok(Some(Signal {
        code: d.code,
        name: d.name,
        severity: Severity::High,
        period_type: PeriodType::Annual,
        period: window[0].period(),
        message: format!(
            "{}: Negative Free Cash Flow for last {} consecutive years.",
            entity, CASH_BURN_STREAK
        ),
        details: json!({
            "years_in_streak": window.iter().map(|r| r.fiscal_year).collect::<Vec<_>>(),
            "financials": streak,
        }),
    }))
}

fn leverage_revenue_divergence(entity: &str, series: &[CanonicalRecord]) -> PipelineResult<Option<Signal>> {
    let annual = annual_desc(series);
    let (current, previous) = match annual.as_slice() {
        [current, previous, ..] => (*current, *previous),
        _ => return Ok(None),
    };
    if current.fiscal_year <= previous.fiscal_year {
        return Ok(None);
    }

    let curr_rev = current.require(Metric::Revenue)?;
    let prev_rev = previous.require(Metric::Revenue)?;
    let curr_debt = current.require(Metric::TotalDebt)?;
    let prev_debt = previous.require(Metric::TotalDebt)?;

    if !(curr_rev < prev_rev && curr_debt > prev_debt) {
        return Ok(None);
    }

    let revenue_change = pct_change(curr_rev, prev_rev);
    let debt_change = pct_change(curr_debt, prev_debt);

    let d = RiskRule::LeverageRevenueDivergence.descriptor();
    Ok(Some(Signal {
        code: d.code,
        name: d.name,
        severity: Severity::Medium,
        period_type: PeriodType::Annual,
        period: current.period(),
        message: format!(
            "{}: Revenue fell {:.1}% while Debt rose {:.1}% in {} vs {}.",
            entity,
            revenue_change.abs(),
            debt_change,
            current.period(),
            previous.period()
        ),
        details: json!({
            "current_year": current.fiscal_year,
            "previous_year": previous.fiscal_year,
            "revenue_change_pct": round2(revenue_change),
            "debt_change_pct": round2(debt_change),
        }),
    }))
}

fn debt_service_strain(
    entity: &str,
    series: &[CanonicalRecord],
    period_type: PeriodType,
) -> PipelineResult<Option<Signal>> {
    let latest = match period_type {
        PeriodType::Annual => annual_desc(series).first().copied(),
        PeriodType::Quarterly => latest_quarter(series),
    };
    let Some(record) = latest else {
        return Ok(None);
    };

    let pbt = record.require(Metric::ProfitBeforeTax)?;
    let interest = record.require(Metric::InterestExpense)?;
    if interest == 0.0 {
        return Ok(None);
    }

    let ebit = pbt + interest;
    let ratio = ebit / interest;
    if !ratio.is_finite() {
        return Err(PipelineError::RuleEvaluation {
            code: "F4",
            entity: entity.to_string(),
            reason: format!("coverage ratio not finite for {}", record.period()),
        });
    }
    if ratio >= COVERAGE_THRESHOLD {
        return Ok(None);
    }

    let severity = if ratio < COVERAGE_HIGH_THRESHOLD {
        Severity::High
    } else {
        Severity::Medium
    };

    let d = RiskRule::DebtServiceStrain.descriptor();
    Ok(Some(Signal {
        code: d.code,
        name: d.name,
        severity,
        period_type,
        period: record.period(),
        message: format!(
            "{}: Low Interest Coverage Ratio of {:.2}x in {} (Threshold: {}x).",
            entity,
            ratio,
            record.period(),
            COVERAGE_THRESHOLD
        ),
        details: json!({
            "period": record.period().label(),
            "year": record.fiscal_year,
            "quarter": record.fiscal_quarter,
            "ebit": ebit,
            "interest_expense": interest,
            "ratio": round2(ratio),
        }),
    }))
}

fn profit_collapse(
    entity: &str,
    series: &[CanonicalRecord],
    period_type: PeriodType,
) -> PipelineResult<Option<Signal>> {
    let pair = match period_type {
        PeriodType::Annual => {
            let annual = annual_desc(series);
            match annual.as_slice() {
                [current, previous, ..] if current.fiscal_year > previous.fiscal_year => {
                    Some((*current, *previous))
                }
                _ => None,
            }
        }
        PeriodType::Quarterly => latest_quarter(series).and_then(|current| {
            series
                .iter()
                .find(|r| r.fiscal_quarter == current.fiscal_quarter && r.fiscal_year == current.fiscal_year - 1)
                .map(|previous| (current, previous))
        }),
    };
    let Some((current, previous)) = pair else {
        return Ok(None);
    };

    let curr_pat = current.require(Metric::NetProfit)?;
    let prev_pat = previous.require(Metric::NetProfit)?;

    // A loss (or zero) base can't collapse
    if prev_pat <= 0.0 || curr_pat >= PROFIT_COLLAPSE_RATIO * prev_pat {
        return Ok(None);
    }

    let drop_pct = (prev_pat - curr_pat) / prev_pat * 100.0;

    let d = RiskRule::ProfitCollapse.descriptor();
    Ok(Some(Signal {
        code: d.code,
        name: d.name,
        severity: Severity::High,
        period_type,
        period: current.period(),
        message: format!(
            "{}: Net Profit collapsed by {:.1}% from {} to {}.",
            entity,
            drop_pct,
            previous.period(),
            current.period()
        ),
        details: json!({
            "current_period": current.period().label(),
            "previous_period": previous.period().label(),
            "current_pat": curr_pat,
            "previous_pat": prev_pat,
            "drop_pct": round2(drop_pct),
        }),
    }))
}

// ============================================================================
// RULE ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepMode {
    /// Only the fiscal quarter containing the supplied date
    Current,
    /// The N trailing fiscal quarters ending with the current one
    Backfill(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub evaluations: usize,
    pub flags_written: usize,
    pub flags_cleared: usize,
    pub rule_errors: usize,
}

impl EvaluationSummary {
    fn absorb(&mut self, other: &EvaluationSummary) {
        self.evaluations += other.evaluations;
        self.flags_written += other.flags_written;
        self.flags_cleared += other.flags_cleared;
        self.rule_errors += other.rule_errors;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub run_id: Uuid,
    pub entities: usize,
    pub periods: Vec<FiscalPeriod>,
    pub summary: EvaluationSummary,
}

pub struct RuleEngine {
    rules: Vec<RiskRule>,
}

impl RuleEngine {
    /// Full catalogue
    pub fn new() -> Self {
        RuleEngine {
            rules: RiskRule::ALL.to_vec(),
        }
    }

    pub fn with_rules(rules: Vec<RiskRule>) -> Self {
        RuleEngine { rules }
    }

    /// Catalogue filtered by the store's active flags. An unseeded store runs everything.
    pub fn from_store(conn: &Connection) -> PipelineResult<Self> {
        let definitions = db::get_rule_definitions(conn)?;
        if definitions.is_empty() {
            return Ok(RuleEngine::new());
        }

        let rules = RiskRule::ALL
            .into_iter()
            .filter(|rule| {
                definitions
                    .iter()
                    .find(|d| d.rule_code == rule.code())
                    .map(|d| d.is_active)
                    .unwrap_or(true)
            })
            .collect();
        Ok(RuleEngine { rules })
    }

    pub fn rules(&self) -> &[RiskRule] {
        &self.rules
    }

    /// Pure evaluation of every applicable rule. Rule errors become "no signal".
    pub fn evaluate_series(
        &self,
        entity: &str,
        series: &[CanonicalRecord],
        period_type: PeriodType,
    ) -> Vec<Signal> {
        self.rules
            .iter()
            .filter(|rule| rule.supports(period_type))
            .filter_map(|rule| match rule.evaluate(entity, series, period_type) {
                Ok(signal) => signal,
                Err(e) => {
                    log_rule_error(rule, entity, period_type, &e);
                    None
                }
            })
            .collect()
    }

    /// Evaluate one entity as of `target` and persist the outcome in one transaction.
    /// Annual-scope rules run only when `include_annual` is set.
    pub fn evaluate_entity(
        &self,
        conn: &mut Connection,
        entity: &str,
        series: &[CanonicalRecord],
        target: FiscalPeriod,
        include_annual: bool,
    ) -> PipelineResult<EvaluationSummary> {
        // Data available at the target quarter; annual records sit at Q4
        let available: Vec<CanonicalRecord> = series
            .iter()
            .filter(|r| r.period().timeline_position() <= target.timeline_position())
            .cloned()
            .collect();

        let mut passes = vec![PeriodType::Quarterly];
        if include_annual {
            passes.push(PeriodType::Annual);
        }

        let mut summary = EvaluationSummary::default();
        let tx = conn.transaction()?;

        for period_type in passes {
            let evaluated = evaluated_period(&available, period_type);

            for rule in self.rules.iter().filter(|r| r.supports(period_type)) {
                summary.evaluations += 1;

                let signal = match rule.evaluate(entity, &available, period_type) {
                    Ok(signal) => signal,
                    Err(e) => {
                        if !matches!(e, PipelineError::FieldMissing { .. }) {
                            summary.rule_errors += 1;
                        }
                        log_rule_error(rule, entity, period_type, &e);
                        None
                    }
                };

                match signal {
                    Some(signal) => {
                        debug!(entity = entity, rule = signal.code, period = %signal.period, severity = signal.severity.as_str(), "Flag raised");
                        db::upsert_flag(&tx, &signal.into_flag(entity))?;
                        summary.flags_written += 1;
                    }
                    None => {
                        if let Some(period) = evaluated {
                            summary.flags_cleared += db::delete_flag(&tx, entity, rule.code(), period)?;
                        }
                    }
                }
            }
        }

        tx.commit()?;
        Ok(summary)
    }

    /// Evaluate entities (all stored ones when `entities` is None) for the
    /// current quarter or a trailing backfill window
    pub fn sweep(
        &self,
        conn: &mut Connection,
        entities: Option<&[String]>,
        mode: SweepMode,
        today: NaiveDate,
        jobs: &dyn JobStatusStore,
    ) -> anyhow::Result<SweepReport> {
        let run_id = Uuid::new_v4();
        report(jobs, RULE_ENGINE_JOB, JobState::Running, &format!("Rule sweep {:?} started", mode));

        match self.run_sweep(conn, entities, mode, today, run_id) {
            Ok(sweep) => {
                let message = format!(
                    "Evaluated {} entities over {} period(s). Flags written: {}, cleared: {}",
                    sweep.entities,
                    sweep.periods.len(),
                    sweep.summary.flags_written,
                    sweep.summary.flags_cleared
                );
                info!(run_id = %run_id, "{}", message);
                report(jobs, RULE_ENGINE_JOB, JobState::Completed, &message);
                Ok(sweep)
            }
            Err(e) => {
                report(jobs, RULE_ENGINE_JOB, JobState::Failed, &e.to_string());
                Err(anyhow::Error::new(e)).context("Rule sweep aborted")
            }
        }
    }

    fn run_sweep(
        &self,
        conn: &mut Connection,
        entities: Option<&[String]>,
        mode: SweepMode,
        today: NaiveDate,
        run_id: Uuid,
    ) -> PipelineResult<SweepReport> {
        let entities: Vec<String> = match entities {
            Some(list) => list.to_vec(),
            None => db::list_entities(conn)?,
        };

        // (target, run annual rules)
        let targets: Vec<(FiscalPeriod, bool)> = match mode {
            SweepMode::Current => vec![(FiscalPeriod::current(today), true)],
            SweepMode::Backfill(count) => trailing_quarters(today, count)
                .into_iter()
                .map(|t| (t, t.quarter == 4))
                .collect(),
        };

        info!(run_id = %run_id, entities = entities.len(), periods = targets.len(), rules = self.rules.len(), "Rule sweep started");

        let mut summary = EvaluationSummary::default();
        for entity in &entities {
            let series = db::get_financial_series(conn, entity)?;
            for (target, include_annual) in &targets {
                let result = self.evaluate_entity(conn, entity, &series, *target, *include_annual)?;
                summary.absorb(&result);
            }
        }

        Ok(SweepReport {
            run_id,
            entities: entities.len(),
            periods: targets.into_iter().map(|(t, _)| t).collect(),
            summary,
        })
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn log_rule_error(rule: &RiskRule, entity: &str, period_type: PeriodType, error: &PipelineError) {
    match error {
        PipelineError::FieldMissing { .. } => {
            debug!(entity = entity, rule = rule.code(), period = period_type.as_str(), reason = %error, "Rule skipped");
        }
        _ => {
            warn!(entity = entity, rule = rule.code(), period = period_type.as_str(), error = %error, "Rule evaluation failed, treating as no signal");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_flags_for_entity, setup_database, upsert_financial_record};
    use crate::jobs::MemoryJobStatus;

    fn annual(year: i32) -> CanonicalRecord {
        let mut r = CanonicalRecord::new("ACME", FiscalPeriod::annual(year));
        r.is_consolidated = true;
        r
    }

    fn quarter(year: i32, q: u8) -> CanonicalRecord {
        let mut r = CanonicalRecord::new("ACME", FiscalPeriod::new(year, q));
        r.is_consolidated = true;
        r
    }

    fn with_cash(mut r: CanonicalRecord, ocf: f64, pat: f64) -> CanonicalRecord {
        r.operating_cash_flow = Some(ocf);
        r.net_profit = Some(pat);
        r
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_cash_profit_divergence_two_of_three() {
        let series = vec![
            with_cash(annual(2022), 120.0, 100.0),
            with_cash(annual(2023), 80.0, 100.0),
            with_cash(annual(2024), 70.0, 100.0),
        ];

        let signal = RiskRule::CashProfitDivergence
            .evaluate("ACME", &series, PeriodType::Annual)
            .unwrap()
            .unwrap();

        assert_eq!(signal.code, "F1");
        assert_eq!(signal.severity, Severity::High);
        assert_eq!(signal.period, FiscalPeriod::annual(2024));
        assert_eq!(signal.details["triggered_count"], json!(2));
    }

    #[test]
    fn test_cash_profit_divergence_needs_three_years() {
        let series = vec![with_cash(annual(2023), 80.0, 100.0), with_cash(annual(2024), 70.0, 100.0)];
        assert!(RiskRule::CashProfitDivergence
            .evaluate("ACME", &series, PeriodType::Annual)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_three_negative_fcf_years_trigger_cash_burn() {
        let series: Vec<CanonicalRecord> = [2022, 2023, 2024]
            .into_iter()
            .map(|y| {
                let mut r = annual(y);
                r.free_cash_flow = Some(-10.0);
                r
            })
            .collect();

        let signal = RiskRule::SustainedCashBurn
            .evaluate("ACME", &series, PeriodType::Annual)
            .unwrap()
            .unwrap();
        assert_eq!(signal.code, "F2");
        assert_eq!(signal.details["years_in_streak"], json!([2024, 2023, 2022]));
    }

    #[test]
    fn test_cash_burn_missing_fcf_is_field_missing() {
        let mut series: Vec<CanonicalRecord> = [2022, 2023, 2024].into_iter().map(annual).collect();
        series[0].free_cash_flow = Some(-1.0);
        series[1].free_cash_flow = Some(-1.0);

        let result = RiskRule::SustainedCashBurn.evaluate("ACME", &series, PeriodType::Annual);
        assert!(matches!(result, Err(PipelineError::FieldMissing { field: "free_cash_flow", .. })));
    }

    #[test]
    fn test_leverage_revenue_divergence() {
        let mut prev = annual(2023);
        prev.revenue = Some(1000.0);
        prev.total_debt = Some(500.0);
        let mut curr = annual(2024);
        curr.revenue = Some(900.0);
        curr.total_debt = Some(600.0);

        let signal = RiskRule::LeverageRevenueDivergence
            .evaluate("ACME", &[prev, curr], PeriodType::Annual)
            .unwrap()
            .unwrap();

        assert_eq!(signal.severity, Severity::Medium);
        assert_eq!(signal.details["revenue_change_pct"], json!(-10.0));
        assert_eq!(signal.details["debt_change_pct"], json!(20.0));
    }

    #[test]
    fn test_coverage_of_1_4_is_high() {
        let mut r = annual(2024);
        r.profit_before_tax = Some(4.0);
        r.interest_expense = Some(10.0);

        let signal = RiskRule::DebtServiceStrain
            .evaluate("ACME", &[r], PeriodType::Annual)
            .unwrap()
            .unwrap();

        assert_eq!(signal.severity, Severity::High);
        assert_eq!(signal.details["ratio"], json!(1.4));
        assert!(signal.message.contains("1.40x"));
    }

    #[test]
    fn test_coverage_of_2_is_medium_and_zero_interest_is_silent() {
        let mut r = annual(2024);
        r.profit_before_tax = Some(10.0);
        r.interest_expense = Some(10.0);
        let signal = RiskRule::DebtServiceStrain
            .evaluate("ACME", &[r.clone()], PeriodType::Annual)
            .unwrap()
            .unwrap();
        assert_eq!(signal.severity, Severity::Medium);

        r.interest_expense = Some(0.0);
        assert!(RiskRule::DebtServiceStrain
            .evaluate("ACME", &[r], PeriodType::Annual)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_prior_loss_never_triggers_profit_collapse() {
        let mut prev = annual(2023);
        prev.net_profit = Some(-50.0);
        let mut curr = annual(2024);
        curr.net_profit = Some(-500.0);

        assert!(RiskRule::ProfitCollapse
            .evaluate("ACME", &[prev, curr], PeriodType::Annual)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_quarterly_profit_collapse_compares_same_quarter() {
        let mut last_year = quarter(2024, 2);
        last_year.net_profit = Some(100.0);
        let mut between = quarter(2025, 1);
        between.net_profit = Some(5.0);
        let mut latest = quarter(2025, 2);
        latest.net_profit = Some(40.0);

        let signal = RiskRule::ProfitCollapse
            .evaluate("ACME", &[last_year, between, latest], PeriodType::Quarterly)
            .unwrap()
            .unwrap();

        assert_eq!(signal.period, FiscalPeriod::new(2025, 2));
        assert_eq!(signal.details["drop_pct"], json!(60.0));
        assert_eq!(signal.period_type, PeriodType::Quarterly);
    }

    #[test]
    fn test_annual_only_rules_skip_quarterly() {
        let series = vec![with_cash(quarter(2025, 1), 1.0, 100.0)];
        for rule in [RiskRule::CashProfitDivergence, RiskRule::SustainedCashBurn, RiskRule::LeverageRevenueDivergence] {
            assert!(!rule.supports(PeriodType::Quarterly));
            assert!(rule.evaluate("ACME", &series, PeriodType::Quarterly).unwrap().is_none());
        }
    }

    #[test]
    fn test_catalogue_codes_are_unique() {
        let defs = rule_definitions();
        assert_eq!(defs.len(), 5);
        assert_eq!(RiskRule::from_code("F4"), Some(RiskRule::DebtServiceStrain));
        assert_eq!(RiskRule::from_code("F9"), None);
    }

    // ------------------------------------------------------------------------
    // Engine + persistence
    // ------------------------------------------------------------------------

    fn seeded_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let mut fy24 = annual(2024);
        fy24.profit_before_tax = Some(4.0);
        fy24.interest_expense = Some(10.0);
        upsert_financial_record(&conn, &fy24).unwrap();
        conn
    }

    fn comparable(flags: &[FlagRecord]) -> Vec<(String, i32, u8, String, String, serde_json::Value)> {
        flags
            .iter()
            .map(|f| {
                (
                    f.rule_code.clone(),
                    f.fiscal_year,
                    f.fiscal_quarter,
                    f.severity.clone(),
                    f.message.clone(),
                    f.details.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut conn = seeded_conn();
        let engine = RuleEngine::new();
        let jobs = MemoryJobStatus::new();
        let today = date(2024, 5, 10);

        engine.sweep(&mut conn, None, SweepMode::Current, today, &jobs).unwrap();
        let first = get_flags_for_entity(&conn, "ACME").unwrap();
        engine.sweep(&mut conn, None, SweepMode::Current, today, &jobs).unwrap();
        let second = get_flags_for_entity(&conn, "ACME").unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(comparable(&first), comparable(&second));
        assert_eq!(first[0].fiscal_quarter, 0);
        assert_eq!(jobs.last_state(RULE_ENGINE_JOB), Some(JobState::Completed));
    }

    #[test]
    fn test_no_signal_clears_stale_flag() {
        let mut conn = seeded_conn();
        let engine = RuleEngine::new();
        let jobs = MemoryJobStatus::new();
        let today = date(2024, 5, 10);

        engine.sweep(&mut conn, None, SweepMode::Current, today, &jobs).unwrap();
        assert_eq!(db::count_flags(&conn, "ACME").unwrap(), 1);

        // Restated numbers: coverage now healthy
        let mut restated = annual(2024);
        restated.profit_before_tax = Some(100.0);
        restated.interest_expense = Some(10.0);
        upsert_financial_record(&conn, &restated).unwrap();

        let report = engine.sweep(&mut conn, None, SweepMode::Current, today, &jobs).unwrap();
        assert_eq!(report.summary.flags_cleared, 1);
        assert_eq!(db::count_flags(&conn, "ACME").unwrap(), 0);
    }

    #[test]
    fn test_backfill_runs_annual_rules_only_at_q4() {
        let mut conn = seeded_conn();
        let engine = RuleEngine::with_rules(vec![RiskRule::DebtServiceStrain]);
        let jobs = MemoryJobStatus::new();

        // 2024-11-15 → FY2025 Q3; window FY2024 Q4 .. FY2025 Q3
        let report = engine
            .sweep(&mut conn, None, SweepMode::Backfill(4), date(2024, 11, 15), &jobs)
            .unwrap();

        assert_eq!(report.periods.len(), 4);
        // 4 quarterly passes + 1 annual pass (FY2024 Q4)
        assert_eq!(report.summary.evaluations, 5);
        assert_eq!(report.summary.flags_written, 1);
    }

    #[test]
    fn test_annual_record_not_visible_before_its_q4() {
        let mut conn = seeded_conn();
        let engine = RuleEngine::with_rules(vec![RiskRule::DebtServiceStrain]);
        let series = db::get_financial_series(&conn, "ACME").unwrap();

        let summary = engine
            .evaluate_entity(&mut conn, "ACME", &series, FiscalPeriod::new(2024, 3), true)
            .unwrap();

        assert_eq!(summary.flags_written, 0);
    }

    #[test]
    fn test_inactive_rules_are_skipped() {
        let conn = seeded_conn();
        db::seed_rule_definitions(&conn, &rule_definitions()).unwrap();
        db::set_rule_active(&conn, "F4", false).unwrap();

        let engine = RuleEngine::from_store(&conn).unwrap();
        assert_eq!(engine.rules().len(), 4);
        assert!(!engine.rules().contains(&RiskRule::DebtServiceStrain));
    }
}
