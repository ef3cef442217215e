use crate::error::{PipelineError, PipelineResult};
use crate::fiscal::{FiscalPeriod, PeriodType};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// CANONICAL FINANCIAL RECORD
// ============================================================================

/// The metrics every canonical record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Revenue,
    NetProfit,
    ProfitBeforeTax,
    OperatingCashFlow,
    FreeCashFlow,
    TotalDebt,
    InterestExpense,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Revenue,
        Metric::NetProfit,
        Metric::ProfitBeforeTax,
        Metric::OperatingCashFlow,
        Metric::FreeCashFlow,
        Metric::TotalDebt,
        Metric::InterestExpense,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Revenue => "revenue",
            Metric::NetProfit => "net_profit",
            Metric::ProfitBeforeTax => "profit_before_tax",
            Metric::OperatingCashFlow => "operating_cash_flow",
            Metric::FreeCashFlow => "free_cash_flow",
            Metric::TotalDebt => "total_debt",
            Metric::InterestExpense => "interest_expense",
        }
    }
}

/// One entity's normalized financials for one fiscal period.
/// Unique on (entity_id, fiscal_year, fiscal_quarter); quarter 0 = annual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub entity_id: String,
    pub fiscal_year: i32,
    pub fiscal_quarter: u8,

    /// End date of the reporting period the values came from
    #[serde(default)]
    pub period_end: Option<NaiveDate>,

    pub revenue: Option<f64>,
    pub net_profit: Option<f64>,
    pub profit_before_tax: Option<f64>,
    pub operating_cash_flow: Option<f64>,
    pub free_cash_flow: Option<f64>,
    pub total_debt: Option<f64>,
    pub interest_expense: Option<f64>,

    /// Group-level (true) vs single-entity (false) statement
    pub is_consolidated: bool,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CanonicalRecord {
    pub fn new(entity_id: &str, period: FiscalPeriod) -> Self {
        CanonicalRecord {
            entity_id: entity_id.to_string(),
            fiscal_year: period.year,
            fiscal_quarter: period.quarter,
            period_end: None,
            revenue: None,
            net_profit: None,
            profit_before_tax: None,
            operating_cash_flow: None,
            free_cash_flow: None,
            total_debt: None,
            interest_expense: None,
            is_consolidated: false,
            updated_at: None,
        }
    }

    pub fn period(&self) -> FiscalPeriod {
        FiscalPeriod::new(self.fiscal_year, self.fiscal_quarter)
    }

    pub fn is_annual(&self) -> bool {
        self.fiscal_quarter == 0
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Revenue => self.revenue,
            Metric::NetProfit => self.net_profit,
            Metric::ProfitBeforeTax => self.profit_before_tax,
            Metric::OperatingCashFlow => self.operating_cash_flow,
            Metric::FreeCashFlow => self.free_cash_flow,
            Metric::TotalDebt => self.total_debt,
            Metric::InterestExpense => self.interest_expense,
        }
    }

    /// Value or a FieldMissing error carrying entity/period context
    pub fn require(&self, metric: Metric) -> PipelineResult<f64> {
        self.get(metric).ok_or_else(|| PipelineError::FieldMissing {
            entity: self.entity_id.clone(),
            period: self.period().label(),
            field: metric.name(),
        })
    }

    /// Number of metrics with no value. Lower = more complete.
    pub fn null_count(&self) -> usize {
        Metric::ALL.iter().filter(|m| self.get(**m).is_none()).count()
    }
}

/// What happened to an incoming record on persist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored consolidated record outranked an incoming standalone one
    KeptConsolidated,
}

// ============================================================================
// FLAG RECORD
// ============================================================================

/// A persisted rule signal.
/// Unique on (entity_id, rule_code, fiscal_year, fiscal_quarter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRecord {
    pub entity_id: String,
    pub rule_code: String,
    pub rule_name: String,
    pub severity: String,
    pub period_type: PeriodType,
    pub fiscal_year: i32,
    pub fiscal_quarter: u8,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl FlagRecord {
    pub fn period(&self) -> FiscalPeriod {
        FiscalPeriod::new(self.fiscal_year, self.fiscal_quarter)
    }
}

/// Rule metadata row (category and impact weight feed the scorer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub rule_code: String,
    pub rule_name: String,
    pub category: String,
    pub impact_weight: i64,
    pub description: String,
    pub is_active: bool,
}

/// Flag joined with its rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedFlag {
    pub flag: FlagRecord,
    pub category: Option<String>,
    pub impact_weight: Option<i64>,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS financials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            fiscal_quarter INTEGER NOT NULL,
            period_end TEXT,
            revenue REAL,
            net_profit REAL,
            profit_before_tax REAL,
            operating_cash_flow REAL,
            free_cash_flow REAL,
            total_debt REAL,
            interest_expense REAL,
            is_consolidated INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            UNIQUE(entity_id, fiscal_year, fiscal_quarter)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS flags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            rule_code TEXT NOT NULL,
            rule_name TEXT NOT NULL,
            severity TEXT NOT NULL,
            period_type TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            fiscal_quarter INTEGER NOT NULL,
            message TEXT NOT NULL,
            details TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(entity_id, rule_code, fiscal_year, fiscal_quarter)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rule_definitions (
            rule_code TEXT PRIMARY KEY,
            rule_name TEXT NOT NULL,
            category TEXT NOT NULL,
            impact_weight INTEGER NOT NULL DEFAULT 5,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS system_jobs (
            job_name TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            last_run_start TEXT,
            last_run_end TEXT,
            message TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_flags_entity ON flags(entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// FINANCIALS
// ============================================================================

/// Insert or update one record, honoring consolidated-over-standalone priority
pub fn upsert_financial_record(conn: &Connection, record: &CanonicalRecord) -> PipelineResult<UpsertOutcome> {
    let existing: Option<bool> = conn
        .query_row(
            "SELECT is_consolidated FROM financials
             WHERE entity_id = ?1 AND fiscal_year = ?2 AND fiscal_quarter = ?3",
            params![record.entity_id, record.fiscal_year, record.fiscal_quarter],
            |row| row.get(0),
        )
        .optional()?;

    let period_end = record.period_end.map(|d| d.format(DATE_FORMAT).to_string());
    let now = Utc::now().to_rfc3339();

    match existing {
        Some(true) if !record.is_consolidated => Ok(UpsertOutcome::KeptConsolidated),
        Some(_) => {
            conn.execute(
                "UPDATE financials SET
                    period_end = ?4,
                    revenue = ?5,
                    net_profit = ?6,
                    profit_before_tax = ?7,
                    operating_cash_flow = ?8,
                    free_cash_flow = ?9,
                    total_debt = ?10,
                    interest_expense = ?11,
                    is_consolidated = ?12,
                    updated_at = ?13
                 WHERE entity_id = ?1 AND fiscal_year = ?2 AND fiscal_quarter = ?3",
                params![
                    record.entity_id,
                    record.fiscal_year,
                    record.fiscal_quarter,
                    period_end,
                    record.revenue,
                    record.net_profit,
                    record.profit_before_tax,
                    record.operating_cash_flow,
                    record.free_cash_flow,
                    record.total_debt,
                    record.interest_expense,
                    record.is_consolidated,
                    now,
                ],
            )?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            conn.execute(
                "INSERT INTO financials (
                    entity_id, fiscal_year, fiscal_quarter, period_end,
                    revenue, net_profit, profit_before_tax, operating_cash_flow,
                    free_cash_flow, total_debt, interest_expense,
                    is_consolidated, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.entity_id,
                    record.fiscal_year,
                    record.fiscal_quarter,
                    period_end,
                    record.revenue,
                    record.net_profit,
                    record.profit_before_tax,
                    record.operating_cash_flow,
                    record.free_cash_flow,
                    record.total_debt,
                    record.interest_expense,
                    record.is_consolidated,
                    now,
                ],
            )?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}

const RECORD_COLUMNS: &str = "entity_id, fiscal_year, fiscal_quarter, period_end,
    revenue, net_profit, profit_before_tax, operating_cash_flow,
    free_cash_flow, total_debt, interest_expense, is_consolidated, updated_at";

fn record_from_row(row: &Row) -> rusqlite::Result<CanonicalRecord> {
    let period_end: Option<String> = row.get(3)?;
    let updated_at: Option<String> = row.get(12)?;

    Ok(CanonicalRecord {
        entity_id: row.get(0)?,
        fiscal_year: row.get(1)?,
        fiscal_quarter: row.get(2)?,
        period_end: period_end.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok()),
        revenue: row.get(4)?,
        net_profit: row.get(5)?,
        profit_before_tax: row.get(6)?,
        operating_cash_flow: row.get(7)?,
        free_cash_flow: row.get(8)?,
        total_debt: row.get(9)?,
        interest_expense: row.get(10)?,
        is_consolidated: row.get(11)?,
        updated_at: updated_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

/// Full series for one entity, oldest first (annual rows sort before Q1 of the same year)
pub fn get_financial_series(conn: &Connection, entity_id: &str) -> PipelineResult<Vec<CanonicalRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM financials WHERE entity_id = ?1
         ORDER BY fiscal_year ASC, fiscal_quarter ASC",
        RECORD_COLUMNS
    ))?;

    let records = stmt
        .query_map([entity_id], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

pub fn get_financial_record(
    conn: &Connection,
    entity_id: &str,
    period: FiscalPeriod,
) -> PipelineResult<Option<CanonicalRecord>> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {} FROM financials
                 WHERE entity_id = ?1 AND fiscal_year = ?2 AND fiscal_quarter = ?3",
                RECORD_COLUMNS
            ),
            params![entity_id, period.year, period.quarter],
            record_from_row,
        )
        .optional()?;

    Ok(record)
}

/// Administrative correction: remove one period
pub fn delete_financial_record(conn: &Connection, entity_id: &str, period: FiscalPeriod) -> PipelineResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM financials WHERE entity_id = ?1 AND fiscal_year = ?2 AND fiscal_quarter = ?3",
        params![entity_id, period.year, period.quarter],
    )?;
    Ok(deleted)
}

/// Latest stored period on the quarterly timeline. Annual sits at Q4 and
/// wins the tie with a same-year Q4.
pub fn latest_period(conn: &Connection, entity_id: &str) -> PipelineResult<Option<FiscalPeriod>> {
    let latest = conn
        .query_row(
            "SELECT fiscal_year, fiscal_quarter FROM financials
             WHERE entity_id = ?1
             ORDER BY fiscal_year DESC,
                      CASE fiscal_quarter WHEN 0 THEN 4 ELSE fiscal_quarter END DESC,
                      fiscal_quarter ASC
             LIMIT 1",
            [entity_id],
            |row| Ok(FiscalPeriod::new(row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(latest)
}

/// Copy PBT from the same-year Q4 record into annual records missing it.
/// Annual-only filings often omit the PBT tag while Q4 (full-year) filings carry it.
pub fn backfill_annual_pbt(conn: &Connection, entity_id: &str) -> PipelineResult<usize> {
    let updated = conn.execute(
        "UPDATE financials
         SET profit_before_tax = (
             SELECT q.profit_before_tax FROM financials q
             WHERE q.entity_id = financials.entity_id
               AND q.fiscal_year = financials.fiscal_year
               AND q.fiscal_quarter = 4
         )
         WHERE entity_id = ?1
           AND fiscal_quarter = 0
           AND profit_before_tax IS NULL
           AND EXISTS (
             SELECT 1 FROM financials q
             WHERE q.entity_id = financials.entity_id
               AND q.fiscal_year = financials.fiscal_year
               AND q.fiscal_quarter = 4
               AND q.profit_before_tax IS NOT NULL
           )",
        [entity_id],
    )?;
    Ok(updated)
}

pub fn list_entities(conn: &Connection) -> PipelineResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT entity_id FROM financials ORDER BY entity_id")?;
    let entities = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(entities)
}

/// Quarterly record count per known entity (zero-count entities included
/// when they only have annual rows)
pub fn quarterly_coverage(conn: &Connection) -> PipelineResult<Vec<(String, usize)>> {
    let mut stmt = conn.prepare(
        "SELECT entity_id, SUM(CASE WHEN fiscal_quarter > 0 THEN 1 ELSE 0 END)
         FROM financials
         GROUP BY entity_id
         ORDER BY entity_id",
    )?;
    let coverage = stmt
        .query_map([], |row| {
            let count: i64 = row.get(1)?;
            Ok((row.get(0)?, count.max(0) as usize))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(coverage)
}

// ============================================================================
// FLAGS
// ============================================================================

/// Insert or overwrite the flag at (entity, rule_code, fiscal_year, fiscal_quarter)
pub fn upsert_flag(conn: &Connection, flag: &FlagRecord) -> PipelineResult<()> {
    let details_json = serde_json::to_string(&flag.details)
        .map_err(|e| PipelineError::BatchFatal(format!("flag details not serializable: {}", e)))?;

    conn.execute(
        "INSERT INTO flags (
            entity_id, rule_code, rule_name, severity, period_type,
            fiscal_year, fiscal_quarter, message, details, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(entity_id, rule_code, fiscal_year, fiscal_quarter) DO UPDATE SET
            rule_name = excluded.rule_name,
            severity = excluded.severity,
            period_type = excluded.period_type,
            message = excluded.message,
            details = excluded.details,
            created_at = excluded.created_at",
        params![
            flag.entity_id,
            flag.rule_code,
            flag.rule_name,
            flag.severity,
            flag.period_type.as_str(),
            flag.fiscal_year,
            flag.fiscal_quarter,
            flag.message,
            details_json,
            flag.created_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

pub fn delete_flag(conn: &Connection, entity_id: &str, rule_code: &str, period: FiscalPeriod) -> PipelineResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM flags
         WHERE entity_id = ?1 AND rule_code = ?2 AND fiscal_year = ?3 AND fiscal_quarter = ?4",
        params![entity_id, rule_code, period.year, period.quarter],
    )?;
    Ok(deleted)
}

fn flag_from_row(row: &Row) -> rusqlite::Result<FlagRecord> {
    let period_type: String = row.get(4)?;
    let details_json: String = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok(FlagRecord {
        entity_id: row.get(0)?,
        rule_code: row.get(1)?,
        rule_name: row.get(2)?,
        severity: row.get(3)?,
        period_type: PeriodType::parse(&period_type).unwrap_or(PeriodType::Annual),
        fiscal_year: row.get(5)?,
        fiscal_quarter: row.get(6)?,
        message: row.get(7)?,
        details: serde_json::from_str(&details_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?
            .with_timezone(&Utc),
    })
}

const FLAG_COLUMNS: &str = "f.entity_id, f.rule_code, f.rule_name, f.severity, f.period_type,
    f.fiscal_year, f.fiscal_quarter, f.message, f.details, f.created_at";

/// Ordering that puts the earliest trigger first; annual flags sit at Q4
const FLAG_TIMELINE_ORDER: &str =
    "f.fiscal_year ASC, CASE f.fiscal_quarter WHEN 0 THEN 4 ELSE f.fiscal_quarter END ASC, f.rule_code ASC";

pub fn get_flags_for_entity(conn: &Connection, entity_id: &str) -> PipelineResult<Vec<FlagRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM flags f WHERE f.entity_id = ?1 ORDER BY {}",
        FLAG_COLUMNS, FLAG_TIMELINE_ORDER
    ))?;
    let flags = stmt
        .query_map([entity_id], flag_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(flags)
}

/// Flags joined with rule metadata, earliest trigger first
pub fn get_enriched_flags(conn: &Connection, entity_id: &str) -> PipelineResult<Vec<EnrichedFlag>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, d.category, d.impact_weight
         FROM flags f
         LEFT JOIN rule_definitions d ON d.rule_code = f.rule_code
         WHERE f.entity_id = ?1
         ORDER BY {}",
        FLAG_COLUMNS, FLAG_TIMELINE_ORDER
    ))?;
    let flags = stmt
        .query_map([entity_id], |row| {
            Ok(EnrichedFlag {
                flag: flag_from_row(row)?,
                category: row.get(10)?,
                impact_weight: row.get(11)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(flags)
}

pub fn count_flags(conn: &Connection, entity_id: &str) -> PipelineResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM flags WHERE entity_id = ?1",
        [entity_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// RULE DEFINITIONS
// ============================================================================

/// Insert missing definitions; existing rows (possibly tuned by an operator) are kept
pub fn seed_rule_definitions(conn: &Connection, definitions: &[RuleDefinition]) -> PipelineResult<usize> {
    let mut inserted = 0;
    for def in definitions {
        inserted += conn.execute(
            "INSERT OR IGNORE INTO rule_definitions (
                rule_code, rule_name, category, impact_weight, description, is_active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                def.rule_code,
                def.rule_name,
                def.category,
                def.impact_weight,
                def.description,
                def.is_active,
            ],
        )?;
    }
    Ok(inserted)
}

pub fn get_rule_definitions(conn: &Connection) -> PipelineResult<Vec<RuleDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT rule_code, rule_name, category, impact_weight, description, is_active
         FROM rule_definitions ORDER BY rule_code",
    )?;
    let definitions = stmt
        .query_map([], |row| {
            let description: Option<String> = row.get(4)?;
            Ok(RuleDefinition {
                rule_code: row.get(0)?,
                rule_name: row.get(1)?,
                category: row.get(2)?,
                impact_weight: row.get(3)?,
                description: description.unwrap_or_default(),
                is_active: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(definitions)
}

pub fn set_rule_active(conn: &Connection, rule_code: &str, active: bool) -> PipelineResult<usize> {
    let updated = conn.execute(
        "UPDATE rule_definitions SET is_active = ?2 WHERE rule_code = ?1",
        params![rule_code, active],
    )?;
    Ok(updated)
}

// ============================================================================
// TESTS
// ============================================================================
