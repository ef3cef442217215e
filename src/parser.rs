// 🧾 Statement Extractor - XBRL filing bytes → period-scoped financials
//
// One streaming pass collects contexts and candidate facts; everything after
// that is plain lookups over the collected nodes. Namespace prefixes are
// ignored (local names only) because every taxonomy variant prefixes differently.

use crate::db::CanonicalRecord;
use crate::error::{PipelineError, PipelineResult};
use crate::fiscal::{FiscalPeriod, PeriodType};
use chrono::NaiveDate;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

// ============================================================================
// TAG ALIASES
// ============================================================================

/// Fields the extractor looks for. Superset of the canonical record:
/// the component fields only feed derived values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactField {
    Revenue,
    OtherIncome,
    NetProfit,
    ProfitBeforeTax,
    OperatingCashFlow,
    FreeCashFlow,
    TotalDebt,
    LongTermDebt,
    ShortTermDebt,
    InterestExpense,
    Capex,
}

/// Ordered alias lists. Earlier entries win within a context.
const TAG_ALIASES: &[(FactField, &[&str])] = &[
    (
        FactField::Revenue,
        &[
            "RevenueFromOperations",
            "TotalRevenue",
            "Revenue",
            "RevenueFromOperationsNet",
            "IncomeFromOperations",
            "TotalIncomeFromOperations",
            "GrossIncomeFromOperations",
            "InterestEarned",
            "Income",
        ],
    ),
    (FactField::OtherIncome, &["OtherIncome"]),
    (
        FactField::NetProfit,
        &[
            "ProfitLossAfterTax",
            "ProfitLossForPeriod",
            "NetProfitLossAfterTax",
            "ProfitAfterTax",
            "NetProfitAfterTaxes",
            "ProfitLoss",
            "ProfitLossAttributableToOwnersOfParent",
            "ProfitLossForThePeriod",
            "ProfitLossFromOrdinaryActivitiesAfterTax",
            "ProfitLossAfterTaxesMinorityInterestAndShareOfProfitLossOfAssociates",
        ],
    ),
    (
        FactField::ProfitBeforeTax,
        &[
            "ProfitLossBeforeTax",
            "ProfitBeforeTax",
            "NetProfitLossBeforeTax",
            "ProfitLossFromOrdinaryActivitiesBeforeTax",
        ],
    ),
    (
        FactField::OperatingCashFlow,
        &[
            "NetCashFromOperatingActivities",
            "NetCashProvidedByUsedInOperatingActivities",
            "CashFlowFromOperatingActivities",
            "NetCashGeneratedFromOperatingActivities",
            "CashGeneratedFromOperations",
            "CashFlowsFromUsedInOperatingActivities",
        ],
    ),
    (FactField::FreeCashFlow, &["FreeCashFlow"]),
    (FactField::TotalDebt, &["TotalBorrowings", "TotalDebt", "Borrowings"]),
    (
        FactField::LongTermDebt,
        &["LongTermBorrowings", "BorrowingsNonCurrent", "BorrowingsNoncurrent"],
    ),
    (
        FactField::ShortTermDebt,
        &["ShortTermBorrowings", "BorrowingsCurrent", "CurrentMaturitiesOfLongTermDebt"],
    ),
    (
        FactField::InterestExpense,
        &[
            "FinanceCosts",
            "InterestExpense",
            "FinanceCost",
            "InterestExpenses",
            "BorrowingCosts",
            "FinanceCostsInterestExpense",
            "InterestExpended",
        ],
    ),
    (
        FactField::Capex,
        &[
            "PurchaseOfPropertyPlantAndEquipment",
            "CapitalExpenditure",
            "PurchaseOfTangibleAssets",
            "AdditionsToFixedAssets",
            "PurchaseOfPropertyPlantAndEquipmentClassifiedAsInvestingActivities",
        ],
    ),
];

/// Reporting-period metadata facts, used when a context id has no formal context
const PERIOD_START_TAGS: &[&str] = &[
    "DateOfStartOfReportingPeriod",
    "ReportingPeriodStartDate",
    "StartDateOfReportingPeriod",
];
const PERIOD_END_TAGS: &[&str] = &[
    "DateOfEndOfReportingPeriod",
    "ReportingPeriodEndDate",
    "EndDateOfReportingPeriod",
];

/// Duration classification bounds (days)
const ANNUAL_MIN_DAYS: i64 = 300;
const QUARTERLY_MAX_DAYS: i64 = 100;

fn alias_lookup(tag: &str) -> Option<(FactField, usize)> {
    TAG_ALIASES.iter().find_map(|(field, aliases)| {
        aliases
            .iter()
            .position(|alias| *alias == tag)
            .map(|rank| (*field, rank))
    })
}

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextPeriod {
    Instant(NaiveDate),
    Duration { start: NaiveDate, end: NaiveDate },
}

impl ContextPeriod {
    /// Instant date, or the end of a duration
    pub fn reference_date(&self) -> NaiveDate {
        match self {
            ContextPeriod::Instant(date) => *date,
            ContextPeriod::Duration { end, .. } => *end,
        }
    }
}

/// One matched numeric fact. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingFact {
    pub tag: String,
    pub field: FactField,
    pub value: f64,
    pub context_id: String,
    pub period: ContextPeriod,
}

/// One reporting period assembled from a filing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPeriod {
    pub period_end: NaiveDate,
    pub fiscal: FiscalPeriod,
    pub revenue: Option<f64>,
    pub net_profit: Option<f64>,
    pub profit_before_tax: Option<f64>,
    pub operating_cash_flow: Option<f64>,
    pub free_cash_flow: Option<f64>,
    pub total_debt: Option<f64>,
    pub interest_expense: Option<f64>,
}

impl ExtractedPeriod {
    pub fn period_type(&self) -> PeriodType {
        self.fiscal.period_type()
    }

    /// Tag with entity and consolidation status
    pub fn into_record(self, entity_id: &str, is_consolidated: bool) -> CanonicalRecord {
        let mut record = CanonicalRecord::new(entity_id, self.fiscal);
        record.period_end = Some(self.period_end);
        record.revenue = self.revenue;
        record.net_profit = self.net_profit;
        record.profit_before_tax = self.profit_before_tax;
        record.operating_cash_flow = self.operating_cash_flow;
        record.free_cash_flow = self.free_cash_flow;
        record.total_debt = self.total_debt;
        record.interest_expense = self.interest_expense;
        record.is_consolidated = is_consolidated;
        record
    }
}

/// StatementParser - turns raw filing bytes into periods
///
/// The reconciler only knows this trait, so alternative formats plug in
/// without touching ingestion.
pub trait StatementParser: Send + Sync {
    fn extract(&self, content: &[u8]) -> PipelineResult<Vec<ExtractedPeriod>>;

    fn version(&self) -> &str {
        "1.0"
    }
}

// ============================================================================
// XBRL PARSER
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct XbrlParser;

impl XbrlParser {
    pub fn new() -> Self {
        XbrlParser
    }

    /// Lenient entry point: malformed XML logs a warning and yields nothing
    pub fn parse(&self, content: &[u8]) -> Vec<ExtractedPeriod> {
        match self.try_parse(content) {
            Ok(periods) => periods,
            Err(e) => {
                warn!(error = %e, bytes = content.len(), "Skipping unparsable filing");
                Vec::new()
            }
        }
    }

    pub fn try_parse(&self, content: &[u8]) -> PipelineResult<Vec<ExtractedPeriod>> {
        let facts = self.extract_facts(content)?;
        let periods = assemble_periods(&facts);
        debug!(facts = facts.len(), periods = periods.len(), "Extracted filing");
        Ok(periods)
    }

    /// Matched facts in priority order: non-dimensional contexts first,
    /// then alias rank, then document order. At most one fact per
    /// (field, context).
    pub fn extract_facts(&self, content: &[u8]) -> PipelineResult<Vec<FilingFact>> {
        let scan = scan_document(content)?;
        let contexts = resolve_contexts(&scan);

        let mut candidates: Vec<(bool, usize, usize, FilingFact)> = Vec::new();
        for (order, node) in scan.nodes.iter().enumerate() {
            let Some((field, rank)) = alias_lookup(&node.name) else {
                continue;
            };
            let Some(context) = contexts.get(&node.context_ref) else {
                continue;
            };
            let Some(period) = context.period else {
                continue;
            };
            let Some(value) = parse_number(&node.text) else {
                continue;
            };

            candidates.push((
                context.dimensional,
                rank,
                order,
                FilingFact {
                    tag: node.name.clone(),
                    field,
                    value,
                    context_id: node.context_ref.clone(),
                    period,
                },
            ));
        }

        candidates.sort_by_key(|(dimensional, rank, order, _)| (*dimensional, *rank, *order));

        let mut seen: HashSet<(FactField, String)> = HashSet::new();
        let facts = candidates
            .into_iter()
            .filter_map(|(_, _, _, fact)| {
                seen.insert((fact.field, fact.context_id.clone())).then_some(fact)
            })
            .collect();

        Ok(facts)
    }
}

impl StatementParser for XbrlParser {
    fn extract(&self, content: &[u8]) -> PipelineResult<Vec<ExtractedPeriod>> {
        self.try_parse(content)
    }
}

// ============================================================================
// DOCUMENT SCAN
// ============================================================================

/// Element carrying a contextRef, with its text content
#[derive(Debug, Clone)]
struct RawNode {
    name: String,
    context_ref: String,
    text: String,
}

#[derive(Debug, Clone, Default)]
struct ContextDef {
    instant: Option<NaiveDate>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    dimensional: bool,
}

impl ContextDef {
    fn period(&self) -> Option<ContextPeriod> {
        if let Some(date) = self.instant {
            return Some(ContextPeriod::Instant(date));
        }
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(ContextPeriod::Duration { start, end }),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct DocumentScan {
    contexts: HashMap<String, ContextDef>,
    nodes: Vec<RawNode>,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedContext {
    period: Option<ContextPeriod>,
    dimensional: bool,
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart, name: &[u8]) -> PipelineResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| PipelineError::ParseFailure(err.to_string()))?;
        if attr.key.local_name().as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|err| PipelineError::ParseFailure(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn scan_document(content: &[u8]) -> PipelineResult<DocumentScan> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);

    let mut scan = DocumentScan::default();
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut current_context: Option<(String, ContextDef)> = None;
    let mut pending: Option<RawNode> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                text.clear();
                // A fact with child elements is not a leaf value
                pending = None;

                match name.as_str() {
                    "context" => {
                        let id = attribute(&e, b"id")?.unwrap_or_default();
                        current_context = Some((id, ContextDef::default()));
                    }
                    "segment" | "scenario" => {
                        if let Some((_, def)) = current_context.as_mut() {
                            def.dimensional = true;
                        }
                    }
                    _ => {
                        if let Some(context_ref) = attribute(&e, b"contextRef")? {
                            pending = Some(RawNode {
                                name,
                                context_ref,
                                text: String::new(),
                            });
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let unescaped = t
                    .unescape()
                    .map_err(|err| PipelineError::ParseFailure(err.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

                match name.as_str() {
                    "context" => {
                        if let Some((id, def)) = current_context.take() {
                            scan.contexts.insert(id, def);
                        }
                    }
                    "instant" | "startDate" | "endDate" if current_context.is_some() => {
                        if let Some((_, def)) = current_context.as_mut() {
                            let date = parse_date(&text);
                            match name.as_str() {
                                "instant" => def.instant = date,
                                "startDate" => def.start = date,
                                _ => def.end = date,
                            }
                        }
                    }
                    _ => {
                        if let Some(mut node) = pending.take() {
                            if node.name == name {
                                node.text = text.clone();
                                scan.nodes.push(node);
                            }
                        }
                    }
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::ParseFailure(format!(
                    "XML error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            Ok(_) => {}
        }
        buf.clear();
    }

    Ok(scan)
}

/// Formal contexts plus contexts inferred from reporting-period metadata
fn resolve_contexts(scan: &DocumentScan) -> HashMap<String, ResolvedContext> {
    let mut resolved: HashMap<String, ResolvedContext> = scan
        .contexts
        .iter()
        .map(|(id, def)| {
            (
                id.clone(),
                ResolvedContext {
                    period: def.period(),
                    dimensional: def.dimensional,
                },
            )
        })
        .collect();

    let mut starts: HashMap<&str, NaiveDate> = HashMap::new();
    let mut ends: HashMap<&str, NaiveDate> = HashMap::new();
    for node in &scan.nodes {
        if PERIOD_START_TAGS.contains(&node.name.as_str()) {
            if let Some(date) = parse_date(&node.text) {
                starts.entry(node.context_ref.as_str()).or_insert(date);
            }
        } else if PERIOD_END_TAGS.contains(&node.name.as_str()) {
            if let Some(date) = parse_date(&node.text) {
                ends.entry(node.context_ref.as_str()).or_insert(date);
            }
        }
    }

    for (context_ref, end) in ends {
        let has_formal_period = resolved
            .get(context_ref)
            .map(|ctx| ctx.period.is_some())
            .unwrap_or(false);
        if has_formal_period {
            continue;
        }

        let period = match starts.get(context_ref) {
            Some(start) => ContextPeriod::Duration { start: *start, end },
            None => ContextPeriod::Instant(end),
        };
        debug!(context = context_ref, ?period, "Inferred context from reporting-period metadata");
        resolved.insert(
            context_ref.to_string(),
            ResolvedContext {
                period: Some(period),
                dimensional: false,
            },
        );
    }

    resolved
}

// ============================================================================
// ASSEMBLY
// ============================================================================

fn classify_duration(start: NaiveDate, end: NaiveDate) -> Option<bool> {
    let days = (end - start).num_days();
    if days > ANNUAL_MIN_DAYS {
        Some(true)
    } else if days < QUARTERLY_MAX_DAYS {
        Some(false)
    } else {
        None
    }
}

/// Group facts into (end date, is_annual) buckets and build periods.
/// Facts must arrive in priority order; the first value per bucket field wins.
fn assemble_periods(facts: &[FilingFact]) -> Vec<ExtractedPeriod> {
    let mut buckets: HashMap<(NaiveDate, bool), HashMap<FactField, f64>> = HashMap::new();

    for fact in facts {
        if let ContextPeriod::Duration { start, end } = fact.period {
            let Some(is_annual) = classify_duration(start, end) else {
                continue;
            };
            buckets
                .entry((end, is_annual))
                .or_default()
                .entry(fact.field)
                .or_insert(fact.value);
        }
    }

    // Balance-sheet instants fill every duration bucket ending on that date
    for fact in facts {
        if let ContextPeriod::Instant(date) = fact.period {
            for is_annual in [true, false] {
                if let Some(fields) = buckets.get_mut(&(date, is_annual)) {
                    fields.entry(fact.field).or_insert(fact.value);
                }
            }
        }
    }

    let mut periods: Vec<ExtractedPeriod> = buckets
        .into_iter()
        .map(|((end, is_annual), fields)| build_period(end, is_annual, &fields))
        .filter(|p| p.revenue.is_some() || p.net_profit.is_some() || p.profit_before_tax.is_some())
        .collect();

    periods.sort_by(|a, b| {
        b.period_end
            .cmp(&a.period_end)
            .then_with(|| a.fiscal.quarter.cmp(&b.fiscal.quarter))
    });
    periods
}

fn build_period(end: NaiveDate, is_annual: bool, fields: &HashMap<FactField, f64>) -> ExtractedPeriod {
    let get = |field: FactField| fields.get(&field).copied();

    let revenue = match (get(FactField::Revenue), get(FactField::OtherIncome)) {
        (Some(core), Some(other)) => Some(core + other),
        (core, _) => core,
    };

    let operating_cash_flow = get(FactField::OperatingCashFlow);
    let free_cash_flow = get(FactField::FreeCashFlow).or_else(|| {
        operating_cash_flow.map(|ocf| ocf - get(FactField::Capex).map(f64::abs).unwrap_or(0.0))
    });

    let total_debt = get(FactField::TotalDebt).or_else(|| {
        match (get(FactField::LongTermDebt), get(FactField::ShortTermDebt)) {
            (None, None) => None,
            (long, short) => Some(long.unwrap_or(0.0) + short.unwrap_or(0.0)),
        }
    });

    ExtractedPeriod {
        period_end: end,
        fiscal: FiscalPeriod::from_period_end(end, is_annual),
        revenue,
        net_profit: get(FactField::NetProfit),
        profit_before_tax: get(FactField::ProfitBeforeTax),
        operating_cash_flow,
        free_cash_flow,
        total_debt,
        interest_expense: get(FactField::InterestExpense),
    }
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

/// "1,234.5", " 1 234 ", "(500)" → numbers; anything else → None
fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let negative = cleaned.starts_with('(') && cleaned.ends_with(')');
    let body = cleaned.trim_start_matches('(').trim_end_matches(')');

    body.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| if negative { -v } else { v })
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    // ISO dates, possibly with a time suffix
    if let Some(date) = raw
        .get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
    {
        return Some(date);
    }

    ["%d-%m-%Y", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

// ============================================================================
// TESTS
// ============================================================================
