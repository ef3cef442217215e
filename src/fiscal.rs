// 📅 Fiscal Calendar - April to March fiscal years
//
// Quarter mapping by period-end month:
//   Apr-Jun → Q1, Jul-Sep → Q2, Oct-Dec → Q3, Jan-Mar → Q4
// A quarter ending after March belongs to the NEXT calendar year's fiscal year.
// Annual periods use quarter 0 and the calendar year of their end date.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// PERIOD TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Annual,
    Quarterly,
}

impl PeriodType {
    /// Value stored in the flags table
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Annual => "annual",
            PeriodType::Quarterly => "quarterly",
        }
    }

    /// Listing parameter understood by filing sources
    pub fn listing_name(&self) -> &'static str {
        match self {
            PeriodType::Annual => "Annual",
            PeriodType::Quarterly => "Quarterly",
        }
    }

    pub fn parse(s: &str) -> Option<PeriodType> {
        match s.to_lowercase().as_str() {
            "annual" => Some(PeriodType::Annual),
            "quarterly" => Some(PeriodType::Quarterly),
            _ => None,
        }
    }
}

// ============================================================================
// FISCAL PERIOD
// ============================================================================

/// (fiscal year, fiscal quarter). Quarter 0 = full fiscal year.
///
/// Ordering is lexicographic on (year, quarter), which is also the order
/// used for the unique keys in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub year: i32,
    pub quarter: u8,
}

impl FiscalPeriod {
    pub fn new(year: i32, quarter: u8) -> Self {
        FiscalPeriod { year, quarter }
    }

    pub fn annual(year: i32) -> Self {
        FiscalPeriod { year, quarter: 0 }
    }

    pub fn is_annual(&self) -> bool {
        self.quarter == 0
    }

    pub fn period_type(&self) -> PeriodType {
        if self.is_annual() {
            PeriodType::Annual
        } else {
            PeriodType::Quarterly
        }
    }

    /// Label a reporting period by its end date
    pub fn from_period_end(end: NaiveDate, is_annual: bool) -> Self {
        if is_annual {
            return FiscalPeriod::annual(end.year());
        }
        let year = if end.month() > 3 { end.year() + 1 } else { end.year() };
        FiscalPeriod::new(year, quarter_for_month(end.month()))
    }

    /// Fiscal quarter containing a wall-clock date
    pub fn current(today: NaiveDate) -> Self {
        FiscalPeriod::from_period_end(today, false)
    }

    pub fn previous_quarter(&self) -> Self {
        match self.quarter {
            0 | 1 => FiscalPeriod::new(self.year - 1, 4),
            q => FiscalPeriod::new(self.year, q - 1),
        }
    }

    /// Position on the quarterly timeline. A full-year period closes with Q4.
    pub fn timeline_position(&self) -> FiscalPeriod {
        if self.is_annual() {
            FiscalPeriod::new(self.year, 4)
        } else {
            *self
        }
    }

    /// Short label: "FY2024" for annual, "FY2025 Q1" for quarters
    pub fn label(&self) -> String {
        if self.is_annual() {
            format!("FY{}", self.year)
        } else {
            format!("FY{} Q{}", self.year, self.quarter)
        }
    }
}

impl fmt::Display for FiscalPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

pub fn quarter_for_month(month: u32) -> u8 {
    match month {
        4..=6 => 1,
        7..=9 => 2,
        10..=12 => 3,
        _ => 4,
    }
}

/// The `count` fiscal quarters ending with the one containing `today`,
/// oldest first.
pub fn trailing_quarters(today: NaiveDate, count: usize) -> Vec<FiscalPeriod> {
    trailing_from(FiscalPeriod::current(today), count)
}

/// The `count` quarters ending with `latest`, oldest first.
pub fn trailing_from(latest: FiscalPeriod, count: usize) -> Vec<FiscalPeriod> {
    let mut periods = Vec::with_capacity(count);
    let mut cursor = latest.timeline_position();
    for _ in 0..count {
        periods.push(cursor);
        cursor = cursor.previous_quarter();
    }
    periods.reverse();
    periods
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_quarter_ending_june_belongs_to_next_fiscal_year() {
        let p = FiscalPeriod::from_period_end(date(2024, 6, 30), false);
        assert_eq!(p, FiscalPeriod::new(2025, 1));
    }

    #[test]
    fn test_march_end_quarterly_vs_annual() {
        assert_eq!(
            FiscalPeriod::from_period_end(date(2024, 3, 31), false),
            FiscalPeriod::new(2024, 4)
        );
        assert_eq!(
            FiscalPeriod::from_period_end(date(2024, 3, 31), true),
            FiscalPeriod::annual(2024)
        );
    }

    #[test]
    fn test_month_to_quarter_mapping() {
        assert_eq!(quarter_for_month(4), 1);
        assert_eq!(quarter_for_month(9), 2);
        assert_eq!(quarter_for_month(12), 3);
        assert_eq!(quarter_for_month(1), 4);
        assert_eq!(quarter_for_month(3), 4);
    }

    #[test]
    fn test_previous_quarter_wraps_fiscal_year() {
        assert_eq!(FiscalPeriod::new(2025, 1).previous_quarter(), FiscalPeriod::new(2024, 4));
        assert_eq!(FiscalPeriod::new(2025, 3).previous_quarter(), FiscalPeriod::new(2025, 2));
    }

    #[test]
    fn test_trailing_quarters_oldest_first() {
        // 2024-11-15 sits in Q3 of FY2025
        let periods = trailing_quarters(date(2024, 11, 15), 4);
        assert_eq!(
            periods,
            vec![
                FiscalPeriod::new(2024, 4),
                FiscalPeriod::new(2025, 1),
                FiscalPeriod::new(2025, 2),
                FiscalPeriod::new(2025, 3),
            ]
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(FiscalPeriod::annual(2024).label(), "FY2024");
        assert_eq!(FiscalPeriod::new(2025, 2).to_string(), "FY2025 Q2");
    }

    #[test]
    fn test_annual_sits_at_q4_on_timeline() {
        assert_eq!(FiscalPeriod::annual(2023).timeline_position(), FiscalPeriod::new(2023, 4));
        assert!(FiscalPeriod::annual(2023).timeline_position() < FiscalPeriod::new(2024, 1));
    }
}
