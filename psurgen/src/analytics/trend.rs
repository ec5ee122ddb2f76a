//! trend.rs: statistical process control over monthly complaint rates.
//!
//! Builds the monthly series from the union of complaint and exposure months,
//! derives a 3-sigma control limit, evaluates Western Electric rules 1-4, and
//! reaches a trend determination with a reproducible justification.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::datasets::{period_of, ComplaintRow, SalesExposureRow};

use super::{derived_input, mean_and_std_dev, rate_per_thousand, round4, AnalyticType, DerivedInputRef};

const TREND_KERNEL: &str = "spc_trend/v1";

/// Minimum number of monthly points for a conclusive determination.
pub const MIN_TREND_POINTS: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyPoint {
    pub period: String,
    pub complaints: u64,
    pub units_sold: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleViolation {
    pub rule: String,
    pub description: String,
    pub periods: Vec<String>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendDetermination {
    NoTrend,
    TrendDetected,
    Inconclusive,
}

impl TrendDetermination {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDetermination::NoTrend => "NO_TREND",
            TrendDetermination::TrendDetected => "TREND_DETECTED",
            TrendDetermination::Inconclusive => "INCONCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendResult {
    pub monthly_series: Vec<MonthlyPoint>,
    pub mean: f64,
    pub std_dev: f64,
    pub ucl: f64,
    pub western_electric_violations: Vec<RuleViolation>,
    pub determination: TrendDetermination,
    pub justification: String,
    pub limitations: Vec<String>,
}

/// Build the ascending monthly series over the union of months present in
/// complaints and exposure. Months without units record a zero rate and a
/// limitation rather than a NaN.
fn build_monthly_series(
    complaints: &[ComplaintRow],
    exposure: &[SalesExposureRow],
) -> (Vec<MonthlyPoint>, Vec<String>) {
    let mut complaint_counts: BTreeMap<String, u64> = BTreeMap::new();
    for row in complaints {
        *complaint_counts.entry(period_of(&row.date)).or_insert(0) += 1;
    }
    let mut units: BTreeMap<String, u64> = BTreeMap::new();
    for row in exposure {
        *units.entry(row.period.clone()).or_insert(0) += row.units_sold;
    }

    let mut months: Vec<String> = complaint_counts
        .keys()
        .chain(units.keys())
        .cloned()
        .collect();
    months.sort();
    months.dedup();

    let mut limitations = Vec::new();
    let series = months
        .into_iter()
        .map(|period| {
            let complaints = complaint_counts.get(&period).copied().unwrap_or(0);
            let units_sold = units.get(&period).copied().unwrap_or(0);
            if units_sold == 0 {
                limitations.push(format!(
                    "Month {period}: no units sold recorded; complaint rate reported as 0"
                ));
            }
            MonthlyPoint {
                rate: rate_per_thousand(complaints, units_sold),
                period,
                complaints,
                units_sold,
            }
        })
        .collect();
    (series, limitations)
}

/// Western Electric rules 1-4 over the rate series. Sigma zero or fewer than
/// two points yields no violations. Windows are scanned left to right; a rule
/// may emit more than once.
fn western_electric(series: &[MonthlyPoint], mean: f64, sigma: f64) -> Vec<RuleViolation> {
    let mut violations = Vec::new();
    if sigma == 0.0 || series.len() < 2 {
        return violations;
    }

    // Rule 1: single point beyond three sigma.
    for point in series {
        if (point.rate - mean).abs() > 3.0 * sigma {
            violations.push(RuleViolation {
                rule: "Rule 1".to_string(),
                description: format!(
                    "Point beyond 3 sigma: rate {} against mean {} (sigma {})",
                    point.rate,
                    round4(mean),
                    round4(sigma)
                ),
                periods: vec![point.period.clone()],
                values: vec![point.rate],
            });
        }
    }

    // Rule 2: two of three consecutive points strictly beyond two sigma on
    // the same side.
    for window in series.windows(3) {
        for (side, threshold_hit) in [
            ("above +2 sigma", window.iter().filter(|p| p.rate > mean + 2.0 * sigma).count()),
            ("below -2 sigma", window.iter().filter(|p| p.rate < mean - 2.0 * sigma).count()),
        ] {
            if threshold_hit >= 2 {
                violations.push(RuleViolation {
                    rule: "Rule 2".to_string(),
                    description: format!("2 of 3 consecutive points {side}"),
                    periods: window.iter().map(|p| p.period.clone()).collect(),
                    values: window.iter().map(|p| p.rate).collect(),
                });
            }
        }
    }

    // Rule 3: four of five consecutive points strictly beyond one sigma on
    // the same side.
    for window in series.windows(5) {
        for (side, threshold_hit) in [
            ("above +1 sigma", window.iter().filter(|p| p.rate > mean + sigma).count()),
            ("below -1 sigma", window.iter().filter(|p| p.rate < mean - sigma).count()),
        ] {
            if threshold_hit >= 4 {
                violations.push(RuleViolation {
                    rule: "Rule 3".to_string(),
                    description: format!("4 of 5 consecutive points {side}"),
                    periods: window.iter().map(|p| p.period.clone()).collect(),
                    values: window.iter().map(|p| p.rate).collect(),
                });
            }
        }
    }

    // Rule 4: eight consecutive points on one side of the mean.
    for window in series.windows(8) {
        let all_above = window.iter().all(|p| p.rate > mean);
        let all_below = window.iter().all(|p| p.rate < mean);
        if all_above || all_below {
            violations.push(RuleViolation {
                rule: "Rule 4".to_string(),
                description: format!(
                    "8 consecutive points {} the mean",
                    if all_above { "above" } else { "below" }
                ),
                periods: window.iter().map(|p| p.period.clone()).collect(),
                values: window.iter().map(|p| p.rate).collect(),
            });
        }
    }

    violations
}

pub fn trend_analysis(
    complaints: &[ComplaintRow],
    exposure: &[SalesExposureRow],
) -> (TrendResult, DerivedInputRef) {
    let (series, mut limitations) = build_monthly_series(complaints, exposure);

    let rates: Vec<f64> = series.iter().map(|point| point.rate).collect();
    let (mean, sigma) = mean_and_std_dev(&rates);
    let ucl = mean + 3.0 * sigma;

    let violations = western_electric(&series, mean, sigma);

    let total_complaints: u64 = series.iter().map(|point| point.complaints).sum();
    let determination = if total_complaints == 0 || series.len() < MIN_TREND_POINTS {
        TrendDetermination::Inconclusive
    } else if violations.is_empty() {
        TrendDetermination::NoTrend
    } else {
        TrendDetermination::TrendDetected
    };

    if total_complaints == 0 {
        limitations.push("No complaints recorded in the surveillance period".to_string());
    }

    let period_range = match (series.first(), series.last()) {
        (Some(first), Some(last)) => format!("{}..{}", first.period, last.period),
        _ => "none".to_string(),
    };
    let mut fired: Vec<&str> = violations.iter().map(|v| v.rule.as_str()).collect();
    fired.dedup();
    let rules_clause = if fired.is_empty() {
        "no Western Electric rules fired".to_string()
    } else {
        format!("Western Electric rules fired: {}", fired.join(", "))
    };
    let justification = format!(
        "Across {} monthly points ({period_range}): mean rate {} per 1,000 units, stdDev {}, UCL {}; {rules_clause}.",
        series.len(),
        round4(mean),
        round4(sigma),
        round4(ucl),
    );

    let result = TrendResult {
        monthly_series: series,
        mean: round4(mean),
        std_dev: round4(sigma),
        ucl: round4(ucl),
        western_electric_violations: violations,
        determination,
        justification,
        limitations,
    };
    let derived = derived_input(AnalyticType::Trend, "spc_trend", TREND_KERNEL);
    (result, derived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn month_complaints(year: i32, month: u32, count: u64) -> Vec<ComplaintRow> {
        (0..count)
            .map(|i| ComplaintRow {
                complaint_id: Some(format!("C-{year}-{month}-{i}")),
                date: NaiveDate::from_ymd_opt(year, month, 10).unwrap(),
                country: "DE".to_string(),
                problem_code: "P1".to_string(),
                harm_code: "H1".to_string(),
                root_cause: None,
                serious: false,
                reportable: false,
                description: None,
            })
            .collect()
    }

    fn flat_year(counts: &[u64]) -> (Vec<ComplaintRow>, Vec<SalesExposureRow>) {
        let mut complaints = Vec::new();
        let mut exposure = Vec::new();
        for (i, count) in counts.iter().enumerate() {
            let month = i as u32 + 1;
            complaints.extend(month_complaints(2024, month, *count));
            exposure.push(SalesExposureRow {
                period: format!("2024-{month:02}"),
                country: "DE".to_string(),
                units_sold: 1000,
            });
        }
        (complaints, exposure)
    }

    #[test]
    fn flat_series_yields_no_trend() {
        let (complaints, exposure) = flat_year(&[1; 12]);
        let (result, _) = trend_analysis(&complaints, &exposure);
        assert_eq!(result.mean, 1.0);
        assert_eq!(result.std_dev, 0.0);
        assert_eq!(result.ucl, 1.0);
        assert!(result.western_electric_violations.is_empty());
        assert_eq!(result.determination, TrendDetermination::NoTrend);
        assert!(result.monthly_series.iter().all(|p| p.rate == 1.0));
    }

    #[test]
    fn rule_1_spike_detects_trend() {
        let mut counts = [1u64; 12];
        counts[5] = 20;
        let (complaints, exposure) = flat_year(&counts);
        let (result, _) = trend_analysis(&complaints, &exposure);

        let rule_1: Vec<&RuleViolation> = result
            .western_electric_violations
            .iter()
            .filter(|v| v.rule == "Rule 1")
            .collect();
        assert_eq!(rule_1.len(), 1);
        assert_eq!(rule_1[0].periods, vec!["2024-06".to_string()]);
        assert_eq!(result.determination, TrendDetermination::TrendDetected);
        assert!(result.justification.contains("Rule 1"));

        // 11 months at 1.0 and one at 20.0 against 1,000 units each.
        let expected_mean = (11.0 + 20.0) / 12.0;
        assert_eq!(result.mean, round4(expected_mean));
        assert!(result.ucl > 18.0 && result.ucl < 19.0);
    }

    #[test]
    fn short_series_is_inconclusive() {
        let (complaints, exposure) = flat_year(&[2; 6]);
        let (result, _) = trend_analysis(&complaints, &exposure);
        assert_eq!(result.monthly_series.len(), 6);
        assert_eq!(result.determination, TrendDetermination::Inconclusive);
    }

    #[test]
    fn empty_complaints_are_inconclusive_with_zeroed_statistics() {
        let (result, _) = trend_analysis(&[], &[]);
        assert_eq!(result.mean, 0.0);
        assert_eq!(result.std_dev, 0.0);
        assert_eq!(result.ucl, 0.0);
        assert!(result.western_electric_violations.is_empty());
        assert_eq!(result.determination, TrendDetermination::Inconclusive);
    }

    #[test]
    fn zero_unit_month_records_limitation_not_nan() {
        let complaints = month_complaints(2024, 1, 3);
        let (result, _) = trend_analysis(&complaints, &[]);
        assert_eq!(result.monthly_series[0].rate, 0.0);
        assert!(result.limitations[0].contains("2024-01"));
    }

    #[test]
    fn constant_nonzero_rates_have_no_violations_when_sigma_is_zero() {
        let (complaints, exposure) = flat_year(&[3; 12]);
        let (result, _) = trend_analysis(&complaints, &exposure);
        assert_eq!(result.std_dev, 0.0);
        assert!(result.western_electric_violations.is_empty());
        assert_eq!(result.determination, TrendDetermination::NoTrend);
    }

    #[test]
    fn rule_4_fires_for_sustained_shift() {
        // Baseline months alternate around the mean, then eight straight
        // months sit above it.
        let counts = [1u64, 5, 1, 1, 4, 4, 4, 4, 4, 4, 4, 4];
        let (complaints, exposure) = flat_year(&counts);
        let (result, _) = trend_analysis(&complaints, &exposure);
        let rule_4: Vec<&RuleViolation> = result
            .western_electric_violations
            .iter()
            .filter(|v| v.rule == "Rule 4")
            .collect();
        assert_eq!(rule_4.len(), 1);
        assert_eq!(rule_4[0].periods.len(), 8);
        assert_eq!(rule_4[0].periods[0], "2024-05");
    }
}
