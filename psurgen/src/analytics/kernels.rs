//! The nine pure aggregators. Sorting is count-descending with ties broken by
//! insertion order, except period groupings, which sort ascending by key.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::datasets::{
    CapaRow, ComplaintRow, FscaRow, LiteratureRow, PmcfRow, RiskSummary, SalesExposureRow,
    SeriousIncidentRow,
};

use super::{derived_input, rate_per_thousand, round4, AnalyticType, DerivedInputRef};

const EXPOSURE_KERNEL: &str = "exposure_analytics/v1";
const COMPLAINT_KERNEL: &str = "complaint_analytics/v1";
const INCIDENT_KERNEL: &str = "incident_analytics/v1";
const CAPA_KERNEL: &str = "capa_analytics/v1";
const FSCA_KERNEL: &str = "fsca_analytics/v1";
const LITERATURE_KERNEL: &str = "literature_analytics/v1";
const PMCF_KERNEL: &str = "pmcf_analytics/v1";
const RISK_KERNEL: &str = "risk_analytics/v1";

/// Count occurrences keeping first-seen order, then sort by count descending.
/// The stable sort preserves insertion order among equal counts.
fn count_descending<'a, I>(keys: I) -> Vec<(String, u64)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, u64> = HashMap::new();
    for key in keys {
        if !counts.contains_key(key) {
            order.push(key.to_string());
        }
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }
    let mut result: Vec<(String, u64)> = order
        .into_iter()
        .map(|key| {
            let count = counts[&key];
            (key, count)
        })
        .collect();
    result.sort_by(|a, b| b.1.cmp(&a.1));
    result
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodUnits {
    pub period: String,
    pub units: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountryUnits {
    pub country: String,
    pub units: u64,
    pub share_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureAnalytics {
    pub total_units: u64,
    pub units_by_period: Vec<PeriodUnits>,
    pub units_by_country: Vec<CountryUnits>,
}

pub fn exposure_analytics(rows: &[SalesExposureRow]) -> (ExposureAnalytics, DerivedInputRef) {
    let total_units: u64 = rows.iter().map(|row| row.units_sold).sum();

    let mut by_period: BTreeMap<String, u64> = BTreeMap::new();
    for row in rows {
        *by_period.entry(row.period.clone()).or_insert(0) += row.units_sold;
    }

    let mut country_order: Vec<String> = Vec::new();
    let mut country_units: HashMap<String, u64> = HashMap::new();
    for row in rows {
        if !country_units.contains_key(&row.country) {
            country_order.push(row.country.clone());
        }
        *country_units.entry(row.country.clone()).or_insert(0) += row.units_sold;
    }
    let mut units_by_country: Vec<CountryUnits> = country_order
        .into_iter()
        .map(|country| {
            let units = country_units[&country];
            let share_percent = if total_units == 0 {
                0.0
            } else {
                (units as f64 * 1000.0 / total_units as f64).round() / 10.0
            };
            CountryUnits {
                country,
                units,
                share_percent,
            }
        })
        .collect();
    units_by_country.sort_by(|a, b| b.units.cmp(&a.units));

    let analytics = ExposureAnalytics {
        total_units,
        units_by_period: by_period
            .into_iter()
            .map(|(period, units)| PeriodUnits { period, units })
            .collect(),
        units_by_country,
    };
    let derived = derived_input(AnalyticType::Exposure, "exposure_rollup", EXPOSURE_KERNEL);
    (analytics, derived)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthCount {
    pub period: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyCount {
    pub key: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemCodeCount {
    pub code: String,
    pub count: u64,
    pub serious: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemHarmCell {
    pub problem_code: String,
    pub harm_code: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintAnalytics {
    pub total: u64,
    pub serious: u64,
    pub reportable: u64,
    pub by_month: Vec<MonthCount>,
    pub by_country: Vec<KeyCount>,
    pub by_problem_code: Vec<ProblemCodeCount>,
    pub by_harm_code: Vec<KeyCount>,
    pub by_root_cause: Vec<KeyCount>,
    pub problem_harm_matrix: Vec<ProblemHarmCell>,
}

pub fn complaint_analytics(rows: &[ComplaintRow]) -> (ComplaintAnalytics, DerivedInputRef) {
    let total = rows.len() as u64;
    let serious = rows.iter().filter(|row| row.serious).count() as u64;
    let reportable = rows.iter().filter(|row| row.reportable).count() as u64;

    let mut by_month: BTreeMap<String, u64> = BTreeMap::new();
    for row in rows {
        *by_month.entry(crate::datasets::period_of(&row.date)).or_insert(0) += 1;
    }

    let by_country = count_descending(rows.iter().map(|row| row.country.as_str()))
        .into_iter()
        .map(|(key, count)| KeyCount { key, count })
        .collect();

    let mut serious_by_code: HashMap<&str, u64> = HashMap::new();
    for row in rows.iter().filter(|row| row.serious) {
        *serious_by_code.entry(row.problem_code.as_str()).or_insert(0) += 1;
    }
    let by_problem_code = count_descending(rows.iter().map(|row| row.problem_code.as_str()))
        .into_iter()
        .map(|(code, count)| ProblemCodeCount {
            serious: serious_by_code.get(code.as_str()).copied().unwrap_or(0),
            code,
            count,
        })
        .collect();

    let by_harm_code = count_descending(rows.iter().map(|row| row.harm_code.as_str()))
        .into_iter()
        .map(|(key, count)| KeyCount { key, count })
        .collect();

    // Missing root cause rolls up under "Unclassified".
    let by_root_cause = count_descending(
        rows.iter()
            .map(|row| row.root_cause.as_deref().unwrap_or("Unclassified")),
    )
    .into_iter()
    .map(|(key, count)| KeyCount { key, count })
    .collect();

    let mut cell_order: Vec<(String, String)> = Vec::new();
    let mut cell_counts: HashMap<(String, String), u64> = HashMap::new();
    for row in rows {
        let cell = (row.problem_code.clone(), row.harm_code.clone());
        if !cell_counts.contains_key(&cell) {
            cell_order.push(cell.clone());
        }
        *cell_counts.entry(cell).or_insert(0) += 1;
    }
    let mut problem_harm_matrix: Vec<ProblemHarmCell> = cell_order
        .into_iter()
        .map(|(problem_code, harm_code)| {
            let count = cell_counts[&(problem_code.clone(), harm_code.clone())];
            ProblemHarmCell {
                problem_code,
                harm_code,
                count,
            }
        })
        .collect();
    problem_harm_matrix.sort_by(|a, b| b.count.cmp(&a.count));

    let analytics = ComplaintAnalytics {
        total,
        serious,
        reportable,
        by_month: by_month
            .into_iter()
            .map(|(period, count)| MonthCount { period, count })
            .collect(),
        by_country,
        by_problem_code,
        by_harm_code,
        by_root_cause,
        problem_harm_matrix,
    };
    let derived = derived_input(
        AnalyticType::ComplaintProfile,
        "complaint_rollup",
        COMPLAINT_KERNEL,
    );
    (analytics, derived)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentAnalytics {
    pub total: u64,
    pub by_country: Vec<KeyCount>,
    pub by_severity: Vec<KeyCount>,
    pub incident_rate: f64,
}

pub fn incident_analytics(
    rows: &[SeriousIncidentRow],
    total_units: u64,
) -> (IncidentAnalytics, DerivedInputRef) {
    let analytics = IncidentAnalytics {
        total: rows.len() as u64,
        by_country: count_descending(rows.iter().map(|row| row.country.as_str()))
            .into_iter()
            .map(|(key, count)| KeyCount { key, count })
            .collect(),
        by_severity: count_descending(rows.iter().map(|row| row.severity.as_str()))
            .into_iter()
            .map(|(key, count)| KeyCount { key, count })
            .collect(),
        incident_rate: rate_per_thousand(rows.len() as u64, total_units),
    };
    let derived = derived_input(
        AnalyticType::IncidentProfile,
        "incident_rollup",
        INCIDENT_KERNEL,
    );
    (analytics, derived)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapaAnalytics {
    pub total: u64,
    pub open: u64,
    pub closed: u64,
    /// Mean days from opening to closure; absent when nothing has closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_closure_days: Option<f64>,
    pub items: Vec<CapaRow>,
}

/// A CAPA counts as closed iff it carries a closure date; the status string
/// is informational only.
pub fn capa_analytics(rows: &[CapaRow]) -> (CapaAnalytics, DerivedInputRef) {
    let closed_rows: Vec<&CapaRow> = rows.iter().filter(|row| row.closed_date.is_some()).collect();
    let average_closure_days = if closed_rows.is_empty() {
        None
    } else {
        let total_days: i64 = closed_rows
            .iter()
            .filter_map(|row| {
                row.closed_date
                    .map(|closed| closed.signed_duration_since(row.opened_date).num_days())
            })
            .sum();
        Some(round4(total_days as f64 / closed_rows.len() as f64))
    };

    let analytics = CapaAnalytics {
        total: rows.len() as u64,
        open: (rows.len() - closed_rows.len()) as u64,
        closed: closed_rows.len() as u64,
        average_closure_days,
        items: rows.to_vec(),
    };
    let derived = derived_input(AnalyticType::Capa, "capa_rollup", CAPA_KERNEL);
    (analytics, derived)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FscaAnalytics {
    pub total: u64,
    pub completed: u64,
    pub ongoing: u64,
    pub actions: Vec<FscaRow>,
}

/// Status values other than completed/closed count as ongoing.
pub fn fsca_analytics(rows: &[FscaRow]) -> (FscaAnalytics, DerivedInputRef) {
    let completed = rows
        .iter()
        .filter(|row| {
            row.status.eq_ignore_ascii_case("completed") || row.status.eq_ignore_ascii_case("closed")
        })
        .count() as u64;
    let analytics = FscaAnalytics {
        total: rows.len() as u64,
        completed,
        ongoing: rows.len() as u64 - completed,
        actions: rows.to_vec(),
    };
    let derived = derived_input(AnalyticType::Fsca, "fsca_rollup", FSCA_KERNEL);
    (analytics, derived)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiteratureAnalytics {
    pub total: u64,
    pub relevant: u64,
    pub not_relevant: u64,
    pub citations: Vec<LiteratureRow>,
}

pub fn literature_analytics(rows: &[LiteratureRow]) -> (LiteratureAnalytics, DerivedInputRef) {
    let relevant = rows.iter().filter(|row| row.relevant).count() as u64;
    let analytics = LiteratureAnalytics {
        total: rows.len() as u64,
        relevant,
        not_relevant: rows.len() as u64 - relevant,
        citations: rows.to_vec(),
    };
    let derived = derived_input(
        AnalyticType::Literature,
        "literature_rollup",
        LITERATURE_KERNEL,
    );
    (analytics, derived)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmcfAnalytics {
    pub total: u64,
    pub completed: u64,
    pub ongoing: u64,
    pub activities: Vec<PmcfRow>,
}

/// Status values other than completed count as ongoing.
pub fn pmcf_analytics(rows: &[PmcfRow]) -> (PmcfAnalytics, DerivedInputRef) {
    let completed = rows
        .iter()
        .filter(|row| row.status.eq_ignore_ascii_case("completed"))
        .count() as u64;
    let analytics = PmcfAnalytics {
        total: rows.len() as u64,
        completed,
        ongoing: rows.len() as u64 - completed,
        activities: rows.to_vec(),
    };
    let derived = derived_input(AnalyticType::Pmcf, "pmcf_rollup", PMCF_KERNEL);
    (analytics, derived)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAnalytics {
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub risk_profile_changed: bool,
    pub prior_conclusion: String,
    pub current_conclusion: String,
}

/// Residual risk levels outside HIGH/MEDIUM/LOW are not counted. The profile
/// change flag is an exact string comparison of the two conclusions.
pub fn risk_analytics(summary: &RiskSummary) -> (RiskAnalytics, DerivedInputRef) {
    let level_count = |level: &str| {
        summary
            .risks
            .iter()
            .filter(|risk| risk.residual_risk_level.eq_ignore_ascii_case(level))
            .count() as u64
    };
    let analytics = RiskAnalytics {
        high: level_count("HIGH"),
        medium: level_count("MEDIUM"),
        low: level_count("LOW"),
        risk_profile_changed: summary.prior_conclusion != summary.current_conclusion,
        prior_conclusion: summary.prior_conclusion.clone(),
        current_conclusion: summary.current_conclusion.clone(),
    };
    let derived = derived_input(AnalyticType::Risk, "risk_profile", RISK_KERNEL);
    (analytics, derived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn complaint(date: (i32, u32, u32), country: &str, code: &str, harm: &str) -> ComplaintRow {
        ComplaintRow {
            complaint_id: None,
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            country: country.to_string(),
            problem_code: code.to_string(),
            harm_code: harm.to_string(),
            root_cause: None,
            serious: false,
            reportable: false,
            description: None,
        }
    }

    #[test]
    fn country_shares_round_to_one_decimal() {
        let rows = vec![
            SalesExposureRow {
                period: "2024-01".to_string(),
                country: "DE".to_string(),
                units_sold: 2,
            },
            SalesExposureRow {
                period: "2024-01".to_string(),
                country: "FR".to_string(),
                units_sold: 1,
            },
        ];
        let (analytics, _) = exposure_analytics(&rows);
        assert_eq!(analytics.total_units, 3);
        assert_eq!(analytics.units_by_country[0].country, "DE");
        assert_eq!(analytics.units_by_country[0].share_percent, 66.7);
        assert_eq!(analytics.units_by_country[1].share_percent, 33.3);
    }

    #[test]
    fn complaint_sorting_breaks_ties_by_insertion_order() {
        let rows = vec![
            complaint((2024, 1, 3), "FR", "P2", "H1"),
            complaint((2024, 1, 5), "DE", "P1", "H1"),
            complaint((2024, 2, 1), "DE", "P1", "H2"),
        ];
        let (analytics, _) = complaint_analytics(&rows);
        // FR and DE tie-break does not apply (DE has 2); P2 seen first ties P1? No: P1 has 2.
        assert_eq!(analytics.by_country[0].key, "DE");
        assert_eq!(analytics.by_problem_code[0].code, "P1");
        // H1 and H2: H1=2, H2=1.
        assert_eq!(analytics.by_harm_code[0].key, "H1");
        // Equal-count cells keep first-seen order.
        assert_eq!(analytics.problem_harm_matrix[0].count, 1);
        assert_eq!(analytics.problem_harm_matrix[0].problem_code, "P2");
    }

    #[test]
    fn missing_root_cause_is_unclassified() {
        let mut row = complaint((2024, 1, 3), "DE", "P1", "H1");
        row.root_cause = None;
        let (analytics, _) = complaint_analytics(&[row]);
        assert_eq!(analytics.by_root_cause[0].key, "Unclassified");
    }

    #[test]
    fn incident_rate_handles_zero_units() {
        let rows = vec![SeriousIncidentRow {
            incident_id: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            country: "DE".to_string(),
            severity: "major".to_string(),
            description: None,
        }];
        let (with_units, _) = incident_analytics(&rows, 2000);
        assert_eq!(with_units.incident_rate, 0.5);
        let (without_units, _) = incident_analytics(&rows, 0);
        assert_eq!(without_units.incident_rate, 0.0);
    }

    #[test]
    fn capa_closure_average_is_none_without_closures() {
        let open = CapaRow {
            capa_id: "CAPA-1".to_string(),
            opened_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            closed_date: None,
            status: "open".to_string(),
            description: "investigation".to_string(),
            linked_complaint_id: None,
        };
        let (analytics, _) = capa_analytics(&[open.clone()]);
        assert_eq!(analytics.average_closure_days, None);
        assert_eq!(analytics.open, 1);

        let mut closed = open;
        closed.closed_date = NaiveDate::from_ymd_opt(2024, 1, 11);
        let (analytics, _) = capa_analytics(&[closed]);
        assert_eq!(analytics.average_closure_days, Some(10.0));
        assert_eq!(analytics.closed, 1);
    }

    #[test]
    fn risk_profile_change_is_exact_string_compare() {
        let summary = RiskSummary {
            risks: vec![],
            prior_conclusion: "acceptable".to_string(),
            current_conclusion: "acceptable".to_string(),
        };
        let (unchanged, _) = risk_analytics(&summary);
        assert!(!unchanged.risk_profile_changed);

        let summary = RiskSummary {
            prior_conclusion: "acceptable".to_string(),
            current_conclusion: "Acceptable".to_string(),
            ..summary
        };
        let (changed, _) = risk_analytics(&summary);
        assert!(changed.risk_profile_changed);
    }
}
