//! reconcile.rs: cross-dataset consistency checks.
//!
//! Findings are data, never exceptions: an `error` finding marks the run's
//! evidence as internally inconsistent, becomes a limitation narrative in the
//! methods section, and resurfaces through the validator, but it does not by
//! itself halt the pipeline.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::datasets::{period_of, NormalizedPack, SurveillancePeriod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationFinding {
    pub severity: FindingSeverity,
    pub message: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub passed: bool,
    pub findings: Vec<ReconciliationFinding>,
    pub limitations: Vec<String>,
}

pub fn reconcile(pack: &NormalizedPack, period: &SurveillancePeriod) -> ReconciliationResult {
    let mut findings = Vec::new();
    let mut limitations = Vec::new();

    // Denominator dataset must exist before any rate can be computed.
    if pack.sales_exposure.is_empty() {
        findings.push(ReconciliationFinding {
            severity: FindingSeverity::Error,
            message: "sales/exposure dataset is empty; complaint rates have no denominator"
                .to_string(),
            context: json!({}),
        });
        limitations
            .push("No sales/exposure data was provided; rate analytics are unavailable".to_string());
    }

    // Complaint dates must sit inside the surveillance period.
    let out_of_period: Vec<String> = pack
        .complaints
        .iter()
        .filter(|row| row.date < period.start || row.date > period.end)
        .map(|row| {
            format!(
                "{} ({})",
                row.complaint_id.as_deref().unwrap_or("<unidentified>"),
                row.date
            )
        })
        .collect();
    if !out_of_period.is_empty() {
        findings.push(ReconciliationFinding {
            severity: FindingSeverity::Error,
            message: format!(
                "{} complaint(s) dated outside the surveillance period",
                out_of_period.len()
            ),
            context: json!({
                "periodStart": period.start,
                "periodEnd": period.end,
                "complaints": out_of_period,
            }),
        });
        limitations.push(
            "Some complaints are dated outside the surveillance period and may distort monthly rates"
                .to_string(),
        );
    }

    // Every complaint month needs an exposure month behind it.
    let exposure_months: BTreeSet<&str> = pack
        .sales_exposure
        .iter()
        .map(|row| row.period.as_str())
        .collect();
    let uncovered: BTreeSet<String> = pack
        .complaints
        .iter()
        .map(|row| period_of(&row.date))
        .filter(|month| !exposure_months.contains(month.as_str()))
        .collect();
    if !uncovered.is_empty() {
        findings.push(ReconciliationFinding {
            severity: FindingSeverity::Warning,
            message: format!("{} complaint month(s) have no exposure data", uncovered.len()),
            context: json!({ "months": &uncovered }),
        });
        limitations.push(format!(
            "Months without exposure data carry a zero rate: {}",
            uncovered.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    // Serious complaints should be mirrored by the incident dataset.
    let serious_complaints = pack.complaints.iter().filter(|row| row.serious).count();
    if serious_complaints != pack.serious_incidents.len() {
        findings.push(ReconciliationFinding {
            severity: FindingSeverity::Warning,
            message: "serious complaint count differs from the serious incident dataset".to_string(),
            context: json!({
                "seriousComplaints": serious_complaints,
                "seriousIncidents": pack.serious_incidents.len(),
            }),
        });
    }

    // Reportable complaints should be mirrored by vigilance reports.
    let reportable_complaints = pack.complaints.iter().filter(|row| row.reportable).count();
    if reportable_complaints != pack.vigilance.len() {
        findings.push(ReconciliationFinding {
            severity: FindingSeverity::Warning,
            message: "reportable complaint count differs from the vigilance dataset".to_string(),
            context: json!({
                "reportableComplaints": reportable_complaints,
                "vigilanceReports": pack.vigilance.len(),
            }),
        });
    }

    // Countries that sold units but have no distribution record.
    let distribution_countries: BTreeSet<&str> =
        pack.distribution.iter().map(|row| row.country.as_str()).collect();
    let unlisted: BTreeSet<&str> = pack
        .sales_exposure
        .iter()
        .map(|row| row.country.as_str())
        .filter(|country| !distribution_countries.contains(country))
        .collect();
    if !unlisted.is_empty() && !pack.distribution.is_empty() {
        findings.push(ReconciliationFinding {
            severity: FindingSeverity::Info,
            message: "sales countries absent from the distribution dataset".to_string(),
            context: json!({ "countries": unlisted }),
        });
    }

    if pack.complaints.is_empty() {
        findings.push(ReconciliationFinding {
            severity: FindingSeverity::Warning,
            message: "complaint dataset is empty".to_string(),
            context: json!({}),
        });
        limitations.push("No complaints were recorded in the surveillance period".to_string());
    }

    ReconciliationResult {
        passed: !findings
            .iter()
            .any(|finding| finding.severity == FindingSeverity::Error),
        findings,
        limitations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::{ComplaintRow, SalesExposureRow};
    use chrono::NaiveDate;

    fn period() -> SurveillancePeriod {
        SurveillancePeriod {
            start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
        }
    }

    fn pack_with_exposure() -> NormalizedPack {
        let mut pack = NormalizedPack::default();
        pack.sales_exposure.push(SalesExposureRow {
            period: "2023-01".to_string(),
            country: "DE".to_string(),
            units_sold: 100,
        });
        pack
    }

    #[test]
    fn out_of_period_complaint_is_an_error_finding() {
        let mut pack = pack_with_exposure();
        pack.complaints.push(ComplaintRow {
            complaint_id: Some("C-1".to_string()),
            date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            country: "DE".to_string(),
            problem_code: "P1".to_string(),
            harm_code: "H1".to_string(),
            root_cause: None,
            serious: false,
            reportable: false,
            description: None,
        });
        let result = reconcile(&pack, &period());
        assert!(!result.passed);
        assert!(result
            .findings
            .iter()
            .any(|f| f.severity == FindingSeverity::Error && f.message.contains("outside")));
        assert!(result.limitations.iter().any(|l| l.contains("outside")));
    }

    #[test]
    fn missing_exposure_month_is_a_warning_with_limitation() {
        let mut pack = pack_with_exposure();
        pack.complaints.push(ComplaintRow {
            complaint_id: None,
            date: NaiveDate::from_ymd_opt(2023, 3, 5).unwrap(),
            country: "DE".to_string(),
            problem_code: "P1".to_string(),
            harm_code: "H1".to_string(),
            root_cause: None,
            serious: false,
            reportable: false,
            description: None,
        });
        let result = reconcile(&pack, &period());
        assert!(result.passed);
        assert!(result.limitations.iter().any(|l| l.contains("2023-03")));
    }

    #[test]
    fn empty_exposure_dataset_fails_reconciliation() {
        let result = reconcile(&NormalizedPack::default(), &period());
        assert!(!result.passed);
        assert!(result
            .findings
            .iter()
            .any(|f| f.severity == FindingSeverity::Error && f.message.contains("denominator")));
    }
}
