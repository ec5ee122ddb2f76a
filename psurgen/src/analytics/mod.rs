//! Analytics kernels: pure, deterministic aggregators over the qualified
//! datasets. Every invocation emits a derived-input reference so downstream
//! trace records can cite the exact computation that produced a number.

pub mod kernels;
pub mod trend;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provenance;

/// Analytic tags for derived inputs; annex builders and trace records filter
/// by these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticType {
    Exposure,
    ComplaintProfile,
    IncidentProfile,
    Capa,
    Fsca,
    Literature,
    Pmcf,
    Risk,
    Trend,
}

/// Reference to one kernel invocation. `code_hash` identifies the kernel
/// implementation via a version-tagged identifier, so a changed kernel is
/// visible in lineage even when its inputs are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedInputRef {
    pub id: Uuid,
    pub input_type: AnalyticType,
    pub formula: String,
    pub code_hash: String,
}

pub(crate) fn derived_input(input_type: AnalyticType, formula: &str, kernel_tag: &str) -> DerivedInputRef {
    DerivedInputRef {
        id: Uuid::new_v4(),
        input_type,
        formula: formula.to_string(),
        code_hash: provenance::sha256_hex(kernel_tag.as_bytes()),
    }
}

/// Reporting rounding: half away from zero, four decimals.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Render a reported number without trailing zeros (1.0 → "1", 2.5833 → "2.5833").
pub fn format_number(value: f64) -> String {
    let text = format!("{:.4}", value);
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

/// Complaint or incident rate per 1,000 units; zero denominator yields zero.
pub fn rate_per_thousand(events: u64, units: u64) -> f64 {
    if units == 0 {
        return 0.0;
    }
    round4(events as f64 / units as f64 * 1000.0)
}

/// Population mean and standard deviation (divide by N).
pub fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round4_is_half_away_from_zero() {
        assert_eq!(round4(0.00005), 0.0001);
        assert_eq!(round4(-0.00005), -0.0001);
        assert_eq!(round4(2.5832999), 2.5833);
    }

    #[test]
    fn zero_denominator_yields_zero_rate() {
        assert_eq!(rate_per_thousand(5, 0), 0.0);
        assert_eq!(rate_per_thousand(2, 1000), 2.0);
    }

    #[test]
    fn std_dev_is_population_form() {
        let (mean, std) = mean_and_std_dev(&[2.0, 4.0]);
        assert_eq!(mean, 3.0);
        assert_eq!(std, 1.0);
    }

    #[test]
    fn derived_inputs_pin_the_kernel_version() {
        let a = derived_input(AnalyticType::Trend, "spc_trend", "trend/v1");
        let b = derived_input(AnalyticType::Trend, "spc_trend", "trend/v1");
        assert_ne!(a.id, b.id);
        assert_eq!(a.code_hash, b.code_hash);
    }
}
