//! datasets.rs: normalized evidence datasets and the pack manifest.
//!
//! Parsing and column auto-mapping happen in the out-of-scope loader; the
//! core receives these already-typed forms and only qualifies them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Canonical dataset targets a pack file can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalTarget {
    DeviceMaster,
    SalesExposure,
    Complaints,
    SeriousIncidents,
    Capa,
    Fsca,
    Literature,
    Pmcf,
    RiskSummary,
    Distribution,
    Vigilance,
}

impl CanonicalTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalTarget::DeviceMaster => "device_master",
            CanonicalTarget::SalesExposure => "sales_exposure",
            CanonicalTarget::Complaints => "complaints",
            CanonicalTarget::SeriousIncidents => "serious_incidents",
            CanonicalTarget::Capa => "capa",
            CanonicalTarget::Fsca => "fsca",
            CanonicalTarget::Literature => "literature",
            CanonicalTarget::Pmcf => "pmcf",
            CanonicalTarget::RiskSummary => "risk_summary",
            CanonicalTarget::Distribution => "distribution",
            CanonicalTarget::Vigilance => "vigilance",
        }
    }
}

/// Inclusive surveillance period bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveillancePeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub file_name: String,
    pub canonical_target: CanonicalTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Parsed `pack.manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackManifest {
    pub case_id: String,
    pub device: DeviceMaster,
    pub period: SurveillancePeriod,
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMaster {
    pub device_name: String,
    pub manufacturer: String,
    pub device_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_udi_di: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intended_purpose: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesExposureRow {
    /// Period in YYYY-MM form.
    pub period: String,
    pub country: String,
    pub units_sold: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complaint_id: Option<String>,
    pub date: NaiveDate,
    pub country: String,
    pub problem_code: String,
    pub harm_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    pub serious: bool,
    pub reportable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriousIncidentRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    pub date: NaiveDate,
    pub country: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapaRow {
    pub capa_id: String,
    pub opened_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_date: Option<NaiveDate>,
    pub status: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_complaint_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FscaRow {
    pub fsca_id: String,
    pub initiated_date: NaiveDate,
    pub status: String,
    pub action_type: String,
    #[serde(default)]
    pub countries: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiteratureRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_id: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub relevant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmcfRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    pub title: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hazard_id: Option<String>,
    pub hazard: String,
    pub residual_risk_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSummary {
    pub risks: Vec<RiskRow>,
    pub prior_conclusion: String,
    pub current_conclusion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRow {
    pub country: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub units_distributed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VigilanceRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    pub date: NaiveDate,
    pub country: String,
    pub reportable: bool,
}

/// The full normalized evidence bundle for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedPack {
    pub device_master: DeviceMaster,
    pub sales_exposure: Vec<SalesExposureRow>,
    pub complaints: Vec<ComplaintRow>,
    pub serious_incidents: Vec<SeriousIncidentRow>,
    pub capa: Vec<CapaRow>,
    pub fsca: Vec<FscaRow>,
    pub literature: Vec<LiteratureRow>,
    pub pmcf: Vec<PmcfRow>,
    pub risk_summary: RiskSummary,
    pub distribution: Vec<DistributionRow>,
    pub vigilance: Vec<VigilanceRow>,
}

/// Per-dataset row counts and messages produced by qualification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualificationReport {
    pub rows_accepted: u64,
    pub rows_dropped: u64,
    pub messages: Vec<String>,
}

/// YYYY-MM period key for a date.
pub fn period_of(date: &NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

/// Qualify a normalized pack: drop rows that cannot support analytics and
/// record why. Field-level defaults (for example a missing root cause) are
/// applied downstream by the kernels, not here.
pub fn qualify(pack: &NormalizedPack) -> (NormalizedPack, QualificationReport) {
    let mut qualified = pack.clone();
    let mut report = QualificationReport::default();

    let before = qualified.complaints.len();
    qualified.complaints.retain(|row| {
        let keep = !row.problem_code.trim().is_empty() && !row.country.trim().is_empty();
        if !keep {
            report.messages.push(format!(
                "complaint {} dropped: missing problem code or country",
                row.complaint_id.as_deref().unwrap_or("<unidentified>")
            ));
        }
        keep
    });
    report.rows_dropped += (before - qualified.complaints.len()) as u64;

    let before = qualified.sales_exposure.len();
    qualified.sales_exposure.retain(|row| {
        let keep = row.period.len() == 7 && row.period.as_bytes()[4] == b'-';
        if !keep {
            report
                .messages
                .push(format!("exposure row dropped: malformed period {:?}", row.period));
        }
        keep
    });
    report.rows_dropped += (before - qualified.sales_exposure.len()) as u64;

    report.rows_accepted = (qualified.complaints.len()
        + qualified.sales_exposure.len()
        + qualified.serious_incidents.len()
        + qualified.capa.len()
        + qualified.fsca.len()
        + qualified.literature.len()
        + qualified.pmcf.len()
        + qualified.distribution.len()
        + qualified.vigilance.len()) as u64;

    (qualified, report)
}
