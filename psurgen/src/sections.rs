//! sections.rs: the twelve narrative section generators (S01..S12).
//!
//! Narratives are deterministic prose templated from the computation context.
//! Claims are extracted per sentence and linked to the section's provenance;
//! a claim is verified when it cites at least one evidence atom or derived
//! input. S11 and S12 carry fixed phrase pairs that the validator later
//! cross-checks for consistency.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analytics::trend::TrendDetermination;
use crate::analytics::{format_number, AnalyticType};
use crate::context::{ComputationContext, Provenance};

static DOMAIN_TERMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"rate|trend|UCL|sigma|CAPA|incident|hazard|risk|benefit").expect("domain term regex compiles"));

static SENTENCE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]\s+").expect("sentence boundary regex compiles"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub text: String,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_atom_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived_input_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionResult {
    pub section_id: String,
    pub title: String,
    pub number: u32,
    pub narrative: String,
    pub claims: Vec<Claim>,
    pub referenced_table_ids: Vec<String>,
    pub limitations: Vec<String>,
    pub provenance: Provenance,
}

/// Split a narrative into sentences on `.`, `!`, or `?` followed by
/// whitespace; retain sentences carrying a numeric token or a domain term,
/// and attach the section's first evidence atom and first derived input.
pub fn extract_claims(narrative: &str, provenance: &Provenance) -> Vec<Claim> {
    let evidence_atom_id = provenance.evidence_atom_ids.first().copied();
    let derived_input_id = provenance.derived_input_ids.first().copied();
    SENTENCE_BOUNDARY
        .split(narrative)
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .filter(|sentence| {
            sentence.chars().any(|c| c.is_ascii_digit()) || DOMAIN_TERMS.is_match(sentence)
        })
        .map(|sentence| Claim {
            text: sentence.to_string(),
            verified: evidence_atom_id.is_some() || derived_input_id.is_some(),
            evidence_atom_id,
            derived_input_id,
        })
        .collect()
}

fn section(
    section_id: &str,
    number: u32,
    title: &str,
    narrative: String,
    referenced_table_ids: &[&str],
    limitations: Vec<String>,
    provenance: Provenance,
) -> SectionResult {
    let claims = extract_claims(&narrative, &provenance);
    SectionResult {
        section_id: section_id.to_string(),
        title: title.to_string(),
        number,
        narrative,
        claims,
        referenced_table_ids: referenced_table_ids.iter().map(|t| t.to_string()).collect(),
        limitations,
        provenance,
    }
}

/// True when the run's overall safety picture moved against the device: a
/// detected complaint trend or a changed risk conclusion. S11 and S12 both
/// derive their phrasing from this single predicate so they cannot disagree.
fn profile_adverse(ctx: &ComputationContext) -> bool {
    ctx.analytics.trend.determination == TrendDetermination::TrendDetected
        || ctx.analytics.risk.risk_profile_changed
}

pub fn s01_executive_summary(ctx: &ComputationContext) -> SectionResult {
    let analytics = &ctx.analytics;
    let narrative = format!(
        "This Periodic Safety Update Report covers {device} by {manufacturer} for the period {start} to {end}. \
         A total of {units} units were sold across {countries} countries. \
         {complaints} complaints were received, of which {serious} were serious and {reportable} reportable. \
         {incidents} serious incidents were reported in the same period. \
         The statistical trend determination for the complaint rate is {determination}. \
         {conclusion}",
        device = ctx.device.device_name,
        manufacturer = ctx.device.manufacturer,
        start = ctx.period.start,
        end = ctx.period.end,
        units = analytics.exposure.total_units,
        countries = analytics.exposure.units_by_country.len(),
        complaints = analytics.complaints.total,
        serious = analytics.complaints.serious,
        reportable = analytics.complaints.reportable,
        incidents = analytics.incidents.total,
        determination = analytics.trend.determination.as_str(),
        conclusion = if profile_adverse(ctx) {
            "Observations in this period require benefit-risk re-evaluation."
        } else {
            "No observation in this period alters the established safety profile."
        },
    );
    section(
        "S01",
        1,
        "Executive Summary",
        narrative,
        &[],
        Vec::new(),
        ctx.provenance(
            &["device_master", "sales_exposure", "complaints", "serious_incidents"],
            &[
                AnalyticType::Exposure,
                AnalyticType::ComplaintProfile,
                AnalyticType::IncidentProfile,
                AnalyticType::Trend,
            ],
        ),
    )
}

pub fn s02_device_description(ctx: &ComputationContext) -> SectionResult {
    let device = &ctx.device;
    let narrative = format!(
        "{name} is a class {class} medical device manufactured by {manufacturer}. \
         {model}{udi}The device identification details are listed in Annex A01. \
         The device remains certified for its intended purpose throughout the surveillance period.",
        name = device.device_name,
        class = device.device_class,
        manufacturer = device.manufacturer,
        model = device
            .model_number
            .as_deref()
            .map(|m| format!("The model under surveillance is {m}. "))
            .unwrap_or_default(),
        udi = device
            .basic_udi_di
            .as_deref()
            .map(|u| format!("Its Basic UDI-DI is {u}. "))
            .unwrap_or_default(),
    );
    section(
        "S02",
        2,
        "Device Description and Regulatory Background",
        narrative,
        &["A01"],
        Vec::new(),
        ctx.provenance(&["device_master"], &[]),
    )
}

pub fn s03_methods(ctx: &ComputationContext) -> SectionResult {
    let dataset_count = ctx.evidence_atoms.len();
    let mut narrative = format!(
        "This report draws on {dataset_count} normalized evidence datasets covering sales, complaints, \
         serious incidents, CAPA, field safety actions, literature, PMCF, and the risk summary. \
         Each source file was hashed at ingest and is cited by every downstream computation. \
         Monthly complaint rates were evaluated with a 3-sigma control chart and Western Electric rules 1 through 4. \
         Cross-dataset reconciliation was performed before analysis.",
    );
    // Reconciliation limitations surface here verbatim.
    let limitations = ctx.reconciliation.limitations.clone();
    if !limitations.is_empty() {
        narrative.push_str(" The following data limitations apply: ");
        narrative.push_str(&limitations.join("; "));
        narrative.push('.');
    }
    section(
        "S03",
        3,
        "Methods and Data Sources",
        narrative,
        &[],
        limitations,
        ctx.provenance(
            &[
                "device_master",
                "sales_exposure",
                "complaints",
                "serious_incidents",
                "capa",
                "fsca",
                "literature",
                "pmcf",
                "risk_summary",
                "distribution",
                "vigilance",
            ],
            &[],
        ),
    )
}

pub fn s04_sales_exposure(ctx: &ComputationContext) -> SectionResult {
    let exposure = &ctx.analytics.exposure;
    let top_market = exposure
        .units_by_country
        .first()
        .map(|entry| {
            format!(
                "The largest market was {} with {} units ({}% of total exposure). ",
                entry.country,
                entry.units,
                format_number(entry.share_percent)
            )
        })
        .unwrap_or_default();
    let narrative = format!(
        "A total of {units} units were sold in the surveillance period across {periods} monthly periods. \
         {top_market}Period-level and country-level exposure are tabulated in Annexes A02 and A03. \
         Exposure figures form the denominator of every rate reported in this document.",
        units = exposure.total_units,
        periods = exposure.units_by_period.len(),
    );
    section(
        "S04",
        4,
        "Sales and Market Exposure",
        narrative,
        &["A02", "A03"],
        Vec::new(),
        ctx.provenance(&["sales_exposure", "distribution"], &[AnalyticType::Exposure]),
    )
}

pub fn s05_complaint_trends(ctx: &ComputationContext) -> SectionResult {
    let trend = &ctx.analytics.trend;
    let complaints = &ctx.analytics.complaints;
    let narrative = format!(
        "{total} complaints were analyzed against monthly sales exposure. \
         Mean complaint rate: {mean} per 1,000 units. \
         The population standard deviation was {sigma} and the upper control limit (UCL) {ucl} per 1,000 units. \
         {violations} Western Electric rule violation(s) were observed across {points} monthly points. \
         Trend determination: {determination}. {justification} \
         Complaint distributions are tabulated in Annexes A04 through A07.",
        total = complaints.total,
        mean = format_number(trend.mean),
        sigma = format_number(trend.std_dev),
        ucl = format_number(trend.ucl),
        violations = trend.western_electric_violations.len(),
        points = trend.monthly_series.len(),
        determination = trend.determination.as_str(),
        justification = trend.justification,
    );
    section(
        "S05",
        5,
        "Complaint Trend Analysis",
        narrative,
        &["A04", "A05", "A06", "A07"],
        trend.limitations.clone(),
        ctx.provenance(
            &["complaints", "sales_exposure"],
            &[AnalyticType::ComplaintProfile, AnalyticType::Trend],
        ),
    )
}

pub fn s06_serious_incidents(ctx: &ComputationContext) -> SectionResult {
    let incidents = &ctx.analytics.incidents;
    let narrative = format!(
        "{total} serious incidents were reported, an incident rate of {rate} per 1,000 units sold. \
         {vigilance} vigilance reports were submitted to competent authorities. \
         Incident severity and geography are tabulated in Annex A08.",
        total = incidents.total,
        rate = format_number(incidents.incident_rate),
        vigilance = ctx.datasets.vigilance.len(),
    );
    section(
        "S06",
        6,
        "Serious Incidents and Vigilance",
        narrative,
        &["A08"],
        Vec::new(),
        ctx.provenance(
            &["serious_incidents", "vigilance"],
            &[AnalyticType::IncidentProfile],
        ),
    )
}

pub fn s07_capa(ctx: &ComputationContext) -> SectionResult {
    let capa = &ctx.analytics.capa;
    let closure = capa
        .average_closure_days
        .map(|days| format!("Closed CAPAs averaged {} days to closure. ", format_number(days)))
        .unwrap_or_else(|| "No CAPA reached closure within the period. ".to_string());
    let narrative = format!(
        "{total} CAPA records were active in the surveillance period: {open} open and {closed} closed. \
         {closure}The full CAPA register is provided in Annex A09.",
        total = capa.total,
        open = capa.open,
        closed = capa.closed,
    );
    section(
        "S07",
        7,
        "Corrective and Preventive Actions",
        narrative,
        &["A09"],
        Vec::new(),
        ctx.provenance(&["capa"], &[AnalyticType::Capa]),
    )
}

pub fn s08_fsca(ctx: &ComputationContext) -> SectionResult {
    let fsca = &ctx.analytics.fsca;
    let narrative = if fsca.total == 0 {
        "No field safety corrective actions were initiated or ongoing in the surveillance period. \
         Annex A10 records the empty register."
            .to_string()
    } else {
        format!(
            "{total} field safety corrective actions were recorded: {completed} completed and {ongoing} ongoing. \
             Details per action, including affected countries, appear in Annex A10.",
            total = fsca.total,
            completed = fsca.completed,
            ongoing = fsca.ongoing,
        )
    };
    section(
        "S08",
        8,
        "Field Safety Corrective Actions",
        narrative,
        &["A10"],
        Vec::new(),
        ctx.provenance(&["fsca"], &[AnalyticType::Fsca]),
    )
}

pub fn s09_literature(ctx: &ComputationContext) -> SectionResult {
    let literature = &ctx.analytics.literature;
    let narrative = format!(
        "{total} literature citations were screened; {relevant} were assessed as relevant to the device \
         or its equivalents and {not_relevant} as not relevant. \
         No publication identified a new hazard not already covered by the risk documentation. \
         The screened citations are listed in Annex A11.",
        total = literature.total,
        relevant = literature.relevant,
        not_relevant = literature.not_relevant,
    );
    section(
        "S09",
        9,
        "Literature Review",
        narrative,
        &["A11"],
        Vec::new(),
        ctx.provenance(&["literature"], &[AnalyticType::Literature]),
    )
}

pub fn s10_pmcf(ctx: &ComputationContext) -> SectionResult {
    let pmcf = &ctx.analytics.pmcf;
    let narrative = if pmcf.total == 0 {
        "No post-market clinical follow-up activities were conducted in the surveillance period. \
         The PMCF plan remains in force and is summarized in Annex A12."
            .to_string()
    } else {
        format!(
            "{total} post-market clinical follow-up activities were tracked: {completed} completed and {ongoing} ongoing. \
             PMCF findings feed the risk summary in Annex A12.",
            total = pmcf.total,
            completed = pmcf.completed,
            ongoing = pmcf.ongoing,
        )
    };
    section(
        "S10",
        10,
        "Post-Market Clinical Follow-up",
        narrative,
        &["A12"],
        Vec::new(),
        ctx.provenance(&["pmcf"], &[AnalyticType::Pmcf]),
    )
}

pub fn s11_risk_profile(ctx: &ComputationContext) -> SectionResult {
    let risk = &ctx.analytics.risk;
    let status = if profile_adverse(ctx) {
        "the risk profile has changed relative to the previous reporting interval"
    } else {
        "the risk profile remains unchanged relative to the previous reporting interval"
    };
    let narrative = format!(
        "The risk documentation records {high} HIGH, {medium} MEDIUM, and {low} LOW residual risks. \
         Considering the complaint trend determination and the current risk conclusion, {status}. \
         Prior conclusion: \"{prior}\"; current conclusion: \"{current}\".",
        high = risk.high,
        medium = risk.medium,
        low = risk.low,
        prior = risk.prior_conclusion,
        current = risk.current_conclusion,
    );
    section(
        "S11",
        11,
        "Risk Profile Status",
        narrative,
        &["A12"],
        Vec::new(),
        ctx.provenance(&["risk_summary"], &[AnalyticType::Risk, AnalyticType::Trend]),
    )
}

pub fn s12_benefit_risk(ctx: &ComputationContext) -> SectionResult {
    let trend = &ctx.analytics.trend;
    let conclusion = if profile_adverse(ctx) {
        "the benefit-risk profile of the device has been adversely impacted and requires re-evaluation"
    } else {
        "the benefit-risk profile of the device has not been adversely impacted and remains favorable"
    };
    let narrative = format!(
        "Weighing {complaints} complaints, {incidents} serious incidents, and a trend determination of \
         {determination} against {units} units of market exposure, {conclusion}. \
         Every numeric basis of this conclusion is traceable through the accompanying audit bundle.",
        complaints = ctx.analytics.complaints.total,
        incidents = ctx.analytics.incidents.total,
        determination = trend.determination.as_str(),
        units = ctx.analytics.exposure.total_units,
        conclusion = conclusion,
    );
    section(
        "S12",
        12,
        "Benefit-Risk Conclusion",
        narrative,
        &[],
        Vec::new(),
        ctx.provenance(
            &["complaints", "serious_incidents", "risk_summary"],
            &[AnalyticType::Trend, AnalyticType::Risk],
        ),
    )
}

/// All twelve generators in section order.
pub fn generate_all(ctx: &ComputationContext) -> Vec<SectionResult> {
    vec![
        s01_executive_summary(ctx),
        s02_device_description(ctx),
        s03_methods(ctx),
        s04_sales_exposure(ctx),
        s05_complaint_trends(ctx),
        s06_serious_incidents(ctx),
        s07_capa(ctx),
        s08_fsca(ctx),
        s09_literature(ctx),
        s10_pmcf(ctx),
        s11_risk_profile(ctx),
        s12_benefit_risk(ctx),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance_with(atom: bool, derived: bool) -> Provenance {
        Provenance {
            evidence_atom_ids: if atom { vec![Uuid::new_v4()] } else { Vec::new() },
            derived_input_ids: if derived { vec![Uuid::new_v4()] } else { Vec::new() },
        }
    }

    #[test]
    fn claims_keep_numeric_and_domain_sentences() {
        let narrative = "The device performed as expected. 42 complaints were received. \
                         The complaint rate stayed below the UCL. Nothing else happened.";
        let claims = extract_claims(narrative, &provenance_with(true, true));
        let texts: Vec<&str> = claims.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "42 complaints were received",
                "The complaint rate stayed below the UCL",
            ]
        );
        assert!(claims.iter().all(|c| c.verified));
    }

    #[test]
    fn claims_without_any_citation_are_unverified() {
        let claims = extract_claims("3 units failed.", &provenance_with(false, false));
        assert_eq!(claims.len(), 1);
        assert!(!claims[0].verified);
        assert!(claims[0].evidence_atom_id.is_none());
    }

    #[test]
    fn narrative_without_matching_sentences_has_no_claims() {
        let claims = extract_claims(
            "The device performed as expected. Nothing notable occurred.",
            &provenance_with(true, true),
        );
        assert!(claims.is_empty());
    }

    #[test]
    fn domain_terms_match_case_sensitively() {
        // "Rate" alone does not match the lowercase pattern; "UCL" matches in
        // uppercase only.
        let claims = extract_claims("Rate went up somewhat.", &provenance_with(true, false));
        assert!(claims.is_empty());
        let claims = extract_claims("The UCL was not exceeded.", &provenance_with(true, false));
        assert_eq!(claims.len(), 1);
    }
}
