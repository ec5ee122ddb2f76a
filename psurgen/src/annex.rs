//! annex.rs: the twelve annex table builders (A01..A12).
//!
//! Builders are total functions from the computation context to a tabular
//! result with provenance. Empty input never fails a builder: registers fall
//! back to a single N/A row, matrices and series to a zero-row table with an
//! explanatory footnote. The policy is fixed per builder.

use serde::{Deserialize, Serialize};

use crate::analytics::{format_number, AnalyticType};
use crate::context::{ComputationContext, Provenance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnexTableResult {
    pub table_id: String,
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub footnotes: Vec<String>,
    pub provenance: Provenance,
}

fn provenance(
    ctx: &ComputationContext,
    atom_types: &[&str],
    derived_types: &[AnalyticType],
) -> Provenance {
    ctx.provenance(atom_types, derived_types)
}

fn table(
    table_id: &str,
    title: &str,
    columns: &[&str],
    rows: Vec<Vec<String>>,
    footnotes: Vec<String>,
    provenance: Provenance,
) -> AnnexTableResult {
    AnnexTableResult {
        table_id: table_id.to_string(),
        title: title.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows,
        footnotes,
        provenance,
    }
}

/// Single N/A row used by register-style builders on empty input.
fn na_row(width: usize) -> Vec<Vec<String>> {
    let mut row = vec!["N/A".to_string()];
    row.resize(width, String::new());
    vec![row]
}

pub fn a01_device_identification(ctx: &ComputationContext) -> AnnexTableResult {
    let device = &ctx.device;
    let mut rows = vec![
        vec!["Device name".to_string(), device.device_name.clone()],
        vec!["Manufacturer".to_string(), device.manufacturer.clone()],
        vec!["Device class".to_string(), device.device_class.clone()],
    ];
    if let Some(model) = &device.model_number {
        rows.push(vec!["Model number".to_string(), model.clone()]);
    }
    if let Some(udi) = &device.basic_udi_di {
        rows.push(vec!["Basic UDI-DI".to_string(), udi.clone()]);
    }
    if let Some(certificate) = &device.certificate_number {
        rows.push(vec!["Certificate number".to_string(), certificate.clone()]);
    }
    rows.push(vec![
        "Surveillance period".to_string(),
        format!("{} to {}", ctx.period.start, ctx.period.end),
    ]);
    table(
        "A01",
        "Device Identification",
        &["Field", "Value"],
        rows,
        Vec::new(),
        provenance(ctx, &["device_master"], &[]),
    )
}

pub fn a02_sales_by_period(ctx: &ComputationContext) -> AnnexTableResult {
    let exposure = &ctx.analytics.exposure;
    let rows: Vec<Vec<String>> = exposure
        .units_by_period
        .iter()
        .map(|entry| vec![entry.period.clone(), entry.units.to_string()])
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No sales/exposure data was recorded in the surveillance period".to_string()]
    } else {
        vec![format!("Total units sold: {}", exposure.total_units)]
    };
    table(
        "A02",
        "Sales and Exposure by Period",
        &["Period", "Units Sold"],
        rows,
        footnotes,
        provenance(ctx, &["sales_exposure"], &[AnalyticType::Exposure]),
    )
}

pub fn a03_exposure_by_country(ctx: &ComputationContext) -> AnnexTableResult {
    let rows: Vec<Vec<String>> = ctx
        .analytics
        .exposure
        .units_by_country
        .iter()
        .map(|entry| {
            vec![
                entry.country.clone(),
                entry.units.to_string(),
                format_number(entry.share_percent),
            ]
        })
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No sales/exposure data was recorded in the surveillance period".to_string()]
    } else {
        Vec::new()
    };
    table(
        "A03",
        "Exposure by Country",
        &["Country", "Units Sold", "Share (%)"],
        rows,
        footnotes,
        provenance(ctx, &["sales_exposure", "distribution"], &[AnalyticType::Exposure]),
    )
}

pub fn a04_complaints_by_month(ctx: &ComputationContext) -> AnnexTableResult {
    let rows: Vec<Vec<String>> = ctx
        .analytics
        .complaints
        .by_month
        .iter()
        .map(|entry| vec![entry.period.clone(), entry.count.to_string()])
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No complaints were recorded in the surveillance period".to_string()]
    } else {
        Vec::new()
    };
    table(
        "A04",
        "Complaints by Month",
        &["Period", "Complaints"],
        rows,
        footnotes,
        provenance(ctx, &["complaints"], &[AnalyticType::ComplaintProfile]),
    )
}

pub fn a05_complaints_by_country(ctx: &ComputationContext) -> AnnexTableResult {
    let rows: Vec<Vec<String>> = ctx
        .analytics
        .complaints
        .by_country
        .iter()
        .map(|entry| vec![entry.key.clone(), entry.count.to_string()])
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No complaints were recorded in the surveillance period".to_string()]
    } else {
        Vec::new()
    };
    table(
        "A05",
        "Complaints by Country",
        &["Country", "Complaints"],
        rows,
        footnotes,
        provenance(ctx, &["complaints"], &[AnalyticType::ComplaintProfile]),
    )
}

pub fn a06_complaints_by_problem_code(ctx: &ComputationContext) -> AnnexTableResult {
    let rows: Vec<Vec<String>> = ctx
        .analytics
        .complaints
        .by_problem_code
        .iter()
        .map(|entry| {
            vec![
                entry.code.clone(),
                entry.count.to_string(),
                entry.serious.to_string(),
            ]
        })
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No complaints were recorded in the surveillance period".to_string()]
    } else {
        Vec::new()
    };
    table(
        "A06",
        "Complaints by Problem Code",
        &["Problem Code", "Complaints", "Of Which Serious"],
        rows,
        footnotes,
        provenance(ctx, &["complaints"], &[AnalyticType::ComplaintProfile]),
    )
}

pub fn a07_problem_harm_matrix(ctx: &ComputationContext) -> AnnexTableResult {
    let rows: Vec<Vec<String>> = ctx
        .analytics
        .complaints
        .problem_harm_matrix
        .iter()
        .map(|cell| {
            vec![
                cell.problem_code.clone(),
                cell.harm_code.clone(),
                cell.count.to_string(),
            ]
        })
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No complaints were recorded in the surveillance period".to_string()]
    } else {
        Vec::new()
    };
    table(
        "A07",
        "Problem/Harm Matrix",
        &["Problem Code", "Harm Code", "Complaints"],
        rows,
        footnotes,
        provenance(ctx, &["complaints"], &[AnalyticType::ComplaintProfile]),
    )
}

pub fn a08_serious_incidents(ctx: &ComputationContext) -> AnnexTableResult {
    let incidents = &ctx.analytics.incidents;
    let mut rows: Vec<Vec<String>> = Vec::new();
    if incidents.total > 0 || !ctx.datasets.vigilance.is_empty() {
        rows.push(vec![
            "Total serious incidents".to_string(),
            incidents.total.to_string(),
        ]);
        rows.push(vec![
            "Incident rate per 1,000 units".to_string(),
            format_number(incidents.incident_rate),
        ]);
        for entry in &incidents.by_severity {
            rows.push(vec![
                format!("Incidents, severity {}", entry.key),
                entry.count.to_string(),
            ]);
        }
        for entry in &incidents.by_country {
            rows.push(vec![
                format!("Incidents, country {}", entry.key),
                entry.count.to_string(),
            ]);
        }
        rows.push(vec![
            "Vigilance reports submitted".to_string(),
            ctx.datasets.vigilance.len().to_string(),
        ]);
    }
    let footnotes = if rows.is_empty() {
        vec!["No serious incidents or vigilance reports were recorded".to_string()]
    } else {
        Vec::new()
    };
    let rows = if rows.is_empty() { na_row(2) } else { rows };
    table(
        "A08",
        "Serious Incidents and Vigilance Reports",
        &["Indicator", "Value"],
        rows,
        footnotes,
        provenance(
            ctx,
            &["serious_incidents", "vigilance"],
            &[AnalyticType::IncidentProfile],
        ),
    )
}

pub fn a09_capa_register(ctx: &ComputationContext) -> AnnexTableResult {
    let capa = &ctx.analytics.capa;
    let rows: Vec<Vec<String>> = capa
        .items
        .iter()
        .map(|item| {
            vec![
                item.capa_id.clone(),
                item.opened_date.to_string(),
                item.closed_date.map(|d| d.to_string()).unwrap_or_else(|| "open".to_string()),
                item.status.clone(),
                item.description.clone(),
            ]
        })
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No CAPAs were opened or active in the surveillance period".to_string()]
    } else if let Some(average) = capa.average_closure_days {
        vec![format!("Average closure time: {} days", format_number(average))]
    } else {
        vec!["No CAPA closed within the surveillance period".to_string()]
    };
    let rows = if rows.is_empty() { na_row(5) } else { rows };
    table(
        "A09",
        "CAPA Register",
        &["CAPA ID", "Opened", "Closed", "Status", "Description"],
        rows,
        footnotes,
        provenance(ctx, &["capa"], &[AnalyticType::Capa]),
    )
}

pub fn a10_fsca_register(ctx: &ComputationContext) -> AnnexTableResult {
    let rows: Vec<Vec<String>> = ctx
        .analytics
        .fsca
        .actions
        .iter()
        .map(|action| {
            vec![
                action.fsca_id.clone(),
                action.initiated_date.to_string(),
                action.status.clone(),
                action.action_type.clone(),
                action.countries.join(", "),
                action.description.clone(),
            ]
        })
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No field safety corrective actions were initiated".to_string()]
    } else {
        Vec::new()
    };
    let rows = if rows.is_empty() { na_row(6) } else { rows };
    table(
        "A10",
        "Field Safety Corrective Actions",
        &["FSCA ID", "Initiated", "Status", "Action Type", "Countries", "Description"],
        rows,
        footnotes,
        provenance(ctx, &["fsca"], &[AnalyticType::Fsca]),
    )
}

pub fn a11_literature_review(ctx: &ComputationContext) -> AnnexTableResult {
    let rows: Vec<Vec<String>> = ctx
        .analytics
        .literature
        .citations
        .iter()
        .map(|citation| {
            vec![
                citation.citation_id.clone().unwrap_or_else(|| "-".to_string()),
                citation.title.clone(),
                citation.source.clone().unwrap_or_else(|| "-".to_string()),
                if citation.relevant { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    let footnotes = if rows.is_empty() {
        vec!["No literature relevant to the device was identified".to_string()]
    } else {
        Vec::new()
    };
    let rows = if rows.is_empty() { na_row(4) } else { rows };
    table(
        "A11",
        "Literature Review",
        &["Citation", "Title", "Source", "Relevant"],
        rows,
        footnotes,
        provenance(ctx, &["literature"], &[AnalyticType::Literature]),
    )
}

pub fn a12_pmcf_and_risk(ctx: &ComputationContext) -> AnnexTableResult {
    let mut rows: Vec<Vec<String>> = ctx
        .analytics
        .pmcf
        .activities
        .iter()
        .map(|activity| vec![format!("PMCF: {}", activity.title), activity.status.clone()])
        .collect();
    let risk = &ctx.analytics.risk;
    rows.push(vec!["Residual risks HIGH".to_string(), risk.high.to_string()]);
    rows.push(vec!["Residual risks MEDIUM".to_string(), risk.medium.to_string()]);
    rows.push(vec!["Residual risks LOW".to_string(), risk.low.to_string()]);
    rows.push(vec![
        "Prior benefit-risk conclusion".to_string(),
        risk.prior_conclusion.clone(),
    ]);
    rows.push(vec![
        "Current benefit-risk conclusion".to_string(),
        risk.current_conclusion.clone(),
    ]);
    let footnotes = if ctx.analytics.pmcf.activities.is_empty() {
        vec!["No PMCF activities were conducted in the surveillance period".to_string()]
    } else {
        Vec::new()
    };
    table(
        "A12",
        "PMCF Activities and Risk Summary",
        &["Item", "Detail"],
        rows,
        footnotes,
        provenance(ctx, &["pmcf", "risk_summary"], &[AnalyticType::Pmcf, AnalyticType::Risk]),
    )
}

/// All twelve builders in annex order.
pub fn build_all(ctx: &ComputationContext) -> Vec<AnnexTableResult> {
    vec![
        a01_device_identification(ctx),
        a02_sales_by_period(ctx),
        a03_exposure_by_country(ctx),
        a04_complaints_by_month(ctx),
        a05_complaints_by_country(ctx),
        a06_complaints_by_problem_code(ctx),
        a07_problem_harm_matrix(ctx),
        a08_serious_incidents(ctx),
        a09_capa_register(ctx),
        a10_fsca_register(ctx),
        a11_literature_review(ctx),
        a12_pmcf_and_risk(ctx),
    ]
}
