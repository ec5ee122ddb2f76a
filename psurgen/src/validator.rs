//! validator.rs: the regulatory, structural, coverage, and anti-mock rule
//! engine.
//!
//! The validator is pure: it reads the computation context and the decision
//! trace chain and emits a flat result list in a stable order. Findings are
//! data; a critical fail travels into the bundle and S12 instead of halting
//! the pipeline.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::analytics::trend::TrendDetermination;
use crate::context::ComputationContext;
use crate::ledger::{DecisionTraceRecord, TraceType};
use crate::reconcile::FindingSeverity;

static MOCK_REQUEST_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^req-S\d{2}$").expect("mock request id regex compiles"));

const MOCK_PROVIDERS: &[&str] = &["mock", "demo", "stub", "test"];

const NEGATIVE_PHRASES: &[&str] = &["adversely impacted", "profile has changed"];
const POSITIVE_PHRASES: &[&str] = &["not been adversely", "remains unchanged", "remains favorable"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    Critical,
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Pass,
    Fail,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub rule_key: String,
    pub severity: RuleSeverity,
    pub status: RuleStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

fn result(
    rule_key: &str,
    severity: RuleSeverity,
    status: RuleStatus,
    message: impl Into<String>,
) -> ValidationResult {
    ValidationResult {
        rule_key: rule_key.to_string(),
        severity,
        status,
        message: message.into(),
        context: None,
    }
}

fn result_with_context(
    rule_key: &str,
    severity: RuleSeverity,
    status: RuleStatus,
    message: impl Into<String>,
    context: Value,
) -> ValidationResult {
    ValidationResult {
        context: Some(context),
        ..result(rule_key, severity, status, message)
    }
}

/// Run every rule family against the context and the trace chain.
pub fn validate(ctx: &ComputationContext, chain: &[DecisionTraceRecord]) -> Vec<ValidationResult> {
    let mut results = Vec::new();
    evidence_and_period_rules(ctx, &mut results);
    data_sufficiency_rules(ctx, &mut results);
    structural_coverage_rules(ctx, &mut results);
    consistency_rule(ctx, &mut results);
    reconciliation_rule(ctx, &mut results);
    llm_proof_rules(chain, &mut results);
    results
}

fn evidence_and_period_rules(ctx: &ComputationContext, results: &mut Vec<ValidationResult>) {
    let exposure = &ctx.datasets.sales_exposure;
    results.push(if exposure.is_empty() {
        result(
            "denominator_present",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "no sales/exposure dataset was provided",
        )
    } else {
        result(
            "denominator_present",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            format!("{} exposure rows present", exposure.len()),
        )
    });

    let total_units = ctx.analytics.exposure.total_units;
    results.push(if total_units == 0 {
        result(
            "denominator_nonzero",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "total units sold is zero; rates are not computable",
        )
    } else {
        result(
            "denominator_nonzero",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            format!("total units sold: {total_units}"),
        )
    });

    let dates: Vec<_> = ctx.datasets.complaints.iter().map(|row| row.date).collect();
    match (dates.iter().min(), dates.iter().max()) {
        (Some(&data_start), Some(&data_end)) => {
            let inside = data_start >= ctx.period.start && data_end <= ctx.period.end;
            results.push(if inside {
                result(
                    "surveillance_period_coverage",
                    RuleSeverity::Critical,
                    RuleStatus::Pass,
                    "all complaint dates fall inside the surveillance period",
                )
            } else {
                result_with_context(
                    "surveillance_period_coverage",
                    RuleSeverity::Critical,
                    RuleStatus::Fail,
                    "complaint dates extend outside the surveillance period",
                    json!({ "dataStart": data_start, "dataEnd": data_end }),
                )
            });
        }
        _ => results.push(result(
            "surveillance_period_coverage",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            "no complaint dates to check",
        )),
    }

    let trend = &ctx.analytics.trend;
    let detected_without_evidence = trend.determination == TrendDetermination::TrendDetected
        && trend.western_electric_violations.is_empty();
    results.push(if detected_without_evidence {
        result(
            "trend_with_evidence",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "TREND_DETECTED without any Western Electric violation",
        )
    } else {
        result(
            "trend_with_evidence",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            format!(
                "determination {} backed by {} violation(s)",
                trend.determination.as_str(),
                trend.western_electric_violations.len()
            ),
        )
    });

    let s12_adverse = ctx
        .sections
        .iter()
        .find(|section| section.section_id == "S12")
        .map(|section| classify_phrases(&section.narrative) == Some(false))
        .unwrap_or(false);
    let adverse_supported = trend.determination == TrendDetermination::TrendDetected
        || ctx.analytics.risk.risk_profile_changed;
    results.push(if s12_adverse && !adverse_supported {
        result(
            "benefit_risk_requires_trend",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "S12 concludes adverse impact without a detected trend or changed risk conclusion",
        )
    } else {
        result(
            "benefit_risk_requires_trend",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            "benefit-risk conclusion is consistent with the trend evidence",
        )
    });

    let unverified: Vec<String> = ctx
        .sections
        .iter()
        .filter(|section| section.claims.iter().any(|claim| !claim.verified))
        .map(|section| section.section_id.clone())
        .collect();
    results.push(if unverified.is_empty() {
        result(
            "claims_linked_to_evidence",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            "every extracted claim cites evidence",
        )
    } else {
        result_with_context(
            "claims_linked_to_evidence",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "sections contain claims without evidence citations",
            json!({ "sections": unverified }),
        )
    });
}

fn data_sufficiency_rules(ctx: &ComputationContext, results: &mut Vec<ValidationResult>) {
    let points = ctx.analytics.trend.monthly_series.len();
    results.push(if points >= crate::analytics::trend::MIN_TREND_POINTS {
        result(
            "minimum_datapoints",
            RuleSeverity::Major,
            RuleStatus::Pass,
            format!("{points} monthly datapoints available"),
        )
    } else {
        result(
            "minimum_datapoints",
            RuleSeverity::Major,
            RuleStatus::Warn,
            format!("only {points} monthly datapoints; trend analysis is inconclusive below 12"),
        )
    });

    results.push(if ctx.datasets.capa.is_empty() {
        result(
            "capa_dataset_present",
            RuleSeverity::Major,
            RuleStatus::Warn,
            "no CAPA dataset was provided",
        )
    } else {
        result(
            "capa_dataset_present",
            RuleSeverity::Major,
            RuleStatus::Pass,
            format!("{} CAPA records present", ctx.datasets.capa.len()),
        )
    });

    let risk = &ctx.datasets.risk_summary;
    let risk_present = !risk.risks.is_empty()
        || !risk.prior_conclusion.trim().is_empty()
        || !risk.current_conclusion.trim().is_empty();
    results.push(if risk_present {
        result(
            "risk_summary_present",
            RuleSeverity::Major,
            RuleStatus::Pass,
            "risk summary dataset present",
        )
    } else {
        result(
            "risk_summary_present",
            RuleSeverity::Major,
            RuleStatus::Warn,
            "no risk summary was provided",
        )
    });

    let missing_root_cause = ctx
        .datasets
        .complaints
        .iter()
        .filter(|row| row.root_cause.is_none())
        .count();
    let missing_citation_ids = ctx
        .datasets
        .literature
        .iter()
        .filter(|row| row.citation_id.is_none())
        .count();
    results.push(if missing_root_cause == 0 && missing_citation_ids == 0 {
        result(
            "optional_fields_present",
            RuleSeverity::Minor,
            RuleStatus::Pass,
            "optional classification fields are fully populated",
        )
    } else {
        result_with_context(
            "optional_fields_present",
            RuleSeverity::Minor,
            RuleStatus::Warn,
            "optional fields are missing on some rows",
            json!({
                "complaintsWithoutRootCause": missing_root_cause,
                "citationsWithoutId": missing_citation_ids,
            }),
        )
    });
}

fn structural_coverage_rules(ctx: &ComputationContext, results: &mut Vec<ValidationResult>) {
    for number in 1..=12u32 {
        let section_id = format!("S{number:02}");
        let rule_key = format!("psur_section_{section_id}_present");
        let present = ctx.sections.iter().any(|s| s.section_id == section_id);
        results.push(if present {
            result(
                &rule_key,
                RuleSeverity::Critical,
                RuleStatus::Pass,
                format!("section {section_id} generated"),
            )
        } else {
            result(
                &rule_key,
                RuleSeverity::Critical,
                RuleStatus::Fail,
                format!("section {section_id} is missing"),
            )
        });
    }

    for number in 1..=12u32 {
        let table_id = format!("A{number:02}");
        let rule_key = format!("psur_table_{table_id}_present");
        match ctx.annex_tables.iter().find(|t| t.table_id == table_id) {
            None => results.push(result(
                &rule_key,
                RuleSeverity::Critical,
                RuleStatus::Fail,
                format!("annex table {table_id} is missing"),
            )),
            Some(table) if table.rows.is_empty() => results.push(result(
                &rule_key,
                RuleSeverity::Critical,
                RuleStatus::Warn,
                format!("annex table {table_id} is present but empty"),
            )),
            Some(table) => results.push(result(
                &rule_key,
                RuleSeverity::Critical,
                RuleStatus::Pass,
                format!("annex table {table_id} has {} row(s)", table.rows.len()),
            )),
        }
    }
}

/// Classify a narrative against the fixed phrase sets. Positive phrases win
/// ("not been adversely impacted" contains "adversely impacted"). Returns
/// Some(true) for favorable, Some(false) for adverse, None for neither.
fn classify_phrases(narrative: &str) -> Option<bool> {
    if POSITIVE_PHRASES.iter().any(|phrase| narrative.contains(phrase)) {
        return Some(true);
    }
    if NEGATIVE_PHRASES.iter().any(|phrase| narrative.contains(phrase)) {
        return Some(false);
    }
    None
}

fn consistency_rule(ctx: &ComputationContext, results: &mut Vec<ValidationResult>) {
    let find = |id: &str| {
        ctx.sections
            .iter()
            .find(|section| section.section_id == id)
            .map(|section| classify_phrases(&section.narrative))
    };
    let s11 = find("S11").flatten();
    let s12 = find("S12").flatten();
    let contradictory = matches!((s11, s12), (Some(a), Some(b)) if a != b);
    results.push(if contradictory {
        result_with_context(
            "psur_benefit_risk_consistency",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "S11 and S12 reach opposite benefit-risk positions",
            json!({ "s11Favorable": s11, "s12Favorable": s12 }),
        )
    } else {
        result(
            "psur_benefit_risk_consistency",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            "risk profile status and benefit-risk conclusion agree",
        )
    });
}

/// Reconciliation errors surface here deliberately downgraded to major/warn;
/// the full findings remain available in the reconciliation result.
fn reconciliation_rule(ctx: &ComputationContext, results: &mut Vec<ValidationResult>) {
    let errors = ctx
        .reconciliation
        .findings
        .iter()
        .filter(|finding| finding.severity == FindingSeverity::Error)
        .count();
    results.push(if errors > 0 {
        result_with_context(
            "psur_reconciliation",
            RuleSeverity::Major,
            RuleStatus::Warn,
            format!("{errors} reconciliation error finding(s); see methods limitations"),
            json!({ "errorFindings": errors }),
        )
    } else {
        result(
            "psur_reconciliation",
            RuleSeverity::Major,
            RuleStatus::Pass,
            "cross-dataset reconciliation raised no error findings",
        )
    });
}

fn str_field(content: &Value, key: &str) -> Option<String> {
    content
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn positive_number(content: &Value, key: &str) -> bool {
    content
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| n > 0)
        .unwrap_or(false)
}

/// Full proof fields on one LLM trace record's output content.
fn has_full_proof(content: &Value) -> bool {
    let identity = ["provider", "model", "correlationId", "providerRequestId"]
        .iter()
        .all(|key| str_field(content, key).is_some());
    let usage = ["inputTokens", "outputTokens", "latencyMs"]
        .iter()
        .all(|key| positive_number(content, key));
    let transport = content
        .get("transportProof")
        .map(|proof| {
            ["sdk", "endpointHost", "providerRequestId", "responseHeadersHash"]
                .iter()
                .all(|key| str_field(proof, key).is_some())
                && proof.get("httpStatus").and_then(Value::as_u64).is_some()
        })
        .unwrap_or(false);
    identity && usage && transport
}

fn llm_proof_rules(chain: &[DecisionTraceRecord], results: &mut Vec<ValidationResult>) {
    let llm_records: Vec<&DecisionTraceRecord> = chain
        .iter()
        .filter(|record| record.trace_type == TraceType::LlmSectionEnhancement)
        .collect();

    let proven = llm_records
        .iter()
        .filter(|record| has_full_proof(&record.output_content))
        .count();
    results.push(if proven >= 12 {
        result(
            "strict_llm_proof_required",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            format!("{proven} enhancement record(s) carry full transport proof"),
        )
    } else {
        result(
            "strict_llm_proof_required",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            format!("only {proven} of the required 12 enhancement records carry full transport proof"),
        )
    });

    let missing: Vec<String> = (1..=12u32)
        .map(|number| format!("S{number:02}"))
        .filter(|section_id| {
            !llm_records
                .iter()
                .any(|record| str_field(&record.output_content, "sectionId").as_deref() == Some(section_id))
        })
        .collect();
    results.push(if missing.is_empty() {
        result(
            "strict_llm_coverage",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            "every section was enhanced",
        )
    } else {
        result_with_context(
            "strict_llm_coverage",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "sections missing an enhancement record",
            json!({ "sections": missing }),
        )
    });

    let mock_providers: Vec<String> = llm_records
        .iter()
        .filter_map(|record| str_field(&record.output_content, "provider"))
        .filter(|provider| MOCK_PROVIDERS.contains(&provider.to_lowercase().as_str()))
        .collect();
    results.push(if mock_providers.is_empty() {
        result(
            "mock_proof_provider",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            "no mock providers detected",
        )
    } else {
        result_with_context(
            "mock_proof_provider",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "enhancement records cite a mock provider",
            json!({ "providers": mock_providers }),
        )
    });

    let mock_request_ids: Vec<String> = llm_records
        .iter()
        .filter_map(|record| str_field(&record.output_content, "providerRequestId"))
        .filter(|id| MOCK_REQUEST_ID.is_match(id) || matches!(id.as_str(), "mock" | "demo" | "stub"))
        .collect();
    results.push(if mock_request_ids.is_empty() {
        result(
            "mock_proof_request_id",
            RuleSeverity::Critical,
            RuleStatus::Pass,
            "no synthetic provider request ids detected",
        )
    } else {
        result_with_context(
            "mock_proof_request_id",
            RuleSeverity::Critical,
            RuleStatus::Fail,
            "enhancement records carry synthetic provider request ids",
            json!({ "requestIds": mock_request_ids }),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrase_classification_prefers_positive_matches() {
        assert_eq!(
            classify_phrases("the profile has not been adversely impacted and remains favorable"),
            Some(true)
        );
        assert_eq!(
            classify_phrases("the profile has been adversely impacted"),
            Some(false)
        );
        assert_eq!(classify_phrases("no conclusion here"), None);
    }

    #[test]
    fn full_proof_requires_transport_subrecord() {
        let complete = serde_json::json!({
            "sectionId": "S01",
            "provider": "anthropic",
            "model": "claude-sonnet-4-5",
            "correlationId": "corr-1",
            "providerRequestId": "req_A1b2",
            "inputTokens": 812,
            "outputTokens": 342,
            "latencyMs": 1810,
            "transportProof": {
                "sdk": "ureq/2.10",
                "endpointHost": "api.anthropic.com",
                "httpStatus": 200,
                "providerRequestId": "req_A1b2",
                "responseHeadersHash": "ab".repeat(32),
            },
        });
        assert!(has_full_proof(&complete));

        let mut without_transport = complete.clone();
        without_transport.as_object_mut().unwrap().remove("transportProof");
        assert!(!has_full_proof(&without_transport));

        let mut zero_tokens = complete;
        zero_tokens["outputTokens"] = serde_json::json!(0);
        assert!(!has_full_proof(&zero_tokens));
    }
}
