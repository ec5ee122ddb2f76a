//! portability.rs: assembly of the tamper-evident audit bundle.
//!
//! Produces the audit trail (`audit.jsonl`), the lineage graph, the
//! human-readable chain summary, the pruned computation context, and zips
//! them together with the rendered document and chart. Every entry is listed
//! in a top-level `manifest.json` with its byte hash, so the bundle is
//! self-verifying file by file.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use zip::write::FileOptions;

use crate::context::ComputationContext;
use crate::ledger::{DecisionTraceRecord, TraceType};
use crate::provenance;

pub const AUDIT_JSONL_PATH: &str = "audit/audit.jsonl";
pub const CONTEXT_GRAPH_PATH: &str = "audit/context_graph.cytoscape.json";
pub const AUDIT_SUMMARY_PATH: &str = "audit/audit_summary.md";
pub const CONTEXT_JSON_PATH: &str = "data/computation_context.json";
pub const DOCX_PATH: &str = "psur.docx";
pub const CHART_PATH: &str = "trend_chart.png";
pub const BUNDLE_MANIFEST_PATH: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    pub path: String,
    pub kind: String,
    pub sha256: String,
}

#[derive(Debug)]
pub struct BundleArtifacts {
    pub entries: Vec<BundleEntry>,
    pub zip_bytes: Vec<u8>,
}

struct PendingEntry {
    path: String,
    kind: String,
    bytes: Vec<u8>,
}

fn append_entry(
    entries: &mut Vec<PendingEntry>,
    manifest: &mut Vec<BundleEntry>,
    path: &str,
    kind: &str,
    bytes: Vec<u8>,
) {
    manifest.push(BundleEntry {
        path: path.to_string(),
        kind: kind.to_string(),
        sha256: provenance::sha256_hex(&bytes),
    });
    entries.push(PendingEntry {
        path: path.to_string(),
        kind: kind.to_string(),
        bytes,
    });
}

/// One compact-JSON record per line, in chain order, newline-terminated.
pub fn render_audit_jsonl(chain: &[DecisionTraceRecord]) -> Result<String> {
    let mut output = String::new();
    for record in chain {
        let line = serde_json::to_string(record)
            .map_err(|err| anyhow!("failed to serialize trace record: {err}"))?;
        output.push_str(&line);
        output.push('\n');
    }
    Ok(output)
}

/// Cytoscape node/edge graph: one node per trace record, one per evidence
/// atom, `input` edges from atoms to consuming records, and `next` edges
/// walking the chain. Nodes are deduplicated on insert.
pub fn render_context_graph(chain: &[DecisionTraceRecord]) -> Value {
    let mut nodes: BTreeMap<String, Value> = BTreeMap::new();
    let mut edges: Vec<Value> = Vec::new();

    for record in chain {
        let dtr_node = format!("dtr_{}", record.trace_id);
        nodes.entry(dtr_node.clone()).or_insert_with(|| {
            json!({
                "data": {
                    "id": dtr_node,
                    "label": record.trace_type,
                    "chainPosition": record.chain_position,
                }
            })
        });

        for source in &record.input_lineage.primary_sources {
            let src_node = format!("src_{}", source.source_id);
            nodes.entry(src_node.clone()).or_insert_with(|| {
                json!({
                    "data": {
                        "id": src_node,
                        "label": source.source_type,
                        "sha256": source.source_hash,
                    }
                })
            });
            edges.push(json!({
                "data": {
                    "id": format!("input_{}_{}", src_node, dtr_node),
                    "source": src_node,
                    "target": dtr_node,
                    "label": "input",
                }
            }));
        }
    }

    for pair in chain.windows(2) {
        edges.push(json!({
            "data": {
                "id": format!("next_{}", pair[0].chain_position),
                "source": format!("dtr_{}", pair[0].trace_id),
                "target": format!("dtr_{}", pair[1].trace_id),
                "label": "next",
            }
        }));
    }

    json!({
        "elements": {
            "nodes": nodes.into_values().collect::<Vec<_>>(),
            "edges": edges,
        }
    })
}

/// Human-readable chain table plus the Merkle root, the regulatory
/// obligations cited, and an LLM usage rollup when enhancement records exist.
pub fn render_audit_summary(chain: &[DecisionTraceRecord]) -> String {
    let mut output = String::new();
    output.push_str("# Audit Summary\n\n");
    output.push_str(&format!("Decision trace records: {}\n\n", chain.len()));

    output.push_str("| # | Type | Duration (ms) | Content Hash |\n");
    output.push_str("|---|------|---------------|--------------|\n");
    for record in chain {
        let short_hash: String = record.hash_chain.content_hash.chars().take(16).collect();
        output.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            record.chain_position,
            record.trace_type.as_str(),
            record.duration_ms,
            short_hash
        ));
    }

    if let Some(last) = chain.last() {
        output.push_str(&format!("\nMerkle root: `{}`\n", last.hash_chain.merkle_root));
    }

    let obligations: BTreeSet<&str> = chain
        .iter()
        .flat_map(|record| record.regulatory_context.obligations.primary.iter())
        .map(String::as_str)
        .collect();
    if !obligations.is_empty() {
        output.push_str("\nRegulatory obligations referenced:\n");
        for obligation in obligations {
            output.push_str(&format!("- {obligation}\n"));
        }
    }

    let llm_records: Vec<&DecisionTraceRecord> = chain
        .iter()
        .filter(|record| record.trace_type == TraceType::LlmSectionEnhancement)
        .collect();
    if !llm_records.is_empty() {
        let token_sum = |key: &str| -> u64 {
            llm_records
                .iter()
                .filter_map(|record| record.output_content.get(key).and_then(Value::as_u64))
                .sum()
        };
        output.push_str(&format!(
            "\nLLM usage: {} enhancement call(s), {} input tokens, {} output tokens\n",
            llm_records.len(),
            token_sum("inputTokens"),
            token_sum("outputTokens"),
        ));
    }

    output
}

/// Pruned context for the bundle: analytics results, section and table
/// summaries, and reconciliation/validation counts.
pub fn render_pruned_context(ctx: &ComputationContext) -> Value {
    json!({
        "caseId": ctx.case_id,
        "correlationId": ctx.correlation_id,
        "device": ctx.device,
        "period": ctx.period,
        "analytics": ctx.analytics,
        "sections": ctx.sections.iter().map(|section| json!({
            "sectionId": section.section_id,
            "title": section.title,
            "claims": section.claims.len(),
            "limitations": section.limitations.len(),
        })).collect::<Vec<_>>(),
        "annexTables": ctx.annex_tables.iter().map(|table| json!({
            "tableId": table.table_id,
            "title": table.title,
            "rows": table.rows.len(),
        })).collect::<Vec<_>>(),
        "reconciliation": {
            "passed": ctx.reconciliation.passed,
            "findings": ctx.reconciliation.findings.len(),
            "limitations": ctx.reconciliation.limitations.len(),
        },
        "validation": {
            "results": ctx.validation_results.len(),
        },
    })
}

/// Assemble every artifact and zip them at maximum deflate compression.
pub fn build_bundle(
    chain: &[DecisionTraceRecord],
    ctx: &ComputationContext,
    docx: &[u8],
    chart: &[u8],
) -> Result<BundleArtifacts> {
    let mut pending = Vec::new();
    let mut manifest = Vec::new();

    append_entry(
        &mut pending,
        &mut manifest,
        AUDIT_JSONL_PATH,
        "audit_trail",
        render_audit_jsonl(chain)?.into_bytes(),
    );
    let graph = serde_json::to_vec_pretty(&render_context_graph(chain))
        .context("failed to serialize context graph")?;
    append_entry(&mut pending, &mut manifest, CONTEXT_GRAPH_PATH, "lineage_graph", graph);
    append_entry(
        &mut pending,
        &mut manifest,
        AUDIT_SUMMARY_PATH,
        "audit_summary",
        render_audit_summary(chain).into_bytes(),
    );
    let context_json = serde_json::to_vec_pretty(&render_pruned_context(ctx))
        .context("failed to serialize pruned context")?;
    append_entry(&mut pending, &mut manifest, CONTEXT_JSON_PATH, "computation_context", context_json);
    append_entry(&mut pending, &mut manifest, DOCX_PATH, "report", docx.to_vec());
    append_entry(&mut pending, &mut manifest, CHART_PATH, "chart", chart.to_vec());

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut archive = zip::ZipWriter::new(&mut cursor);
        let options = FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .compression_level(Some(9));

        for entry in &pending {
            archive
                .start_file(&entry.path, options)
                .map_err(|err| anyhow!("failed to add zip entry {}: {err}", entry.path))?;
            archive
                .write_all(&entry.bytes)
                .map_err(|err| anyhow!("failed to write zip entry {}: {err}", entry.path))?;
        }

        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .context("failed to serialize bundle manifest")?;
        archive
            .start_file(BUNDLE_MANIFEST_PATH, options)
            .map_err(|err| anyhow!("failed to add bundle manifest: {err}"))?;
        archive
            .write_all(&manifest_json)
            .map_err(|err| anyhow!("failed to write bundle manifest: {err}"))?;
        archive
            .finish()
            .map_err(|err| anyhow!("failed to finish zip archive: {err}"))?;
    }

    Ok(BundleArtifacts {
        entries: manifest,
        zip_bytes: cursor.into_inner(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        InputLineage, RecordValidation, SourceCitation, TraceDraft, TraceRecorder, TraceType,
    };
    use chrono::{TimeZone, Utc};

    fn chain_of(n: usize) -> Vec<DecisionTraceRecord> {
        let mut recorder = TraceRecorder::new();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        for i in 0..n {
            recorder.record(TraceDraft {
                trace_id: None,
                trace_type: TraceType::RateCalculation,
                case_id: "CASE-001".to_string(),
                initiated_at: at,
                completed_at: at,
                input_lineage: InputLineage {
                    primary_sources: vec![SourceCitation {
                        source_id: format!("atom-{}", i % 2),
                        source_hash: "cd".repeat(32),
                        source_type: "complaints".to_string(),
                    }],
                },
                derived_inputs: Vec::new(),
                obligations: vec!["MDR Art. 86".to_string()],
                reasoning_steps: Vec::new(),
                output_content: serde_json::json!({"step": i}),
                validation: RecordValidation {
                    pass: true,
                    messages: Vec::new(),
                },
            });
        }
        recorder.chain()
    }

    #[test]
    fn audit_jsonl_round_trips_content_hashes() {
        let chain = chain_of(3);
        let jsonl = render_audit_jsonl(&chain).unwrap();
        assert!(jsonl.ends_with('\n'));
        for (line, original) in jsonl.lines().zip(&chain) {
            let mut value: Value = serde_json::from_str(line).unwrap();
            let stored_hash = value["hashChain"]["contentHash"].as_str().unwrap().to_string();
            value.as_object_mut().unwrap().remove("hashChain");
            let recomputed = crate::provenance::content_hash(&value).unwrap();
            assert_eq!(recomputed, stored_hash);
            assert_eq!(stored_hash, original.hash_chain.content_hash);
        }
    }

    #[test]
    fn context_graph_dedups_atoms_and_chains_records() {
        let chain = chain_of(3);
        let graph = render_context_graph(&chain);
        let nodes = graph["elements"]["nodes"].as_array().unwrap();
        let edges = graph["elements"]["edges"].as_array().unwrap();
        // 3 DTR nodes + 2 distinct atoms.
        assert_eq!(nodes.len(), 5);
        let next_edges = edges
            .iter()
            .filter(|e| e["data"]["label"] == "next")
            .count();
        assert_eq!(next_edges, 2);
        let input_edges = edges
            .iter()
            .filter(|e| e["data"]["label"] == "input")
            .count();
        assert_eq!(input_edges, 3);
    }

    #[test]
    fn audit_summary_contains_chain_table_and_merkle_root() {
        let chain = chain_of(2);
        let summary = render_audit_summary(&chain);
        assert!(summary.contains("| 0 |"));
        assert!(summary.contains("| 1 |"));
        assert!(summary.contains(&chain[1].hash_chain.merkle_root));
        assert!(summary.contains("MDR Art. 86"));
        let short: String = chain[0].hash_chain.content_hash.chars().take(16).collect();
        assert!(summary.contains(&short));
    }
}
