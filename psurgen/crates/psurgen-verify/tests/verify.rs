use std::fs;
use std::process::Command;

use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use psurgen::analytics::kernels;
use psurgen::analytics::trend::trend_analysis;
use psurgen::context::{AnalyticsResults, ComputationContext};
use psurgen::datasets::{DeviceMaster, NormalizedPack, RiskSummary, SurveillancePeriod};
use psurgen::ledger::{
    InputLineage, RecordValidation, SourceCitation, TraceDraft, TraceRecorder, TraceType,
};
use psurgen::portability;
use psurgen::reconcile::ReconciliationResult;

fn fixture_context() -> ComputationContext {
    let pack = NormalizedPack::default();
    let (exposure, _) = kernels::exposure_analytics(&pack.sales_exposure);
    let (complaints, _) = kernels::complaint_analytics(&pack.complaints);
    let (incidents, _) = kernels::incident_analytics(&pack.serious_incidents, 0);
    let (capa, _) = kernels::capa_analytics(&pack.capa);
    let (fsca, _) = kernels::fsca_analytics(&pack.fsca);
    let (literature, _) = kernels::literature_analytics(&pack.literature);
    let (pmcf, _) = kernels::pmcf_analytics(&pack.pmcf);
    let (risk, _) = kernels::risk_analytics(&RiskSummary::default());
    let (trend, _) = trend_analysis(&pack.complaints, &pack.sales_exposure);

    ComputationContext {
        case_id: "CASE-VERIFY".to_string(),
        correlation_id: "corr-verify".to_string(),
        device: DeviceMaster {
            device_name: "InfusionMate 300".to_string(),
            manufacturer: "Acme Medical GmbH".to_string(),
            device_class: "IIb".to_string(),
            ..DeviceMaster::default()
        },
        period: SurveillancePeriod {
            start: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: chrono::NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        },
        datasets: pack,
        analytics: AnalyticsResults {
            exposure,
            complaints,
            incidents,
            capa,
            fsca,
            literature,
            pmcf,
            risk,
            trend,
        },
        evidence_atoms: Vec::new(),
        derived_inputs: Vec::new(),
        reconciliation: ReconciliationResult::default(),
        sections: Vec::new(),
        annex_tables: Vec::new(),
        validation_results: Vec::new(),
    }
}

fn fixture_chain(records: usize) -> TraceRecorder {
    let mut recorder = TraceRecorder::new();
    let at = Utc.with_ymd_and_hms(2024, 9, 1, 10, 0, 0).unwrap();
    for position in 0..records {
        recorder.record(TraceDraft {
            trace_id: Some(Uuid::from_u128(0xBEEF + position as u128)),
            trace_type: TraceType::RateCalculation,
            case_id: "CASE-VERIFY".to_string(),
            initiated_at: at,
            completed_at: at + chrono::Duration::milliseconds(12),
            input_lineage: InputLineage {
                primary_sources: vec![SourceCitation {
                    source_id: format!("atom-{position}"),
                    source_hash: "ef".repeat(32),
                    source_type: "complaints".to_string(),
                }],
            },
            derived_inputs: Vec::new(),
            obligations: vec!["MDR Art. 86".to_string()],
            reasoning_steps: Vec::new(),
            output_content: json!({ "position": position }),
            validation: RecordValidation {
                pass: true,
                messages: Vec::new(),
            },
        });
    }
    recorder
}

fn run_verifier(path: &std::path::Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_psurgen-verify"))
        .arg(path)
        .arg("--format")
        .arg("json")
        .output()
        .expect("failed to invoke psurgen-verify binary")
}

#[test]
fn verifies_a_freshly_built_bundle() {
    let recorder = fixture_chain(4);
    let artifacts = portability::build_bundle(
        &recorder.chain(),
        &fixture_context(),
        b"PK\x03\x04docx",
        b"\x89PNG\r\n\x1a\n",
    )
    .expect("bundle builds");

    let dir = tempfile::tempdir().unwrap();
    let bundle_path = dir.path().join("psur_bundle.zip");
    fs::write(&bundle_path, &artifacts.zip_bytes).unwrap();

    let output = run_verifier(&bundle_path);
    assert!(
        output.status.success(),
        "verifier failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["overallResult"], json!(true));
    assert_eq!(report["recordsTotal"], json!(4));
    assert_eq!(report["chainValid"], json!(true));
    assert_eq!(report["merkleValid"], json!(true));
}

#[test]
fn rejects_a_tampered_audit_trail() {
    let recorder = fixture_chain(4);
    let mut chain = recorder.chain();
    chain[1].output_content = json!({ "position": "tampered" });

    let jsonl = portability::render_audit_jsonl(&chain).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let trail_path = dir.path().join("audit.jsonl");
    fs::write(&trail_path, jsonl).unwrap();

    let output = run_verifier(&trail_path);
    assert!(!output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["overallResult"], json!(false));
    assert_eq!(report["chainValid"], json!(false));
    let errors = report["errors"].as_array().unwrap();
    assert!(errors
        .iter()
        .any(|error| error.as_str().unwrap().contains("DTR 1: content hash mismatch")));
    assert!(errors.iter().any(|error| error
        .as_str()
        .unwrap()
        .contains("DTR 2: previous hash does not match prior DTR content hash")));
}
