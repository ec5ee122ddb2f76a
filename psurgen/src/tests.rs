// Crate-level pipeline scenarios; module-level unit tests live next to the
// modules they exercise.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::Result;
use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::analytics::trend::TrendDetermination;
use crate::datasets::{
    CanonicalTarget, CapaRow, ComplaintRow, DeviceMaster, DistributionRow, FileDescriptor,
    LiteratureRow, NormalizedPack, PackManifest, PmcfRow, RiskRow, RiskSummary, SalesExposureRow,
    SurveillancePeriod,
};
use crate::ingest::{LoadedPack, PackLoader};
use crate::ledger::{
    validate_records, InputLineage, RecordValidation, TraceDraft, TraceRecorder, TraceType,
};
use crate::model_adapters::{CallEvidence, EnhancedSection, SectionEnhancer, TransportProof};
use crate::orchestrator::{PipelineRuntime, TaskConfig, TaskResultStatus, TaskType};
use crate::provenance;
use crate::render::{ChartRenderer, DocxRenderer};
use crate::sections::SectionResult;
use crate::store::StoreKind;
use crate::validator::{RuleSeverity, RuleStatus, ValidationResult};

struct FixtureLoader {
    loaded: LoadedPack,
}

impl PackLoader for FixtureLoader {
    fn load(&self, _pack_dir: &Path) -> Result<LoadedPack> {
        Ok(self.loaded.clone())
    }
}

/// Deterministic enhancer standing in for a real provider integration. It
/// returns the narrative unchanged and carries a complete evidence record.
struct FixtureEnhancer {
    provider: String,
    request_id_for: fn(&SectionResult) -> String,
}

impl FixtureEnhancer {
    fn genuine() -> Self {
        Self {
            provider: "anthropic".to_string(),
            request_id_for: |section| format!("req_{:06x}", u64::from(section.number) * 7919),
        }
    }

    fn mock() -> Self {
        Self {
            provider: "mock".to_string(),
            request_id_for: |section| format!("req-S{:02}", section.number),
        }
    }
}

impl SectionEnhancer for FixtureEnhancer {
    fn enhance(&self, section: &SectionResult, correlation_id: &str) -> Result<EnhancedSection> {
        let request_id = (self.request_id_for)(section);
        Ok(EnhancedSection {
            narrative: section.narrative.clone(),
            evidence: CallEvidence {
                provider: self.provider.clone(),
                model: "claude-sonnet-4-5".to_string(),
                correlation_id: correlation_id.to_string(),
                provider_request_id: request_id.clone(),
                input_tokens: 640 + u64::from(section.number),
                output_tokens: 210 + u64::from(section.number),
                latency_ms: 1100 + u64::from(section.number),
                transport_proof: TransportProof {
                    sdk: "ureq/2.10".to_string(),
                    endpoint_host: "api.anthropic.com".to_string(),
                    http_status: 200,
                    provider_request_id: request_id.clone(),
                    response_headers_hash: provenance::sha256_hex(request_id.as_bytes()),
                },
            },
        })
    }
}

struct FixtureDocxRenderer;

impl DocxRenderer for FixtureDocxRenderer {
    fn render(
        &self,
        _context: &crate::context::ComputationContext,
        sections: &[SectionResult],
        tables: &[crate::annex::AnnexTableResult],
    ) -> Result<Vec<u8>> {
        let mut bytes = b"PK\x03\x04docx".to_vec();
        bytes.extend_from_slice(format!("{}:{}", sections.len(), tables.len()).as_bytes());
        Ok(bytes)
    }
}

struct FixtureChartRenderer;

impl ChartRenderer for FixtureChartRenderer {
    fn render_trend(&self, trend: &crate::analytics::trend::TrendResult) -> Result<Vec<u8>> {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(format!("{}", trend.monthly_series.len()).as_bytes());
        Ok(bytes)
    }
}

fn complaint(date: NaiveDate, id: &str) -> ComplaintRow {
    ComplaintRow {
        complaint_id: Some(id.to_string()),
        date,
        country: "DE".to_string(),
        problem_code: "P-OCCLUSION".to_string(),
        harm_code: "H-NONE".to_string(),
        root_cause: Some("Use error".to_string()),
        serious: false,
        reportable: false,
        description: None,
    }
}

/// One year of monthly complaint counts against 1,000 units sold per month,
/// with the satellite datasets internally consistent.
fn yearly_pack(year: i32, monthly_complaints: &[u64]) -> LoadedPack {
    let mut pack = NormalizedPack {
        device_master: DeviceMaster {
            device_name: "InfusionMate 300".to_string(),
            manufacturer: "Acme Medical GmbH".to_string(),
            device_class: "IIb".to_string(),
            model_number: Some("IM-300".to_string()),
            basic_udi_di: Some("4056789000012AB".to_string()),
            certificate_number: Some("CE 123456".to_string()),
            intended_purpose: Some("Volumetric infusion of fluids".to_string()),
        },
        risk_summary: RiskSummary {
            risks: vec![RiskRow {
                hazard_id: Some("HAZ-01".to_string()),
                hazard: "Over-infusion".to_string(),
                residual_risk_level: "LOW".to_string(),
                mitigation: Some("Flow sensor cross-check".to_string()),
            }],
            prior_conclusion: "Benefit-risk profile acceptable".to_string(),
            current_conclusion: "Benefit-risk profile acceptable".to_string(),
        },
        ..NormalizedPack::default()
    };

    for (index, count) in monthly_complaints.iter().enumerate() {
        let month = index as u32 + 1;
        pack.sales_exposure.push(SalesExposureRow {
            period: format!("{year}-{month:02}"),
            country: "DE".to_string(),
            units_sold: 1000,
        });
        for i in 0..*count {
            pack.complaints.push(complaint(
                NaiveDate::from_ymd_opt(year, month, 10).unwrap(),
                &format!("C-{year}-{month:02}-{i}"),
            ));
        }
    }

    pack.capa.push(CapaRow {
        capa_id: "CAPA-2024-01".to_string(),
        opened_date: NaiveDate::from_ymd_opt(year, 2, 1).unwrap(),
        closed_date: NaiveDate::from_ymd_opt(year, 3, 15),
        status: "closed".to_string(),
        description: "Tubing supplier change".to_string(),
        linked_complaint_id: None,
    });
    pack.literature.push(LiteratureRow {
        citation_id: Some("LIT-001".to_string()),
        title: "Infusion pump occlusion events in clinical practice".to_string(),
        source: Some("J Med Eng".to_string()),
        relevant: true,
        summary: None,
    });
    pack.pmcf.push(PmcfRow {
        activity_id: Some("PMCF-01".to_string()),
        title: "User satisfaction survey".to_string(),
        status: "completed".to_string(),
        findings: Some("No new hazards".to_string()),
    });
    pack.distribution.push(DistributionRow {
        country: "DE".to_string(),
        region: Some("EU".to_string()),
        units_distributed: 12_000,
    });

    let targets = [
        (CanonicalTarget::DeviceMaster, "device_master.json"),
        (CanonicalTarget::SalesExposure, "sales_exposure.csv"),
        (CanonicalTarget::Complaints, "complaints.csv"),
        (CanonicalTarget::SeriousIncidents, "serious_incidents.csv"),
        (CanonicalTarget::Capa, "capa.csv"),
        (CanonicalTarget::Fsca, "fsca.csv"),
        (CanonicalTarget::Literature, "literature.csv"),
        (CanonicalTarget::Pmcf, "pmcf.csv"),
        (CanonicalTarget::RiskSummary, "risk_summary.json"),
        (CanonicalTarget::Distribution, "distribution.csv"),
        (CanonicalTarget::Vigilance, "vigilance.csv"),
    ];
    let manifest = PackManifest {
        case_id: "CASE-001".to_string(),
        device: pack.device_master.clone(),
        period: SurveillancePeriod {
            start: NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(year, 12, 31).unwrap(),
        },
        files: targets
            .iter()
            .map(|(target, name)| FileDescriptor {
                file_name: name.to_string(),
                canonical_target: *target,
                description: None,
            })
            .collect(),
    };
    let file_hashes: BTreeMap<String, String> = targets
        .iter()
        .map(|(_, name)| (name.to_string(), provenance::sha256_hex(name.as_bytes())))
        .collect();

    LoadedPack {
        manifest,
        file_hashes,
        data: pack,
    }
}

fn run_pipeline(
    loaded: LoadedPack,
    enhancer: &FixtureEnhancer,
) -> (crate::orchestrator::RunOutcome, tempfile::TempDir) {
    let output_dir = tempfile::tempdir().expect("create output dir");
    let config = TaskConfig {
        pack_dir: output_dir.path().join("pack"),
        case_id: loaded.manifest.case_id.clone(),
        output_dir: output_dir.path().to_path_buf(),
        template_id: Some("psur-standard-v1".to_string()),
        client_id: None,
    };
    let loader = FixtureLoader { loaded };
    let outcome = PipelineRuntime::new(
        config,
        &loader,
        enhancer,
        &FixtureDocxRenderer,
        &FixtureChartRenderer,
    )
    .execute();
    (outcome, output_dir)
}

fn validation_results(outcome: &crate::orchestrator::RunOutcome) -> Vec<ValidationResult> {
    outcome
        .store
        .get_as(StoreKind::ValidationResults, "results")
        .expect("validation results stored")
}

fn rule<'a>(results: &'a [ValidationResult], key: &str) -> &'a ValidationResult {
    results
        .iter()
        .find(|result| result.rule_key == key)
        .unwrap_or_else(|| panic!("rule {key} missing"))
}

#[test]
fn clean_twelve_month_run_produces_no_trend_and_full_coverage() {
    let enhancer = FixtureEnhancer::genuine();
    let (outcome, _dir) = run_pipeline(yearly_pack(2024, &[1; 12]), &enhancer);
    assert!(outcome.succeeded, "{:?}", outcome.task_results);
    assert_eq!(outcome.task_results.len(), 13);
    assert!(outcome
        .task_results
        .iter()
        .all(|(_, result)| result.status == TaskResultStatus::Success));

    // Every section and annex table landed in the store.
    for number in 1..=12u32 {
        assert!(outcome.store.has(StoreKind::Sections, &format!("S{number:02}")));
        assert!(outcome.store.has(StoreKind::AnnexTables, &format!("A{number:02}")));
    }

    let ctx: crate::context::ComputationContext = outcome
        .store
        .get_as(StoreKind::Context, "CASE-001")
        .expect("context stored");
    let trend = &ctx.analytics.trend;
    assert_eq!(trend.mean, 1.0);
    assert_eq!(trend.std_dev, 0.0);
    assert_eq!(trend.ucl, 1.0);
    assert!(trend.western_electric_violations.is_empty());
    assert_eq!(trend.determination, TrendDetermination::NoTrend);

    let s05 = ctx
        .sections
        .iter()
        .find(|section| section.section_id == "S05")
        .expect("S05 generated");
    assert!(
        s05.narrative.contains("Mean complaint rate: 1 per 1,000 units"),
        "{}",
        s05.narrative
    );
    assert!(ctx.sections.iter().all(|section| {
        !section.provenance.evidence_atom_ids.is_empty() && !section.claims.is_empty()
    }));

    // 1 ingest + 1 metrics + 1 annex + 1 sections + 12 enhancements +
    // 1 validation + 1 export.
    let chain = outcome.recorder.chain();
    assert_eq!(chain.len(), 18);
    for (index, record) in chain.iter().enumerate() {
        assert_eq!(record.chain_position, index as u64);
    }
    assert!(outcome.recorder.validate_chain().valid);

    let results = validation_results(&outcome);
    assert!(results
        .iter()
        .filter(|result| result.severity == RuleSeverity::Critical)
        .all(|result| result.status == RuleStatus::Pass));
    assert_eq!(rule(&results, "strict_llm_proof_required").status, RuleStatus::Pass);
    assert_eq!(rule(&results, "strict_llm_coverage").status, RuleStatus::Pass);
    assert_eq!(rule(&results, "minimum_datapoints").status, RuleStatus::Pass);

    assert!(outcome.store.has(StoreKind::ZipBundle, "bundle"));
    assert!(outcome.store.has(StoreKind::ChainVerification, "result"));
}

#[test]
fn rule_one_spike_detects_trend_end_to_end() {
    let mut counts = [1u64; 12];
    counts[5] = 20;
    let enhancer = FixtureEnhancer::genuine();
    let (outcome, _dir) = run_pipeline(yearly_pack(2024, &counts), &enhancer);
    assert!(outcome.succeeded);

    let ctx: crate::context::ComputationContext =
        outcome.store.get_as(StoreKind::Context, "CASE-001").unwrap();
    let trend = &ctx.analytics.trend;
    assert_eq!(trend.determination, TrendDetermination::TrendDetected);
    assert_eq!(trend.mean, crate::analytics::round4(31.0 / 12.0));
    assert!(trend.ucl > 18.0 && trend.ucl < 19.0, "ucl = {}", trend.ucl);
    let rule_1: Vec<_> = trend
        .western_electric_violations
        .iter()
        .filter(|violation| violation.rule == "Rule 1")
        .collect();
    assert_eq!(rule_1.len(), 1);
    assert_eq!(rule_1[0].periods, vec!["2024-06".to_string()]);

    let results = validation_results(&outcome);
    assert_eq!(rule(&results, "trend_with_evidence").status, RuleStatus::Pass);
    // Adverse determination flows through S11/S12 consistently.
    assert_eq!(
        rule(&results, "psur_benefit_risk_consistency").status,
        RuleStatus::Pass
    );
    let s12 = ctx.sections.iter().find(|s| s.section_id == "S12").unwrap();
    assert!(s12.narrative.contains("adversely impacted"));
}

#[test]
fn six_month_run_is_inconclusive_with_datapoint_warning() {
    let enhancer = FixtureEnhancer::genuine();
    let (outcome, _dir) = run_pipeline(yearly_pack(2024, &[2; 6]), &enhancer);
    assert!(outcome.succeeded);

    let ctx: crate::context::ComputationContext =
        outcome.store.get_as(StoreKind::Context, "CASE-001").unwrap();
    assert_eq!(ctx.analytics.trend.determination, TrendDetermination::Inconclusive);

    let results = validation_results(&outcome);
    let datapoints = rule(&results, "minimum_datapoints");
    assert_eq!(datapoints.severity, RuleSeverity::Major);
    assert_eq!(datapoints.status, RuleStatus::Warn);
    let trend_rule = rule(&results, "trend_with_evidence");
    assert_eq!(trend_rule.severity, RuleSeverity::Critical);
    assert_eq!(trend_rule.status, RuleStatus::Pass);
}

#[test]
fn out_of_period_complaint_fails_period_coverage() {
    let mut loaded = yearly_pack(2023, &[1; 12]);
    loaded.data.complaints.push(complaint(
        NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        "C-LATE",
    ));
    let enhancer = FixtureEnhancer::genuine();
    let (outcome, _dir) = run_pipeline(loaded, &enhancer);
    assert!(outcome.succeeded);

    let results = validation_results(&outcome);
    let coverage = rule(&results, "surveillance_period_coverage");
    assert_eq!(coverage.severity, RuleSeverity::Critical);
    assert_eq!(coverage.status, RuleStatus::Fail);
    let context = coverage.context.as_ref().expect("coverage context");
    assert_eq!(context["dataStart"], Value::String("2023-01-10".to_string()));
    assert_eq!(context["dataEnd"], Value::String("2024-01-05".to_string()));

    // The reconciliation error surfaces downgraded, not fatal.
    let reconciliation = rule(&results, "psur_reconciliation");
    assert_eq!(reconciliation.severity, RuleSeverity::Major);
    assert_eq!(reconciliation.status, RuleStatus::Warn);
}

#[test]
fn mock_provider_fails_validation_but_bundle_still_builds() {
    let enhancer = FixtureEnhancer::mock();
    let (outcome, _dir) = run_pipeline(yearly_pack(2024, &[1; 12]), &enhancer);
    assert!(outcome.succeeded, "{:?}", outcome.task_results);

    let results = validation_results(&outcome);
    let provider_rule = rule(&results, "mock_proof_provider");
    assert_eq!(provider_rule.severity, RuleSeverity::Critical);
    assert_eq!(provider_rule.status, RuleStatus::Fail);
    assert_eq!(rule(&results, "mock_proof_request_id").status, RuleStatus::Fail);

    // Chain integrity is independent of validation findings.
    assert!(outcome.store.has(StoreKind::ZipBundle, "bundle"));
    let verification: crate::ledger::ChainVerification = outcome
        .store
        .get_as(StoreKind::ChainVerification, "result")
        .unwrap();
    assert!(verification.valid);
}

#[test]
fn bundle_audit_jsonl_round_trips_from_the_zip() {
    let enhancer = FixtureEnhancer::genuine();
    let (outcome, dir) = run_pipeline(yearly_pack(2024, &[1; 12]), &enhancer);
    assert!(outcome.succeeded);

    let zip_bytes = outcome
        .store
        .get_bytes(StoreKind::ZipBundle, "bundle")
        .unwrap()
        .to_vec();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(zip_bytes)).unwrap();
    let mut jsonl = String::new();
    archive
        .by_name("audit/audit.jsonl")
        .unwrap()
        .read_to_string(&mut jsonl)
        .unwrap();
    assert!(jsonl.ends_with('\n'));

    let mut previous_hash: Option<String> = None;
    let mut content_hashes = Vec::new();
    for line in jsonl.lines() {
        let mut record: Value = serde_json::from_str(line).unwrap();
        let stored = record["hashChain"]["contentHash"].as_str().unwrap().to_string();
        assert_eq!(
            record["hashChain"]["previousHash"].as_str().map(str::to_string),
            previous_hash
        );
        record.as_object_mut().unwrap().remove("hashChain");
        assert_eq!(provenance::content_hash(&record).unwrap(), stored);
        previous_hash = Some(stored.clone());
        content_hashes.push(stored);
    }
    // The export record is appended after the bundle is cut.
    assert_eq!(content_hashes.len(), outcome.recorder.len() - 1);

    // The bundle zip also landed on disk.
    assert!(dir.path().join("psur_bundle.zip").exists());
}

#[test]
fn fixture_substituted_chains_are_byte_identical_across_runs() {
    let build_chain = || {
        let mut recorder = TraceRecorder::new();
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        for position in 0..5u64 {
            recorder.record(TraceDraft {
                trace_id: Some(Uuid::from_u128(0xAA00 + u128::from(position))),
                trace_type: TraceType::RateCalculation,
                case_id: "CASE-001".to_string(),
                initiated_at: at,
                completed_at: at + chrono::Duration::milliseconds(5),
                input_lineage: InputLineage::default(),
                derived_inputs: Vec::new(),
                obligations: vec!["MDR Art. 86".to_string()],
                reasoning_steps: Vec::new(),
                output_content: serde_json::json!({ "position": position }),
                validation: RecordValidation {
                    pass: true,
                    messages: Vec::new(),
                },
            });
        }
        recorder.chain()
    };

    let first = build_chain();
    let second = build_chain();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert!(validate_records(&first).valid);
}

#[test]
fn halted_run_returns_partial_results() {
    struct FailingLoader;
    impl PackLoader for FailingLoader {
        fn load(&self, _pack_dir: &Path) -> Result<LoadedPack> {
            Err(anyhow::anyhow!("pack directory unreadable"))
        }
    }

    let output_dir = tempfile::tempdir().unwrap();
    let config = TaskConfig {
        pack_dir: output_dir.path().join("pack"),
        case_id: "CASE-001".to_string(),
        output_dir: output_dir.path().to_path_buf(),
        template_id: None,
        client_id: None,
    };
    let enhancer = FixtureEnhancer::genuine();
    let outcome = PipelineRuntime::new(
        config,
        &FailingLoader,
        &enhancer,
        &FixtureDocxRenderer,
        &FixtureChartRenderer,
    )
    .execute();

    assert!(!outcome.succeeded);
    assert_eq!(outcome.task_results.len(), 1);
    let (task, result) = &outcome.task_results[0];
    assert_eq!(*task, TaskType::PackLoad);
    assert_eq!(result.status, TaskResultStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("unreadable"));
    assert!(outcome.recorder.is_empty());
    assert!(!outcome.store.has(StoreKind::ZipBundle, "bundle"));
}
