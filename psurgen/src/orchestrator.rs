//! orchestrator.rs: the task DAG and the sequential pipeline runtime.
//!
//! Thirteen tasks communicate exclusively through the content-addressed run
//! store, execute in a deterministic topological order, and (where they
//! compute or decide) append decision trace records to the run's ledger.
//! Although the DAG admits parallelism, execution is strictly sequential so
//! that chain positions are deterministic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::analytics::kernels;
use crate::analytics::trend::trend_analysis;
use crate::analytics::DerivedInputRef;
use crate::annex;
use crate::context::{AnalyticsResults, ComputationContext};
use crate::datasets::{self, NormalizedPack, PackManifest};
use crate::ingest::{self, EvidenceAtomRef, PackLoader};
use crate::ledger::{
    DerivedInputCitation, InputLineage, ReasoningStep, RecordValidation, SourceCitation,
    TraceDraft, TraceRecorder, TraceType,
};
use crate::model_adapters::SectionEnhancer;
use crate::portability;
use crate::reconcile::{self, ReconciliationResult};
use crate::render::{ChartRenderer, DocxRenderer};
use crate::sections;
use crate::store::{RunStore, StoreKind, StoreRef};
use crate::validator::{self, RuleSeverity, RuleStatus};
use crate::Error;

/// The primary regulatory obligation every trace record cites.
const PRIMARY_OBLIGATION: &str = "MDR Art. 86";
/// Bundle file name written into the output directory.
const BUNDLE_FILE_NAME: &str = "psur_bundle.zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    PackLoad,
    EvidenceIngest,
    NormalizeDatasets,
    QualifyData,
    Reconcile,
    ComputeMetrics,
    BuildAnnexTables,
    GenerateSections,
    LlmEnhanceSections,
    ValidatePsur,
    RenderDocx,
    ExportBundle,
    VerifyTraceChain,
}

impl TaskType {
    /// Definition order; topological sorting starts from every entry in turn.
    pub fn all() -> [TaskType; 13] {
        [
            TaskType::PackLoad,
            TaskType::EvidenceIngest,
            TaskType::NormalizeDatasets,
            TaskType::QualifyData,
            TaskType::Reconcile,
            TaskType::ComputeMetrics,
            TaskType::BuildAnnexTables,
            TaskType::GenerateSections,
            TaskType::LlmEnhanceSections,
            TaskType::ValidatePsur,
            TaskType::RenderDocx,
            TaskType::ExportBundle,
            TaskType::VerifyTraceChain,
        ]
    }

    pub fn dependencies(&self) -> &'static [TaskType] {
        match self {
            TaskType::PackLoad => &[],
            TaskType::EvidenceIngest => &[TaskType::PackLoad],
            TaskType::NormalizeDatasets => &[TaskType::PackLoad],
            TaskType::QualifyData => &[TaskType::NormalizeDatasets],
            TaskType::Reconcile => &[TaskType::NormalizeDatasets],
            TaskType::ComputeMetrics => &[TaskType::EvidenceIngest, TaskType::QualifyData],
            TaskType::BuildAnnexTables => &[TaskType::ComputeMetrics],
            TaskType::GenerateSections => &[TaskType::BuildAnnexTables, TaskType::Reconcile],
            TaskType::LlmEnhanceSections => &[TaskType::GenerateSections],
            TaskType::ValidatePsur => &[TaskType::LlmEnhanceSections, TaskType::Reconcile],
            TaskType::RenderDocx => &[TaskType::ValidatePsur],
            TaskType::ExportBundle => &[TaskType::RenderDocx],
            TaskType::VerifyTraceChain => &[TaskType::ExportBundle],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::PackLoad => "PACK_LOAD",
            TaskType::EvidenceIngest => "EVIDENCE_INGEST",
            TaskType::NormalizeDatasets => "NORMALIZE_DATASETS",
            TaskType::QualifyData => "QUALIFY_DATA",
            TaskType::Reconcile => "RECONCILE",
            TaskType::ComputeMetrics => "COMPUTE_METRICS",
            TaskType::BuildAnnexTables => "BUILD_ANNEX_TABLES",
            TaskType::GenerateSections => "GENERATE_SECTIONS",
            TaskType::LlmEnhanceSections => "LLM_ENHANCE_SECTIONS",
            TaskType::ValidatePsur => "VALIDATE_PSUR",
            TaskType::RenderDocx => "RENDER_DOCX",
            TaskType::ExportBundle => "EXPORT_BUNDLE",
            TaskType::VerifyTraceChain => "VERIFY_TRACE_CHAIN",
        }
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TaskType::all()
            .into_iter()
            .find(|task| task.as_str() == raw)
            .ok_or_else(|| Error::UnknownTaskType(raw.to_string()))
    }
}

/// Depth-first topological order over the dependency table, visiting every
/// task in definition order and eliding duplicates.
pub fn topological_order() -> Vec<TaskType> {
    fn visit(task: TaskType, visited: &mut Vec<TaskType>) {
        if visited.contains(&task) {
            return;
        }
        for dependency in task.dependencies() {
            visit(*dependency, visited);
        }
        visited.push(task);
    }

    let mut order = Vec::with_capacity(13);
    for task in TaskType::all() {
        visit(task, &mut order);
    }
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub status: TaskResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-task lifecycle; terminal in one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// What a task receives alongside the store and config.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInputBundle {
    pub task_type: TaskType,
    pub task_id: Uuid,
    pub correlation_id: String,
    pub input_refs: Vec<StoreRef>,
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub pack_dir: PathBuf,
    pub case_id: String,
    pub output_dir: PathBuf,
    pub template_id: Option<String>,
    pub client_id: Option<String>,
}

/// Everything a finished (or halted) run hands back for inspection.
pub struct RunOutcome {
    pub correlation_id: String,
    pub succeeded: bool,
    pub task_results: Vec<(TaskType, TaskResult)>,
    pub task_states: HashMap<TaskType, TaskState>,
    pub store: RunStore,
    pub recorder: TraceRecorder,
}

/// The sequential pipeline runtime. One runtime owns one store, one recorder,
/// and one correlation id; none of them outlive the run.
pub struct PipelineRuntime<'a> {
    config: TaskConfig,
    loader: &'a dyn PackLoader,
    enhancer: &'a dyn SectionEnhancer,
    docx_renderer: &'a dyn DocxRenderer,
    chart_renderer: &'a dyn ChartRenderer,
    store: RunStore,
    recorder: TraceRecorder,
}

impl<'a> PipelineRuntime<'a> {
    pub fn new(
        config: TaskConfig,
        loader: &'a dyn PackLoader,
        enhancer: &'a dyn SectionEnhancer,
        docx_renderer: &'a dyn DocxRenderer,
        chart_renderer: &'a dyn ChartRenderer,
    ) -> Self {
        Self {
            config,
            loader,
            enhancer,
            docx_renderer,
            chart_renderer,
            store: RunStore::new(),
            recorder: TraceRecorder::new(),
        }
    }

    /// Execute the full DAG sequentially. The first non-success halts the run;
    /// the partial results, store, and recorder are returned either way.
    pub fn execute(mut self) -> RunOutcome {
        let order = topological_order();
        let mut task_results = Vec::new();
        let mut task_states: HashMap<TaskType, TaskState> =
            order.iter().map(|task| (*task, TaskState::Pending)).collect();
        let mut succeeded = true;

        for task in order {
            task_states.insert(task, TaskState::Running);
            let bundle = TaskInputBundle {
                task_type: task,
                task_id: Uuid::new_v4(),
                correlation_id: self.recorder.correlation_id().to_string(),
                input_refs: self.input_refs_for(task),
            };
            let span = tracing::info_span!(
                "task",
                task = task.as_str(),
                task_id = %bundle.task_id,
                correlation_id = %bundle.correlation_id,
                inputs = bundle.input_refs.len()
            );
            let _guard = span.enter();
            let started = std::time::Instant::now();

            let result = match self.dispatch(task) {
                Ok(output) => TaskResult {
                    status: TaskResultStatus::Success,
                    output: Some(output),
                    error: None,
                    reason: None,
                },
                Err(err) => TaskResult {
                    status: TaskResultStatus::Failed,
                    output: None,
                    error: Some(err.to_string()),
                    reason: None,
                },
            };

            tracing::info!(
                task = task.as_str(),
                status = ?result.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "task finished"
            );

            let terminal = match result.status {
                TaskResultStatus::Success => TaskState::Succeeded,
                TaskResultStatus::Failed => TaskState::Failed,
                TaskResultStatus::Skipped => TaskState::Skipped,
            };
            task_states.insert(task, terminal);
            let halt = result.status != TaskResultStatus::Success;
            task_results.push((task, result));
            if halt {
                succeeded = false;
                break;
            }
        }

        RunOutcome {
            correlation_id: self.recorder.correlation_id().to_string(),
            succeeded,
            task_results,
            task_states,
            store: self.store,
            recorder: self.recorder,
        }
    }

    /// References to the slots a task is declared to read. Slots a prior task
    /// has not populated yet are simply absent from the bundle.
    fn input_refs_for(&self, task: TaskType) -> Vec<StoreRef> {
        let case_id = self.config.case_id.as_str();
        let slots: &[(StoreKind, &str)] = match task {
            TaskType::PackLoad | TaskType::VerifyTraceChain => &[],
            TaskType::EvidenceIngest => &[(StoreKind::Manifest, ""), (StoreKind::FileHashes, "pack")],
            TaskType::NormalizeDatasets => &[(StoreKind::NormalizedData, "raw")],
            TaskType::QualifyData => &[(StoreKind::NormalizedData, "pack")],
            TaskType::Reconcile => &[(StoreKind::NormalizedData, "pack"), (StoreKind::Manifest, "")],
            TaskType::ComputeMetrics => &[
                (StoreKind::QualifiedData, "pack"),
                (StoreKind::EvidenceAtoms, "atoms"),
                (StoreKind::Manifest, ""),
            ],
            TaskType::BuildAnnexTables | TaskType::LlmEnhanceSections | TaskType::RenderDocx => {
                &[(StoreKind::Context, "")]
            }
            TaskType::GenerateSections | TaskType::ValidatePsur => {
                &[(StoreKind::Context, ""), (StoreKind::Reconciliation, "result")]
            }
            TaskType::ExportBundle => &[
                (StoreKind::Context, ""),
                (StoreKind::DocxBuffer, "psur"),
                (StoreKind::ChartBuffer, "trend"),
            ],
        };
        slots
            .iter()
            .filter_map(|&(kind, id)| {
                let id = if id.is_empty() { case_id } else { id };
                self.store.ref_of(kind, id).ok()
            })
            .collect()
    }

    fn dispatch(&mut self, task: TaskType) -> Result<Value, Error> {
        match task {
            TaskType::PackLoad => self.task_pack_load(),
            TaskType::EvidenceIngest => self.task_evidence_ingest(),
            TaskType::NormalizeDatasets => self.task_normalize_datasets(),
            TaskType::QualifyData => self.task_qualify_data(),
            TaskType::Reconcile => self.task_reconcile(),
            TaskType::ComputeMetrics => self.task_compute_metrics(),
            TaskType::BuildAnnexTables => self.task_build_annex_tables(),
            TaskType::GenerateSections => self.task_generate_sections(),
            TaskType::LlmEnhanceSections => self.task_llm_enhance_sections(),
            TaskType::ValidatePsur => self.task_validate_psur(),
            TaskType::RenderDocx => self.task_render_docx(),
            TaskType::ExportBundle => self.task_export_bundle(),
            TaskType::VerifyTraceChain => self.task_verify_trace_chain(),
        }
    }

    fn atom_citations(&self, atoms: &[EvidenceAtomRef]) -> InputLineage {
        InputLineage {
            primary_sources: atoms
                .iter()
                .map(|atom| SourceCitation {
                    source_id: atom.id.to_string(),
                    source_hash: atom.sha256.clone(),
                    source_type: atom.atom_type.clone(),
                })
                .collect(),
        }
    }

    fn record_trace(
        &mut self,
        trace_type: TraceType,
        initiated_at: DateTime<Utc>,
        lineage: InputLineage,
        derived_inputs: Vec<DerivedInputCitation>,
        reasoning_steps: Vec<ReasoningStep>,
        output_content: Value,
        validation: RecordValidation,
    ) {
        self.recorder.record(TraceDraft {
            trace_id: None,
            trace_type,
            case_id: self.config.case_id.clone(),
            initiated_at,
            completed_at: Utc::now(),
            input_lineage: lineage,
            derived_inputs,
            obligations: vec![PRIMARY_OBLIGATION.to_string()],
            reasoning_steps,
            output_content,
            validation,
        });
    }

    fn load_context(&self) -> Result<ComputationContext, Error> {
        self.store.get_as(StoreKind::Context, &self.config.case_id)
    }

    fn save_context(&mut self, ctx: &ComputationContext) -> Result<StoreRef, Error> {
        self.store.put(StoreKind::Context, &self.config.case_id.clone(), ctx)
    }

    fn task_pack_load(&mut self) -> Result<Value, Error> {
        let loaded = self
            .loader
            .load(&self.config.pack_dir)
            .map_err(Error::External)?;
        self.store
            .put(StoreKind::Manifest, &self.config.case_id.clone(), &loaded.manifest)?;
        self.store
            .put(StoreKind::FileHashes, "pack", &loaded.file_hashes)?;
        self.store.put(StoreKind::NormalizedData, "raw", &loaded.data)?;
        if let Some(template_id) = self.config.template_id.clone() {
            self.store
                .put(StoreKind::TemplateUsed, "template", &json!({ "templateId": template_id }))?;
        }
        Ok(json!({
            "files": loaded.manifest.files.len(),
            "caseId": loaded.manifest.case_id,
        }))
    }

    fn task_evidence_ingest(&mut self) -> Result<Value, Error> {
        let initiated_at = Utc::now();
        let manifest: PackManifest = self.store.get_as(StoreKind::Manifest, &self.config.case_id)?;
        let file_hashes = self
            .store
            .get_as::<std::collections::BTreeMap<String, String>>(StoreKind::FileHashes, "pack")?;
        let atoms = ingest::mint_evidence_atoms(&manifest, &file_hashes).map_err(Error::External)?;
        self.store.put(StoreKind::EvidenceAtoms, "atoms", &atoms)?;

        let lineage = self.atom_citations(&atoms);
        let reasoning = vec![
            ReasoningStep {
                step_number: 1,
                action: "hash_sources".to_string(),
                detail: format!("hashed {} pack files at ingest", atoms.len()),
            },
            ReasoningStep {
                step_number: 2,
                action: "mint_atoms".to_string(),
                detail: "assigned one immutable evidence atom per source file".to_string(),
            },
        ];
        self.record_trace(
            TraceType::DataQualification,
            initiated_at,
            lineage,
            Vec::new(),
            reasoning,
            json!({ "evidenceAtoms": atoms.len() }),
            RecordValidation {
                pass: true,
                messages: Vec::new(),
            },
        );
        Ok(json!({ "evidenceAtoms": atoms.len() }))
    }

    fn task_normalize_datasets(&mut self) -> Result<Value, Error> {
        let mut pack: NormalizedPack = self.store.get_as(StoreKind::NormalizedData, "raw")?;
        // Canonical row order: complaints by date, exposure by period, so
        // every downstream grouping is insertion-order deterministic.
        pack.complaints.sort_by(|a, b| a.date.cmp(&b.date));
        pack.sales_exposure.sort_by(|a, b| a.period.cmp(&b.period));
        pack.serious_incidents.sort_by(|a, b| a.date.cmp(&b.date));
        self.store.put(StoreKind::NormalizedData, "pack", &pack)?;
        Ok(json!({
            "complaints": pack.complaints.len(),
            "exposureRows": pack.sales_exposure.len(),
        }))
    }

    fn task_qualify_data(&mut self) -> Result<Value, Error> {
        let pack: NormalizedPack = self.store.get_as(StoreKind::NormalizedData, "pack")?;
        let (qualified, report) = datasets::qualify(&pack);
        self.store.put(StoreKind::QualifiedData, "pack", &qualified)?;
        self.store.put(StoreKind::QualifiedData, "report", &report)?;
        Ok(serde_json::to_value(&report).map_err(|err| Error::External(err.into()))?)
    }

    fn task_reconcile(&mut self) -> Result<Value, Error> {
        let pack: NormalizedPack = self.store.get_as(StoreKind::NormalizedData, "pack")?;
        let manifest: PackManifest = self.store.get_as(StoreKind::Manifest, &self.config.case_id)?;
        let result = reconcile::reconcile(&pack, &manifest.period);
        self.store.put(StoreKind::Reconciliation, "result", &result)?;
        Ok(json!({
            "passed": result.passed,
            "findings": result.findings.len(),
            "limitations": result.limitations.len(),
        }))
    }

    fn task_compute_metrics(&mut self) -> Result<Value, Error> {
        let initiated_at = Utc::now();
        let pack: NormalizedPack = self.store.get_as(StoreKind::QualifiedData, "pack")?;
        let atoms: Vec<EvidenceAtomRef> = self.store.get_as(StoreKind::EvidenceAtoms, "atoms")?;
        let manifest: PackManifest = self.store.get_as(StoreKind::Manifest, &self.config.case_id)?;

        let (exposure, d_exposure) = kernels::exposure_analytics(&pack.sales_exposure);
        let (complaints, d_complaints) = kernels::complaint_analytics(&pack.complaints);
        let (incidents, d_incidents) =
            kernels::incident_analytics(&pack.serious_incidents, exposure.total_units);
        let (capa, d_capa) = kernels::capa_analytics(&pack.capa);
        let (fsca, d_fsca) = kernels::fsca_analytics(&pack.fsca);
        let (literature, d_literature) = kernels::literature_analytics(&pack.literature);
        let (pmcf, d_pmcf) = kernels::pmcf_analytics(&pack.pmcf);
        let (risk, d_risk) = kernels::risk_analytics(&pack.risk_summary);
        let (trend, d_trend) = trend_analysis(&pack.complaints, &pack.sales_exposure);

        let derived_refs: Vec<DerivedInputRef> = vec![
            d_exposure,
            d_complaints,
            d_incidents,
            d_capa,
            d_fsca,
            d_literature,
            d_pmcf,
            d_risk,
            d_trend,
        ];
        let input_rows = [
            pack.sales_exposure.len(),
            pack.complaints.len(),
            pack.serious_incidents.len(),
            pack.capa.len(),
            pack.fsca.len(),
            pack.literature.len(),
            pack.pmcf.len(),
            pack.risk_summary.risks.len(),
            trend.monthly_series.len(),
        ];

        let analytics = AnalyticsResults {
            exposure,
            complaints,
            incidents,
            capa,
            fsca,
            literature,
            pmcf,
            risk,
            trend,
        };
        self.store.put(StoreKind::Analytics, "results", &analytics)?;
        self.store.put(StoreKind::DerivedInputs, "all", &derived_refs)?;

        let ctx = ComputationContext {
            case_id: self.config.case_id.clone(),
            correlation_id: self.recorder.correlation_id().to_string(),
            device: manifest.device.clone(),
            period: manifest.period,
            datasets: pack,
            analytics,
            evidence_atoms: atoms.clone(),
            derived_inputs: derived_refs.clone(),
            reconciliation: ReconciliationResult::default(),
            sections: Vec::new(),
            annex_tables: Vec::new(),
            validation_results: Vec::new(),
        };
        self.save_context(&ctx)?;

        let citations: Vec<DerivedInputCitation> = derived_refs
            .iter()
            .zip(input_rows)
            .map(|(derived, rows)| DerivedInputCitation {
                formula: derived.formula.clone(),
                parameters: json!({ "inputRows": rows }),
                code_hash: derived.code_hash.clone(),
            })
            .collect();
        let reasoning = vec![
            ReasoningStep {
                step_number: 1,
                action: "aggregate_datasets".to_string(),
                detail: "ran the nine analytics kernels over the qualified datasets".to_string(),
            },
            ReasoningStep {
                step_number: 2,
                action: "spc_evaluation".to_string(),
                detail: ctx.analytics.trend.justification.clone(),
            },
        ];
        let output = json!({
            "totalUnits": ctx.analytics.exposure.total_units,
            "totalComplaints": ctx.analytics.complaints.total,
            "meanRate": ctx.analytics.trend.mean,
            "ucl": ctx.analytics.trend.ucl,
            "determination": ctx.analytics.trend.determination,
            "westernElectricViolations": ctx.analytics.trend.western_electric_violations.len(),
        });
        self.record_trace(
            TraceType::RateCalculation,
            initiated_at,
            self.atom_citations(&atoms),
            citations,
            reasoning,
            output.clone(),
            RecordValidation {
                pass: true,
                messages: Vec::new(),
            },
        );
        Ok(output)
    }

    fn task_build_annex_tables(&mut self) -> Result<Value, Error> {
        let initiated_at = Utc::now();
        let mut ctx = self.load_context()?;
        let tables = annex::build_all(&ctx);
        for table in &tables {
            self.store
                .put(StoreKind::AnnexTables, &table.table_id.clone(), table)?;
        }
        ctx.annex_tables = tables;
        self.save_context(&ctx)?;

        let reasoning = vec![ReasoningStep {
            step_number: 1,
            action: "build_tables".to_string(),
            detail: format!("built {} annex tables from the computation context", ctx.annex_tables.len()),
        }];
        let output = json!({
            "tables": ctx.annex_tables.iter().map(|t| t.table_id.clone()).collect::<Vec<_>>(),
        });
        let atoms = ctx.evidence_atoms.clone();
        self.record_trace(
            TraceType::DerivedSeriesGeneration,
            initiated_at,
            self.atom_citations(&atoms),
            Vec::new(),
            reasoning,
            output.clone(),
            RecordValidation {
                pass: true,
                messages: Vec::new(),
            },
        );
        Ok(output)
    }

    fn task_generate_sections(&mut self) -> Result<Value, Error> {
        let initiated_at = Utc::now();
        let mut ctx = self.load_context()?;
        ctx.reconciliation = self.store.get_as(StoreKind::Reconciliation, "result")?;
        let generated = sections::generate_all(&ctx);
        for section in &generated {
            self.store
                .put(StoreKind::Sections, &section.section_id.clone(), section)?;
        }
        ctx.sections = generated;
        self.save_context(&ctx)?;

        let claim_count: usize = ctx.sections.iter().map(|s| s.claims.len()).sum();
        let reasoning = vec![
            ReasoningStep {
                step_number: 1,
                action: "generate_narratives".to_string(),
                detail: format!("templated {} sections from the computation context", ctx.sections.len()),
            },
            ReasoningStep {
                step_number: 2,
                action: "extract_claims".to_string(),
                detail: format!("extracted {claim_count} claims and linked them to provenance"),
            },
        ];
        let output = json!({
            "sections": ctx.sections.iter().map(|s| s.section_id.clone()).collect::<Vec<_>>(),
            "claims": claim_count,
        });
        let atoms = ctx.evidence_atoms.clone();
        self.record_trace(
            TraceType::BenefitRiskNarrativeGeneration,
            initiated_at,
            self.atom_citations(&atoms),
            Vec::new(),
            reasoning,
            output.clone(),
            RecordValidation {
                pass: true,
                messages: Vec::new(),
            },
        );
        Ok(output)
    }

    fn task_llm_enhance_sections(&mut self) -> Result<Value, Error> {
        let mut ctx = self.load_context()?;
        let mut enhanced_sections = Vec::with_capacity(ctx.sections.len());

        for section in &ctx.sections {
            let initiated_at = Utc::now();
            let enhanced = self
                .enhancer
                .enhance(section, self.recorder.correlation_id())
                .map_err(Error::External)?;

            let mut updated = section.clone();
            updated.narrative = enhanced.narrative;
            updated.claims = sections::extract_claims(&updated.narrative, &updated.provenance);

            let evidence = &enhanced.evidence;
            let output = json!({
                "sectionId": updated.section_id,
                "provider": evidence.provider,
                "model": evidence.model,
                "correlationId": evidence.correlation_id,
                "providerRequestId": evidence.provider_request_id,
                "inputTokens": evidence.input_tokens,
                "outputTokens": evidence.output_tokens,
                "latencyMs": evidence.latency_ms,
                "transportProof": evidence.transport_proof,
            });
            self.store
                .put(StoreKind::LlmCalls, &updated.section_id.clone(), &output)?;
            self.store
                .put(StoreKind::Sections, &updated.section_id.clone(), &updated)?;

            let atom_ids = updated.provenance.evidence_atom_ids.clone();
            let cited_atoms: Vec<EvidenceAtomRef> = ctx
                .evidence_atoms
                .iter()
                .filter(|atom| atom_ids.contains(&atom.id))
                .cloned()
                .collect();
            let reasoning = vec![ReasoningStep {
                step_number: 1,
                action: "enhance_section".to_string(),
                detail: format!(
                    "rewrote section {} narrative via {} ({})",
                    updated.section_id, evidence.provider, evidence.model
                ),
            }];
            self.record_trace(
                TraceType::LlmSectionEnhancement,
                initiated_at,
                self.atom_citations(&cited_atoms),
                Vec::new(),
                reasoning,
                output,
                RecordValidation {
                    pass: true,
                    messages: Vec::new(),
                },
            );
            enhanced_sections.push(updated);
        }

        ctx.sections = enhanced_sections;
        self.save_context(&ctx)?;
        Ok(json!({ "enhancedSections": ctx.sections.len() }))
    }

    fn task_validate_psur(&mut self) -> Result<Value, Error> {
        let initiated_at = Utc::now();
        let mut ctx = self.load_context()?;
        ctx.reconciliation = self.store.get_as(StoreKind::Reconciliation, "result")?;
        let chain = self.recorder.chain();
        let results = validator::validate(&ctx, &chain);
        self.store.put(StoreKind::ValidationResults, "results", &results)?;
        ctx.validation_results = results.clone();
        self.save_context(&ctx)?;

        let critical_fails = results
            .iter()
            .filter(|r| r.severity == RuleSeverity::Critical && r.status == RuleStatus::Fail)
            .count();
        let warns = results.iter().filter(|r| r.status == RuleStatus::Warn).count();
        let output = json!({
            "rules": results.len(),
            "criticalFails": critical_fails,
            "warnings": warns,
        });
        let reasoning = vec![ReasoningStep {
            step_number: 1,
            action: "apply_rules".to_string(),
            detail: format!(
                "evaluated {} validation rules: {critical_fails} critical failure(s), {warns} warning(s)",
                results.len()
            ),
        }];
        let atoms = ctx.evidence_atoms.clone();
        self.record_trace(
            TraceType::ValidationDecision,
            initiated_at,
            self.atom_citations(&atoms),
            Vec::new(),
            reasoning,
            output.clone(),
            RecordValidation {
                pass: critical_fails == 0,
                messages: results
                    .iter()
                    .filter(|r| r.status == RuleStatus::Fail)
                    .map(|r| format!("{}: {}", r.rule_key, r.message))
                    .collect(),
            },
        );
        Ok(output)
    }

    fn task_render_docx(&mut self) -> Result<Value, Error> {
        let ctx = self.load_context()?;
        let chart = self
            .chart_renderer
            .render_trend(&ctx.analytics.trend)
            .map_err(Error::External)?;
        let docx = self
            .docx_renderer
            .render(&ctx, &ctx.sections, &ctx.annex_tables)
            .map_err(Error::External)?;
        let chart_ref = self.store.put_bytes(StoreKind::ChartBuffer, "trend", chart);
        let docx_ref = self.store.put_bytes(StoreKind::DocxBuffer, "psur", docx);
        Ok(json!({
            "docxSha256": docx_ref.content_hash,
            "chartSha256": chart_ref.content_hash,
        }))
    }

    fn task_export_bundle(&mut self) -> Result<Value, Error> {
        let initiated_at = Utc::now();
        let ctx = self.load_context()?;
        let docx = self.store.get_bytes(StoreKind::DocxBuffer, "psur")?.to_vec();
        let chart = self.store.get_bytes(StoreKind::ChartBuffer, "trend")?.to_vec();

        let chain = self.recorder.chain();
        let artifacts =
            portability::build_bundle(&chain, &ctx, &docx, &chart).map_err(Error::External)?;

        std::fs::create_dir_all(&self.config.output_dir)
            .map_err(|err| Error::External(anyhow::anyhow!("failed to create output dir: {err}")))?;
        let bundle_path = self.config.output_dir.join(BUNDLE_FILE_NAME);
        std::fs::write(&bundle_path, &artifacts.zip_bytes)
            .map_err(|err| Error::External(anyhow::anyhow!("failed to write bundle: {err}")))?;

        self.store.put(StoreKind::AuditExports, "files", &artifacts.entries)?;
        let zip_ref = self
            .store
            .put_bytes(StoreKind::ZipBundle, "bundle", artifacts.zip_bytes);
        self.store.put(
            StoreKind::PsurOutput,
            "bundle",
            &json!({
                "bundlePath": bundle_path.display().to_string(),
                "zipSha256": zip_ref.content_hash,
            }),
        )?;

        // Counts the pending export record itself; it is appended below.
        let dtr_records = chain.len() + 1;
        let artifact_count = artifacts.entries.len();
        let output = json!({
            "bundlePath": bundle_path.display().to_string(),
            "zipSha256": zip_ref.content_hash,
            "dtrRecords": dtr_records,
            "artifacts": artifacts.entries,
        });
        let reasoning = vec![ReasoningStep {
            step_number: 1,
            action: "assemble_bundle".to_string(),
            detail: format!(
                "bundled {artifact_count} artifacts and {} trace records into {}",
                chain.len(),
                BUNDLE_FILE_NAME
            ),
        }];
        let atoms = ctx.evidence_atoms.clone();
        self.record_trace(
            TraceType::ExportGeneration,
            initiated_at,
            self.atom_citations(&atoms),
            Vec::new(),
            reasoning,
            output.clone(),
            RecordValidation {
                pass: true,
                messages: Vec::new(),
            },
        );
        Ok(output)
    }

    fn task_verify_trace_chain(&mut self) -> Result<Value, Error> {
        let verification = self.recorder.validate_chain();
        self.store
            .put(StoreKind::ChainVerification, "result", &verification)?;
        if !verification.valid {
            return Err(Error::ChainCorrupt(verification.errors));
        }
        Ok(json!({
            "valid": true,
            "records": self.recorder.len(),
        }))
    }
}
