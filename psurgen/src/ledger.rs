//! ledger.rs: the append-only decision trace recorder.
//!
//! Every computation or decision in a run appends one Decision Trace Record
//! (DTR). Records are hash-chained: each carries a content hash over its own
//! fields (minus the hash chain itself), a pointer to the previous record's
//! content hash, and the Merkle root folded over every content hash so far.
//! The chain is the integrity substrate of the whole system; tampering with
//! any emitted record is detectable by `validate_chain`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::provenance;

/// Decision categories a trace record can describe.
///
/// `UclCalculation`, `WesternElectricEvaluation`, `TrendDetermination`, and
/// `ClaimExtraction` are reserved slots; the pipeline consolidates those
/// computations into `RateCalculation` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceType {
    DataQualification,
    DerivedSeriesGeneration,
    RateCalculation,
    UclCalculation,
    WesternElectricEvaluation,
    TrendDetermination,
    BenefitRiskNarrativeGeneration,
    ClaimExtraction,
    ValidationDecision,
    ExportGeneration,
    LlmSectionEnhancement,
}

impl TraceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceType::DataQualification => "DATA_QUALIFICATION",
            TraceType::DerivedSeriesGeneration => "DERIVED_SERIES_GENERATION",
            TraceType::RateCalculation => "RATE_CALCULATION",
            TraceType::UclCalculation => "UCL_CALCULATION",
            TraceType::WesternElectricEvaluation => "WESTERN_ELECTRIC_EVALUATION",
            TraceType::TrendDetermination => "TREND_DETERMINATION",
            TraceType::BenefitRiskNarrativeGeneration => "BENEFIT_RISK_NARRATIVE_GENERATION",
            TraceType::ClaimExtraction => "CLAIM_EXTRACTION",
            TraceType::ValidationDecision => "VALIDATION_DECISION",
            TraceType::ExportGeneration => "EXPORT_GENERATION",
            TraceType::LlmSectionEnhancement => "LLM_SECTION_ENHANCEMENT",
        }
    }
}

/// One cited primary source (an evidence atom).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCitation {
    pub source_id: String,
    pub source_hash: String,
    pub source_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputLineage {
    pub primary_sources: Vec<SourceCitation>,
}

/// One analytics kernel invocation cited by a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedInputCitation {
    pub formula: String,
    pub parameters: Value,
    pub code_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Obligations {
    pub primary: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegulatoryContext {
    pub obligations: Obligations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningStep {
    pub step_number: u32,
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningChain {
    pub steps: Vec<ReasoningStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordValidation {
    pub pass: bool,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashChain {
    pub content_hash: String,
    pub previous_hash: Option<String>,
    pub merkle_root: String,
}

/// A completed, chained decision trace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionTraceRecord {
    pub trace_id: Uuid,
    pub case_id: String,
    pub trace_type: TraceType,
    pub chain_position: u64,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub input_lineage: InputLineage,
    pub derived_inputs: Vec<DerivedInputCitation>,
    pub regulatory_context: RegulatoryContext,
    pub reasoning_chain: ReasoningChain,
    pub output_content: Value,
    pub validation_results: RecordValidation,
    pub hash_chain: HashChain,
}

/// The caller-supplied portion of a record. Position, duration, and the hash
/// chain are owned by the recorder.
#[derive(Debug, Clone)]
pub struct TraceDraft {
    /// Explicit trace id for deterministic replays; freshly minted when absent.
    pub trace_id: Option<Uuid>,
    pub trace_type: TraceType,
    pub case_id: String,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub input_lineage: InputLineage,
    pub derived_inputs: Vec<DerivedInputCitation>,
    pub obligations: Vec<String>,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub output_content: Value,
    pub validation: RecordValidation,
}

/// Outcome of a full-chain structural verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Content hash over every record field except the hash chain itself.
///
/// Trace records contain no non-finite numbers and no non-string keys, so
/// serialization and canonicalization cannot fail.
fn record_content_hash(record: &DecisionTraceRecord) -> String {
    let mut body = serde_json::to_value(record).expect("trace record serializes to JSON");
    if let Value::Object(ref mut fields) = body {
        fields.remove("hashChain");
    }
    let canonical = provenance::canonical_json(&body).expect("trace record body canonicalizes");
    provenance::sha256_hex(&canonical)
}

/// Append-only recorder for one run, bound to the run's correlation id.
#[derive(Debug)]
pub struct TraceRecorder {
    correlation_id: String,
    chain: Vec<DecisionTraceRecord>,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::with_correlation_id(Uuid::new_v4().to_string())
    }

    /// Recorder bound to an externally supplied correlation id, for
    /// deterministic replays.
    pub fn with_correlation_id(correlation_id: String) -> Self {
        Self {
            correlation_id,
            chain: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Append a record. Emission is total: position, previous pointer, content
    /// hash, and Merkle root are computed here and the record always lands.
    pub fn record(&mut self, draft: TraceDraft) -> &DecisionTraceRecord {
        let chain_position = self.chain.len() as u64;
        let previous_hash = self.chain.last().map(|prior| prior.hash_chain.content_hash.clone());
        let duration_ms = draft
            .completed_at
            .signed_duration_since(draft.initiated_at)
            .num_milliseconds();

        let mut record = DecisionTraceRecord {
            trace_id: draft.trace_id.unwrap_or_else(Uuid::new_v4),
            case_id: draft.case_id,
            trace_type: draft.trace_type,
            chain_position,
            initiated_at: draft.initiated_at,
            completed_at: draft.completed_at,
            duration_ms,
            input_lineage: draft.input_lineage,
            derived_inputs: draft.derived_inputs,
            regulatory_context: RegulatoryContext {
                obligations: Obligations {
                    primary: draft.obligations,
                },
            },
            reasoning_chain: ReasoningChain {
                steps: draft.reasoning_steps,
            },
            output_content: draft.output_content,
            validation_results: draft.validation,
            hash_chain: HashChain {
                content_hash: String::new(),
                previous_hash,
                merkle_root: String::new(),
            },
        };

        record.hash_chain.content_hash = record_content_hash(&record);

        // The root is folded from scratch on every append; it is never
        // carried forward incrementally.
        let mut content_hashes: Vec<String> = self
            .chain
            .iter()
            .map(|entry| entry.hash_chain.content_hash.clone())
            .collect();
        content_hashes.push(record.hash_chain.content_hash.clone());
        record.hash_chain.merkle_root = provenance::merkle_root(&content_hashes);

        self.chain.push(record);
        self.chain.last().expect("chain is non-empty after push")
    }

    /// Defensive copy of the chain; callers cannot mutate the authoritative list.
    pub fn chain(&self) -> Vec<DecisionTraceRecord> {
        self.chain.clone()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Re-check every structural invariant of the chain. Never short-circuits:
    /// all errors are reported for forensic use.
    pub fn validate_chain(&self) -> ChainVerification {
        validate_records(&self.chain)
    }
}

/// Structural verification over a slice of records (used by the recorder and
/// by external bundle verification after reading `audit.jsonl` back).
pub fn validate_records(chain: &[DecisionTraceRecord]) -> ChainVerification {
    let mut errors = Vec::new();
    let mut recomputed: Vec<String> = Vec::with_capacity(chain.len());

    for (index, record) in chain.iter().enumerate() {
        if record.chain_position != index as u64 {
            errors.push(format!(
                "DTR {index}: chain position {} does not match index {index}",
                record.chain_position
            ));
        }

        let expected_content = record_content_hash(record);
        if record.hash_chain.content_hash != expected_content {
            errors.push(format!("DTR {index}: content hash mismatch"));
        }

        if index == 0 {
            if record.hash_chain.previous_hash.is_some() {
                errors.push("DTR 0: previous hash must be null".to_string());
            }
        } else if record.hash_chain.previous_hash.as_deref() != Some(recomputed[index - 1].as_str()) {
            errors.push(format!(
                "DTR {index}: previous hash does not match prior DTR content hash"
            ));
        }

        recomputed.push(expected_content);
    }

    ChainVerification {
        valid: errors.is_empty(),
        errors,
    }
}
