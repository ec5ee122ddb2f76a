//! model_adapters.rs: the section-enhancement seam.
//!
//! Prompting and transport live in the external collaborator; the core only
//! defines the interface and the call evidence it must bring back. The
//! validator later holds every enhancement to this evidence: token counts,
//! provider request ids, and a transport proof, with mock-looking providers
//! rejected outright.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::sections::SectionResult;

/// Wire-level proof that a provider call actually crossed the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportProof {
    pub sdk: String,
    pub endpoint_host: String,
    pub http_status: u16,
    pub provider_request_id: String,
    pub response_headers_hash: String,
}

/// Usage and identity evidence for one enhancement call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvidence {
    pub provider: String,
    pub model: String,
    pub correlation_id: String,
    pub provider_request_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub transport_proof: TransportProof,
}

/// An enhanced narrative plus the evidence of how it was produced.
#[derive(Debug, Clone)]
pub struct EnhancedSection {
    pub narrative: String,
    pub evidence: CallEvidence,
}

/// External collaborator: rewrites a section narrative without changing its
/// factual claims. The pipeline records one LLM trace record per call.
pub trait SectionEnhancer {
    fn enhance(&self, section: &SectionResult, correlation_id: &str) -> Result<EnhancedSection>;
}
