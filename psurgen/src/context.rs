//! context.rs: the per-run computation context.
//!
//! Assembled once the metrics exist and then grown by the later pipeline
//! stages; it never outlives the run and is never shared across runs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analytics::kernels::{
    CapaAnalytics, ComplaintAnalytics, ExposureAnalytics, FscaAnalytics, IncidentAnalytics,
    LiteratureAnalytics, PmcfAnalytics, RiskAnalytics,
};
use crate::analytics::trend::TrendResult;
use crate::analytics::DerivedInputRef;
use crate::annex::AnnexTableResult;
use crate::datasets::{DeviceMaster, NormalizedPack, SurveillancePeriod};
use crate::ingest::EvidenceAtomRef;
use crate::reconcile::ReconciliationResult;
use crate::sections::SectionResult;
use crate::validator::ValidationResult;

/// All kernel outputs for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResults {
    pub exposure: ExposureAnalytics,
    pub complaints: ComplaintAnalytics,
    pub incidents: IncidentAnalytics,
    pub capa: CapaAnalytics,
    pub fsca: FscaAnalytics,
    pub literature: LiteratureAnalytics,
    pub pmcf: PmcfAnalytics,
    pub risk: RiskAnalytics,
    pub trend: TrendResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationContext {
    pub case_id: String,
    pub correlation_id: String,
    pub device: DeviceMaster,
    pub period: SurveillancePeriod,
    /// The qualified datasets the analytics ran over (includes the
    /// distribution records).
    pub datasets: NormalizedPack,
    pub analytics: AnalyticsResults,
    pub evidence_atoms: Vec<EvidenceAtomRef>,
    pub derived_inputs: Vec<DerivedInputRef>,
    pub reconciliation: ReconciliationResult,
    pub sections: Vec<SectionResult>,
    pub annex_tables: Vec<AnnexTableResult>,
    pub validation_results: Vec<ValidationResult>,
}

/// Evidence atoms and derived inputs backing one section or annex table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub evidence_atom_ids: Vec<Uuid>,
    pub derived_input_ids: Vec<Uuid>,
}

impl ComputationContext {
    /// Evidence atoms whose type tag is in `types`, in ingest order.
    pub fn atoms_of_types(&self, types: &[&str]) -> Vec<&EvidenceAtomRef> {
        self.evidence_atoms
            .iter()
            .filter(|atom| types.contains(&atom.atom_type.as_str()))
            .collect()
    }

    /// Derived inputs whose analytic tag is in `types`, in emission order.
    pub fn derived_of_types(&self, types: &[crate::analytics::AnalyticType]) -> Vec<&DerivedInputRef> {
        self.derived_inputs
            .iter()
            .filter(|derived| types.contains(&derived.input_type))
            .collect()
    }

    /// Provenance for a declared pair of type-tag sets.
    pub fn provenance(
        &self,
        atom_types: &[&str],
        derived_types: &[crate::analytics::AnalyticType],
    ) -> Provenance {
        Provenance {
            evidence_atom_ids: self.atoms_of_types(atom_types).iter().map(|a| a.id).collect(),
            derived_input_ids: self
                .derived_of_types(derived_types)
                .iter()
                .map(|d| d.id)
                .collect(),
        }
    }
}
