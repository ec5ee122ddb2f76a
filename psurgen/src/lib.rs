pub mod analytics;
pub mod annex;
pub mod context;
pub mod datasets;
pub mod ingest;
pub mod ledger;
pub mod model_adapters;
pub mod orchestrator;
pub mod portability;
pub mod provenance;
pub mod reconcile;
pub mod render;
pub mod sections;
pub mod store;
pub mod validator;

#[cfg(test)]
mod tests;

/// Errors surfaced by the core pipeline.
///
/// Validation findings are data, not errors; they travel through the
/// validation result set and never abort a task by themselves.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store read hit an unpopulated slot.
    #[error("no value stored for slot ({kind}, {id})")]
    SlotMissing {
        kind: store::StoreKind,
        id: String,
    },

    /// The decision trace chain failed structural verification.
    #[error("decision trace chain is corrupt: {}", .0.join("; "))]
    ChainCorrupt(Vec<String>),

    /// A task referenced a dependency outside the task table.
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    /// A failure surfaced from an external collaborator (loader, enhancer,
    /// renderer) or from serialization at a collaborator seam.
    #[error(transparent)]
    External(#[from] anyhow::Error),
}
