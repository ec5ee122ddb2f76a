//! store.rs: the content-addressed run store.
//!
//! One store exists per run. Every value written receives a reference record
//! carrying the SHA-256 of its canonical JSON (raw bytes for buffers), which
//! downstream decision trace records cite as input lineage.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{provenance, Error};

/// The fixed slot taxonomy. `(kind, id)` uniquely addresses a slot for the
/// duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Manifest,
    FileHashes,
    EvidenceAtoms,
    NormalizedData,
    QualifiedData,
    Reconciliation,
    DerivedInputs,
    Analytics,
    Context,
    AnnexTables,
    Sections,
    LlmCalls,
    ValidationResults,
    DocxBuffer,
    ChartBuffer,
    AuditExports,
    ZipBundle,
    ChainVerification,
    PsurOutput,
    TemplateUsed,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Manifest => "manifest",
            StoreKind::FileHashes => "file_hashes",
            StoreKind::EvidenceAtoms => "evidence_atoms",
            StoreKind::NormalizedData => "normalized_data",
            StoreKind::QualifiedData => "qualified_data",
            StoreKind::Reconciliation => "reconciliation",
            StoreKind::DerivedInputs => "derived_inputs",
            StoreKind::Analytics => "analytics",
            StoreKind::Context => "context",
            StoreKind::AnnexTables => "annex_tables",
            StoreKind::Sections => "sections",
            StoreKind::LlmCalls => "llm_calls",
            StoreKind::ValidationResults => "validation_results",
            StoreKind::DocxBuffer => "docx_buffer",
            StoreKind::ChartBuffer => "chart_buffer",
            StoreKind::AuditExports => "audit_exports",
            StoreKind::ZipBundle => "zip_bundle",
            StoreKind::ChainVerification => "chain_verification",
            StoreKind::PsurOutput => "psur_output",
            StoreKind::TemplateUsed => "template_used",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value: structured JSON or an opaque byte buffer (docx, chart,
/// zip). Buffers are hashed over their raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl StoreValue {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            StoreValue::Json(value) => Some(value),
            StoreValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StoreValue::Bytes(bytes) => Some(bytes),
            StoreValue::Json(_) => None,
        }
    }
}

/// Reference record emitted by every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRef {
    pub kind: StoreKind,
    pub id: String,
    pub content_hash: String,
}

/// Typed kind/id → value map, single-threaded within a run.
#[derive(Debug, Default)]
pub struct RunStore {
    slots: BTreeMap<(StoreKind, String), (StoreValue, String)>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a serializable value, overwriting any prior slot occupant.
    pub fn put<T: Serialize>(&mut self, kind: StoreKind, id: &str, value: &T) -> Result<StoreRef, Error> {
        let json = serde_json::to_value(value)
            .map_err(|err| Error::External(anyhow::anyhow!("failed to serialize store value: {err}")))?;
        let content_hash = provenance::content_hash(&json)?;
        self.slots
            .insert((kind, id.to_string()), (StoreValue::Json(json), content_hash.clone()));
        Ok(StoreRef {
            kind,
            id: id.to_string(),
            content_hash,
        })
    }

    /// Store a raw byte buffer; the reference hash covers the bytes.
    pub fn put_bytes(&mut self, kind: StoreKind, id: &str, bytes: Vec<u8>) -> StoreRef {
        let content_hash = provenance::sha256_hex(&bytes);
        self.slots
            .insert((kind, id.to_string()), (StoreValue::Bytes(bytes), content_hash.clone()));
        StoreRef {
            kind,
            id: id.to_string(),
            content_hash,
        }
    }

    pub fn get(&self, kind: StoreKind, id: &str) -> Result<&StoreValue, Error> {
        self.slots
            .get(&(kind, id.to_string()))
            .map(|(value, _)| value)
            .ok_or_else(|| Error::SlotMissing {
                kind,
                id: id.to_string(),
            })
    }

    /// Deserialize a stored JSON value into a concrete type.
    pub fn get_as<T: DeserializeOwned>(&self, kind: StoreKind, id: &str) -> Result<T, Error> {
        let value = self.get(kind, id)?;
        let json = value.as_json().ok_or_else(|| {
            Error::External(anyhow::anyhow!(
                "slot ({kind}, {id}) holds a byte buffer, not JSON"
            ))
        })?;
        serde_json::from_value(json.clone()).map_err(|err| {
            Error::External(anyhow::anyhow!(
                "failed to deserialize slot ({kind}, {id}): {err}"
            ))
        })
    }

    pub fn get_bytes(&self, kind: StoreKind, id: &str) -> Result<&[u8], Error> {
        let value = self.get(kind, id)?;
        value.as_bytes().ok_or_else(|| {
            Error::External(anyhow::anyhow!(
                "slot ({kind}, {id}) holds JSON, not a byte buffer"
            ))
        })
    }

    pub fn get_by_ref(&self, reference: &StoreRef) -> Result<&StoreValue, Error> {
        self.get(reference.kind, &reference.id)
    }

    /// Reference record for an already-populated slot.
    pub fn ref_of(&self, kind: StoreKind, id: &str) -> Result<StoreRef, Error> {
        self.slots
            .get(&(kind, id.to_string()))
            .map(|(_, content_hash)| StoreRef {
                kind,
                id: id.to_string(),
                content_hash: content_hash.clone(),
            })
            .ok_or_else(|| Error::SlotMissing {
                kind,
                id: id.to_string(),
            })
    }

    pub fn has(&self, kind: StoreKind, id: &str) -> bool {
        self.slots.contains_key(&(kind, id.to_string()))
    }

    /// All populated slots of one kind, keyed by id.
    pub fn get_all_by_kind(&self, kind: StoreKind) -> BTreeMap<String, &StoreValue> {
        self.slots
            .iter()
            .filter(|((slot_kind, _), _)| *slot_kind == kind)
            .map(|((_, id), (value, _))| (id.clone(), value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_emits_reference_with_content_hash() {
        let mut store = RunStore::new();
        let reference = store
            .put(StoreKind::Analytics, "trend", &json!({"mean": 1.0}))
            .unwrap();
        assert_eq!(reference.kind, StoreKind::Analytics);
        assert_eq!(reference.id, "trend");
        assert_eq!(
            reference.content_hash,
            crate::provenance::content_hash(&json!({"mean": 1.0})).unwrap()
        );
        assert_eq!(store.get_by_ref(&reference).unwrap().as_json(), Some(&json!({"mean": 1.0})));
    }

    #[test]
    fn get_on_missing_slot_names_both_components() {
        let store = RunStore::new();
        let err = store.get(StoreKind::Sections, "S01").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sections"), "{message}");
        assert!(message.contains("S01"), "{message}");
    }

    #[test]
    fn put_overwrites_existing_slot() {
        let mut store = RunStore::new();
        store.put(StoreKind::Context, "case", &json!({"v": 1})).unwrap();
        let reference = store.put(StoreKind::Context, "case", &json!({"v": 2})).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            reference.content_hash,
            crate::provenance::content_hash(&json!({"v": 2})).unwrap()
        );
    }

    #[test]
    fn byte_buffers_hash_raw_bytes() {
        let mut store = RunStore::new();
        let reference = store.put_bytes(StoreKind::DocxBuffer, "psur", vec![1, 2, 3]);
        assert_eq!(reference.content_hash, crate::provenance::sha256_hex(&[1, 2, 3]));
        assert_eq!(store.get_bytes(StoreKind::DocxBuffer, "psur").unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn get_all_by_kind_filters_and_keys_by_id() {
        let mut store = RunStore::new();
        store.put(StoreKind::Sections, "S01", &json!("a")).unwrap();
        store.put(StoreKind::Sections, "S02", &json!("b")).unwrap();
        store.put(StoreKind::AnnexTables, "A01", &json!("c")).unwrap();
        let sections = store.get_all_by_kind(StoreKind::Sections);
        assert_eq!(sections.len(), 2);
        assert!(sections.contains_key("S01") && sections.contains_key("S02"));
    }
}
