//! # Persistence
//!
//! Durable key/value facade for the last-known control-plane documents.
//! Three well-known slots, each holding one opaque byte blob. Retrieval at
//! startup is best-effort: a missing or unreadable slot is not an error the
//! caller has to stop for.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use contracts::AgentError;
use tracing::{debug, warn};

/// Well-known document slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentSlot {
    DecoderManifest,
    CollectionSchemeList,
    StateTemplateList,
}

impl DocumentSlot {
    pub const ALL: [DocumentSlot; 3] = [
        DocumentSlot::DecoderManifest,
        DocumentSlot::CollectionSchemeList,
        DocumentSlot::StateTemplateList,
    ];

    fn file_name(self) -> &'static str {
        match self {
            DocumentSlot::DecoderManifest => "decoder_manifest.bin",
            DocumentSlot::CollectionSchemeList => "collection_scheme_list.bin",
            DocumentSlot::StateTemplateList => "state_template_list.bin",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DocumentSlot::DecoderManifest => "decoder_manifest",
            DocumentSlot::CollectionSchemeList => "collection_scheme_list",
            DocumentSlot::StateTemplateList => "state_template_list",
        }
    }
}

/// Document store abstraction used by the scheme manager.
pub trait DocumentStore: Send + Sync {
    /// Persist a blob, replacing any previous content of the slot.
    fn save(&self, slot: DocumentSlot, payload: &[u8]) -> Result<(), AgentError>;

    /// Load a blob, `Ok(None)` when the slot was never written.
    fn load(&self, slot: DocumentSlot) -> Result<Option<Vec<u8>>, AgentError>;

    /// Drop a slot's content.
    fn erase(&self, slot: DocumentSlot) -> Result<(), AgentError>;
}

/// File-backed store: one file per slot under a base directory. Writes go
/// through a temp file plus rename so a crash never leaves a torn blob.
pub struct FileDocumentStore {
    base_dir: PathBuf,
}

impl FileDocumentStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn slot_path(&self, slot: DocumentSlot) -> PathBuf {
        self.base_dir.join(slot.file_name())
    }
}

impl DocumentStore for FileDocumentStore {
    fn save(&self, slot: DocumentSlot, payload: &[u8]) -> Result<(), AgentError> {
        let path = self.slot_path(slot);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .and_then(|()| fs::rename(&tmp_path, &path))
            .map_err(|e| AgentError::store(slot.name(), e.to_string()))?;
        debug!(slot = slot.name(), bytes = payload.len(), "document persisted");
        Ok(())
    }

    fn load(&self, slot: DocumentSlot) -> Result<Option<Vec<u8>>, AgentError> {
        let path = self.slot_path(slot);
        match fs::read(&path) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!(slot = slot.name(), error = %e, "failed to read persisted document");
                Err(AgentError::store(slot.name(), e.to_string()))
            }
        }
    }

    fn erase(&self, slot: DocumentSlot) -> Result<(), AgentError> {
        let path = self.slot_path(slot);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::store(slot.name(), e.to_string())),
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    slots: Mutex<HashMap<DocumentSlot, Vec<u8>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn save(&self, slot: DocumentSlot, payload: &[u8]) -> Result<(), AgentError> {
        self.slots.lock().insert(slot, payload.to_vec());
        Ok(())
    }

    fn load(&self, slot: DocumentSlot) -> Result<Option<Vec<u8>>, AgentError> {
        Ok(self.slots.lock().get(&slot).cloned())
    }

    fn erase(&self, slot: DocumentSlot) -> Result<(), AgentError> {
        self.slots.lock().remove(&slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path()).unwrap();

        assert_eq!(store.load(DocumentSlot::DecoderManifest).unwrap(), None);
        store
            .save(DocumentSlot::DecoderManifest, b"manifest-bytes")
            .unwrap();
        assert_eq!(
            store.load(DocumentSlot::DecoderManifest).unwrap().as_deref(),
            Some(b"manifest-bytes".as_ref())
        );

        store.save(DocumentSlot::DecoderManifest, b"newer").unwrap();
        assert_eq!(
            store.load(DocumentSlot::DecoderManifest).unwrap().as_deref(),
            Some(b"newer".as_ref())
        );
    }

    #[test]
    fn test_file_store_erase_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDocumentStore::new(dir.path()).unwrap();
        store.save(DocumentSlot::CollectionSchemeList, b"x").unwrap();
        store.erase(DocumentSlot::CollectionSchemeList).unwrap();
        store.erase(DocumentSlot::CollectionSchemeList).unwrap();
        assert_eq!(store.load(DocumentSlot::CollectionSchemeList).unwrap(), None);
    }

    #[test]
    fn test_slots_are_independent() {
        let store = MemoryDocumentStore::new();
        store.save(DocumentSlot::DecoderManifest, b"dm").unwrap();
        store.save(DocumentSlot::CollectionSchemeList, b"cs").unwrap();
        assert_eq!(
            store.load(DocumentSlot::DecoderManifest).unwrap().as_deref(),
            Some(b"dm".as_ref())
        );
        assert_eq!(
            store
                .load(DocumentSlot::CollectionSchemeList)
                .unwrap()
                .as_deref(),
            Some(b"cs".as_ref())
        );
        assert_eq!(store.load(DocumentSlot::StateTemplateList).unwrap(), None);
    }
}
