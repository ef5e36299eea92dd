//! Persistence seam for document snapshots.
//!
//! ```text
//! ┌─────────────┐   load on open    ┌────────────────┐
//! │ RoomManager │ ◄──────────────── │ DocumentStore  │
//! │             │ ────────────────► │ Memory | Rocks │
//! └─────────────┘  save on evict,   └────────────────┘
//!                  autosave, flush
//! ```
//!
//! Only whole snapshots are stored. Short-term history lives in memory in
//! the session; nothing here keeps older versions.

pub mod rocks;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::session::DocumentSnapshot;

pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Latest saved snapshot, or `None` for a new document.
    async fn load(&self, document_id: &str) -> Result<Option<DocumentSnapshot>, StoreError>;

    /// Persist a snapshot. A snapshot older than the stored one is ignored.
    async fn save(&self, document_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError>;
}

/// In-memory store that counts its traffic.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, DocumentSnapshot>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store.
    pub fn with_documents<I, K>(documents: I) -> Self
    where
        I: IntoIterator<Item = (K, DocumentSnapshot)>,
        K: Into<String>,
    {
        Self {
            documents: RwLock::new(documents.into_iter().map(|(k, v)| (k.into(), v)).collect()),
            ..Self::default()
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Stored snapshot, without counting a load.
    pub async fn peek(&self, document_id: &str) -> Option<DocumentSnapshot> {
        self.documents.read().await.get(document_id).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, document_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.documents.read().await.get(document_id).cloned())
    }

    async fn save(&self, document_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        let mut documents = self.documents.write().await;
        match documents.get(document_id) {
            Some(existing) if existing.sequence > snapshot.sequence => {
                log::debug!(
                    "Ignoring save of '{document_id}' at {} (stored {})",
                    snapshot.sequence,
                    existing.sequence
                );
            }
            _ => {
                documents.insert(document_id.to_string(), snapshot.clone());
            }
        }
        Ok(())
    }
}
