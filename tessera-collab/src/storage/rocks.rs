//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: bincode `DocumentSnapshot`, LZ4 compressed, keyed by document id
//! - `metadata`: bincode `DocumentMetadata` (sequence, sizes, timestamps)
//!
//! Snapshot and metadata are written in one batch. RocksDB calls are
//! blocking, so the async trait methods run them on `spawn_blocking`.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::{DocumentStore, StoreError};
use crate::session::DocumentSnapshot;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::default()
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    pub sequence: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

type Db = DBWithThreadMode<SingleThreaded>;

pub struct RocksStore {
    db: Arc<Db>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are already LZ4 framed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
        db.cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn read_metadata(db: &Db, document_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = Self::cf(db, CF_METADATA)?;
        db.get_cf(cf, document_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn read_snapshot(db: &Db, document_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        let cf = Self::cf(db, CF_DOCUMENTS)?;
        let Some(compressed) = db.get_cf(cf, document_id.as_bytes())? else {
            return Ok(None);
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        decode(&raw).map(Some)
    }

    fn write_snapshot(
        db: &Db,
        sync: bool,
        document_id: &str,
        snapshot: &DocumentSnapshot,
    ) -> Result<Option<DocumentMetadata>, StoreError> {
        let existing = Self::read_metadata(db, document_id)?;
        if let Some(meta) = &existing {
            if meta.sequence > snapshot.sequence {
                return Ok(None);
            }
        }

        let raw = encode(snapshot)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);
        let now = now_secs();
        let meta = DocumentMetadata {
            document_id: document_id.to_string(),
            sequence: snapshot.sequence,
            snapshot_size: raw.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at: existing.map_or(now, |m| m.created_at),
            updated_at: now,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(Self::cf(db, CF_DOCUMENTS)?, document_id.as_bytes(), &compressed);
        batch.put_cf(Self::cf(db, CF_METADATA)?, document_id.as_bytes(), encode(&meta)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(sync);
        db.write_opt(batch, &write_opts)?;
        Ok(Some(meta))
    }

    /// Metadata for a stored document.
    pub fn metadata(&self, document_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        Self::read_metadata(&self.db, document_id)
    }

    /// Ids of every stored document.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = Self::cf(&self.db, CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn load(&self, document_id: &str) -> Result<Option<DocumentSnapshot>, StoreError> {
        let db = self.db.clone();
        let id = document_id.to_string();
        tokio::task::spawn_blocking(move || Self::read_snapshot(&db, &id))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn save(&self, document_id: &str, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let db = self.db.clone();
        let sync = self.config.sync_writes;
        let id = document_id.to_string();
        let sequence = snapshot.sequence;
        let snapshot = snapshot.clone();
        let written = tokio::task::spawn_blocking(move || Self::write_snapshot(&db, sync, &id, &snapshot))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        match written {
            Some(meta) => log::debug!(
                "Saved '{document_id}' at {} ({} -> {} bytes)",
                meta.sequence,
                meta.snapshot_size,
                meta.compressed_size
            ),
            None => log::debug!("Skipped stale save of '{document_id}' at {sequence}"),
        }
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
