//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: encoded [`super::Snapshot`] per document (already LZ4 framed)
//! - `metadata` : [`SnapshotMetadata`] per document (bincode)
//!
//! Both are written in one `WriteBatch`, so metadata never describes a
//! snapshot that is not there.
//!
//! Performance targets:
//! - Open (10k docs): <100ms (bloom filters + block cache)
//! - Snapshot load (1MB, cache hit): <1ms

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::snapshot::unix_now;
use super::{SnapshotStore, StorageError};
use crate::core::delta::{decode_exact, encode};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub doc_id: Uuid,
    /// Number of saves since the document was first stored.
    pub saves: u64,
    pub snapshot_size: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            saves: 0,
            snapshot_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// RocksDB-backed [`SnapshotStore`].
pub struct RocksStore {
    /// Single-threaded mode: the owning session serialises access.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (creating if missing) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
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

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are LZ4 framed already.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("column family '{name}' not found")))
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<Option<SnapshotMetadata>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_exact(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every document with a stored snapshot.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            match Uuid::from_slice(&key) {
                Ok(id) => doc_ids.push(id),
                Err(_) => log::warn!("skipping metadata entry with a {}-byte key", key.len()),
            }
        }
        Ok(doc_ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl SnapshotStore for RocksStore {
    fn load(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        Ok(self.db.get_cf(cf, doc_id.as_bytes())?)
    }

    fn save(&self, doc_id: Uuid, bytes: &[u8]) -> Result<(), StorageError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| SnapshotMetadata::new(doc_id));
        meta.saves += 1;
        meta.snapshot_size = bytes.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, doc_id.as_bytes(), bytes);
        batch.put_cf(cf_meta, doc_id.as_bytes(), encode(&meta));

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        log::debug!("saved snapshot for {doc_id} ({} bytes, save #{})", bytes.len(), meta.saves);
        Ok(())
    }

    fn delete(&self, doc_id: Uuid) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, doc_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, doc_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
