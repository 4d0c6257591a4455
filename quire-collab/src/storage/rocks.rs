//! RocksDB-backed record and audit store.
//!
//! Column families:
//! - `records` — one collaboration record per document (bincode, LZ4 compressed),
//!   keyed by the 16 document-id bytes
//! - `audit`   — audit events (bincode, LZ4 compressed), keyed by
//!   `<doc_id:16 bytes><sequence:8 bytes big-endian>` so a prefix scan
//!   yields one document's ledger in append order
//!
//! Conditional writes are serialized by a process-local lock around the
//! read-compare-write, so one `RocksBackend` must own the database directory.
//! A record write and its audit events go out in one `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{AuditBackend, CasOutcome, LedgerBackend, RecordBackend, RecordWrite};
use crate::audit::AuditEvent;
use crate::error::StoreError;
use crate::model::CollaborationRecord;

const CF_RECORDS: &str = "records";
const CF_AUDIT: &str = "audit";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_AUDIT];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: true — audit entries must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, no fsync).
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

pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-compare-write for CAS and insert
    write_lock: Mutex<()>,
}

impl RocksBackend {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened record store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        // Records are point lookups served by the bloom filter and cache above.
        if name == CF_AUDIT {
            // Prefix-scanned by document id, values already LZ4'd
            opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            opts.set_compression_type(DBCompressionType::None);
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }

    /// Audit key: doc_id (16 bytes) + sequence (8 bytes big-endian).
    fn audit_key(document_id: Uuid, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(document_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn read_record(&self, document_id: Uuid) -> Result<Option<CollaborationRecord>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        self.db
            .get_cf(cf, document_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl RecordBackend for RocksBackend {
    fn insert(&self, record: &CollaborationRecord) -> Result<(), StoreError> {
        self.commit(RecordWrite::Insert(record), &[]).map(|_| ())
    }

    fn get(&self, document_id: Uuid) -> Result<Option<CollaborationRecord>, StoreError> {
        self.read_record(document_id)
    }

    fn filter(
        &self,
        predicate: &dyn Fn(&CollaborationRecord) -> bool,
    ) -> Result<Vec<CollaborationRecord>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record: CollaborationRecord = decode(&value)?;
            if predicate(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn compare_and_swap(
        &self,
        record: &CollaborationRecord,
        expected_version: u64,
    ) -> Result<CasOutcome, StoreError> {
        self.commit(
            RecordWrite::Swap {
                record,
                expected_version,
            },
            &[],
        )
    }

    fn delete(&self, document_id: Uuid) -> Result<bool, StoreError> {
        Ok(matches!(
            self.commit(RecordWrite::Delete(document_id), &[])?,
            CasOutcome::Committed(_)
        ))
    }

    fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }
}

impl LedgerBackend for RocksBackend {
    fn commit(&self, write: RecordWrite<'_>, events: &[AuditEvent]) -> Result<CasOutcome, StoreError> {
        let _guard = self.lock()?;
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_audit = self.cf(CF_AUDIT)?;
        let stored = self.read_record(write.document_id())?;

        let mut batch = WriteBatch::default();
        let outcome = match (write, stored) {
            (RecordWrite::Insert(record), Some(_)) => {
                return Err(StoreError::AlreadyExists(record.document_id))
            }
            (RecordWrite::Insert(record), None) => {
                batch.put_cf(cf_records, record.document_id.as_bytes(), encode(record)?);
                CasOutcome::Committed(record.clone())
            }
            (RecordWrite::Swap { .. }, None) | (RecordWrite::Delete(_), None) => {
                return Ok(CasOutcome::Missing)
            }
            (RecordWrite::Swap { expected_version, .. }, Some(stored))
                if stored.version != expected_version =>
            {
                return Ok(CasOutcome::Conflict(stored))
            }
            (RecordWrite::Swap { record, .. }, Some(_)) => {
                batch.put_cf(cf_records, record.document_id.as_bytes(), encode(record)?);
                CasOutcome::Committed(record.clone())
            }
            (RecordWrite::Delete(document_id), Some(removed)) => {
                batch.delete_cf(cf_records, document_id.as_bytes());
                CasOutcome::Committed(removed)
            }
        };

        for event in events {
            let key = Self::audit_key(event.document_id, event.sequence);
            batch.put_cf(cf_audit, key, encode(event)?);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(outcome)
    }
}

impl AuditBackend for RocksBackend {
    fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let cf = self.cf(CF_AUDIT)?;
        let key = Self::audit_key(event.document_id, event.sequence);
        self.db.put_cf_opt(cf, key, encode(event)?, &self.write_opts())?;
        Ok(())
    }

    fn scan(&self, document_id: Uuid) -> Result<Vec<AuditEvent>, StoreError> {
        let cf = self.cf(CF_AUDIT)?;
        let start = Self::audit_key(document_id, 0);
        let mut events = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            // Stop once past this document's key prefix
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            events.push(decode(&value)?);
        }
        Ok(events)
    }

    fn last_sequence(&self, document_id: Uuid) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_AUDIT)?;
        let end = Self::audit_key(document_id, u64::MAX);
        let mut iter = self.db.iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                    return Ok(None);
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[16..24]);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            None => Ok(None),
        }
    }
}
