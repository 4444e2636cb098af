//! RocksDB-backed implementation of the store contracts.
//!
//! Column families:
//! - `snapshots`  — full CRDT document snapshots (LZ4 compressed)
//! - `records`    — principle metadata rows (bincode), keyed by id
//! - `slug_index` — slug → id, maintained for non-deleted rows only
//!
//! The slug index is what enforces "no two non-deleted records share a
//! slug" at lookup time; soft-deleting a record removes its index entry so
//! the slug becomes allocatable again.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::PathBuf;

use crate::gatekeeper::AuthContext;
use crate::slug;
use crate::store::{
    now_millis, MetadataStore, PatchOutcome, PrincipleRecord, SnapshotStore, StoreError, UNTITLED,
};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_RECORDS: &str = "records";
const CF_SLUG_INDEX: &str = "slug_index";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_RECORDS, CF_SLUG_INDEX];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("principles_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
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

/// Embedded durable store for snapshots and metadata rows.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Large values, overwritten whole on every flush
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_RECORDS | CF_SLUG_INDEX => {
                // Small values, frequent point reads
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family: {name}")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn get_record_sync(&self, id: &str) -> Result<Option<PrincipleRecord>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(PrincipleRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_record(&self, record: &PrincipleRecord) -> Result<(), StoreError> {
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_slugs = self.cf(CF_SLUG_INDEX)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_records, record.id.as_bytes(), record.encode()?);
        if record.is_deleted() {
            batch.delete_cf(&cf_slugs, record.slug.as_bytes());
        } else {
            batch.put_cf(&cf_slugs, record.slug.as_bytes(), record.id.as_bytes());
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for RocksStore {
    async fn load_snapshot(
        &self,
        _ctx: &AuthContext,
        id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }

    async fn save_snapshot(
        &self,
        _ctx: &AuthContext,
        id: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = lz4_flex::compress_prepend_size(bytes);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, id.as_bytes(), &compressed);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for RocksStore {
    async fn create_record(
        &self,
        ctx: &AuthContext,
        name: &str,
    ) -> Result<PrincipleRecord, StoreError> {
        let trimmed = name.trim();
        let stored_name = if trimmed.is_empty() { UNTITLED } else { trimmed };
        let allocated = slug::allocate_slug(self, ctx, trimmed).await?;
        let now = now_millis();
        let record = PrincipleRecord {
            id: slug::new_record_id(),
            slug: allocated,
            name: stored_name.to_string(),
            created_by: ctx.email.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        };
        self.put_record(&record)?;
        Ok(record)
    }

    async fn get_record(
        &self,
        _ctx: &AuthContext,
        id: &str,
    ) -> Result<Option<PrincipleRecord>, StoreError> {
        self.get_record_sync(id)
    }

    async fn find_by_slug(
        &self,
        _ctx: &AuthContext,
        slug: &str,
    ) -> Result<Option<PrincipleRecord>, StoreError> {
        let cf = self.cf(CF_SLUG_INDEX)?;
        let id = match self.db.get_cf(&cf, slug.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            None => return Ok(None),
        };
        match self.get_record_sync(&id)? {
            Some(rec) if !rec.is_deleted() => Ok(Some(rec)),
            _ => Ok(None),
        }
    }

    async fn slug_in_use(&self, ctx: &AuthContext, slug: &str) -> Result<bool, StoreError> {
        Ok(self.find_by_slug(ctx, slug).await?.is_some())
    }

    async fn patch_name(
        &self,
        _ctx: &AuthContext,
        id: &str,
        name: &str,
    ) -> Result<PatchOutcome, StoreError> {
        let mut record = match self.get_record_sync(id)? {
            Some(rec) if !rec.is_deleted() => rec,
            _ => return Ok(PatchOutcome::NotFoundOrDeleted),
        };
        record.name = name.to_string();
        record.updated_at = now_millis();
        record.version += 1;
        self.put_record(&record)?;
        Ok(PatchOutcome::Applied)
    }

    async fn soft_delete(&self, ctx: &AuthContext, slug: &str) -> Result<bool, StoreError> {
        let mut record = match self.find_by_slug(ctx, slug).await? {
            Some(rec) => rec,
            None => return Ok(false),
        };
        record.deleted_at = Some(now_millis());
        record.version += 1;
        self.put_record(&record)?;
        Ok(true)
    }

    async fn list_records(&self, _ctx: &AuthContext) -> Result<Vec<PrincipleRecord>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut active = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let record = PrincipleRecord::decode(&value)?;
            if !record.is_deleted() {
                active.push(record);
            }
        }
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(active)
    }
}
