//! Saving and loading buckets.
//!
//! Each bucket is one zstd compressed file, `{root}/buckets/{id}.bucket`:
//!
//! ```not_rust
//! 4 bytes  magic "DPOT"
//! u32      database version
//! u32      bucket id
//! u32      table generation (version 3 and later)
//! varint   path table size, path table bytes (from offset 1)
//! varint   cas table size, cas table bytes (from offset 1)
//! varint   command count
//! per command:
//!   20 bytes  command key
//!   CacheEntries
//! ```
//!
//! The saved generation is only used to move the server's generation counter
//! past it; a loaded bucket always starts on a fresh generation so a client
//! mirror from before the restart resynchronizes.

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, atomic::Ordering},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use humansize::{DECIMAL, format_size};
use protocol::{
    CACHE_DATABASE_VERSION, CacheEntries, CaseSensitivity, CompactCasKeyTable, CompactPathTable,
    binary::{BinaryReader, BinaryWriter},
    entry::OLDEST_READABLE_DATABASE_VERSION,
    storage::temp_path,
};
use tracing::{info, instrument, warn};

use crate::{
    CacheServer,
    bucket::{Bucket, Generations},
};

const MAGIC: &[u8; 4] = b"DPOT";
const COMPRESSION_LEVEL: i32 = 3;
const BUCKET_EXTENSION: &str = "bucket";

impl CacheServer {
    fn buckets_dir(&self) -> PathBuf {
        self.config.root_dir.join("buckets")
    }

    /// Load every persisted bucket, replacing in-memory state. Returns the
    /// number of buckets loaded.
    ///
    /// When a wipe was requested the database directory is deleted instead.
    #[instrument(name = "CacheServer::load", skip(self))]
    pub fn load(&self) -> Result<usize> {
        let dir = self.buckets_dir();
        if self.should_wipe.swap(false, Ordering::AcqRel) {
            info!(?dir, "wiping database");
            remove_dir(&dir)?;
            return Ok(0);
        }

        let files = match fs::read_dir(&dir) {
            Ok(files) => files,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err).with_context(|| format!("list {dir:?}")),
        };
        let mut loaded = HashMap::new();
        for file in files {
            let path = file.with_context(|| format!("list {dir:?}"))?.path();
            if path.extension().is_none_or(|ext| ext != BUCKET_EXTENSION) {
                continue;
            }
            let bucket = read_bucket(&path, self.config.case_sensitivity, &self.generations)
                .with_context(|| format!("load bucket {path:?}"))?;
            info!(
                bucket = bucket.id,
                generation = bucket.generation(),
                cas_table = %format_size(bucket.cas_table.size(), DECIMAL),
                "loaded bucket"
            );
            loaded.insert(bucket.id, Arc::new(bucket));
        }

        let count = loaded.len();
        *self.buckets.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(count)
    }

    /// Write every bucket changed since it was last saved. Returns the number
    /// of buckets written.
    #[instrument(name = "CacheServer::save", skip(self))]
    pub fn save(&self) -> Result<usize> {
        let dir = self.buckets_dir();
        let mut saved = 0;
        for bucket in self.all_buckets() {
            if !bucket.take_dirty() {
                continue;
            }
            if let Err(err) = write_bucket(&dir, &bucket) {
                bucket.mark_dirty();
                return Err(err).with_context(|| format!("save bucket {}", bucket.id));
            }
            saved += 1;
        }
        Ok(saved)
    }

    /// Drop every bucket from memory and disk. Returns the number of buckets
    /// dropped.
    #[instrument(name = "CacheServer::obliterate", skip(self))]
    pub fn obliterate(&self) -> Result<usize> {
        self.should_wipe.store(true, Ordering::Release);
        let removed = {
            let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
            let removed = buckets.len();
            buckets.clear();
            removed
        };
        self.load()?;
        warn!(removed, "obliterated all buckets");
        Ok(removed)
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {dir:?}")),
    }
}

fn write_bucket(dir: &Path, bucket: &Bucket) -> Result<()> {
    let content = {
        let _gate = bucket.enter_exclusive();
        serialize_bucket(bucket)
    };
    let compressed = zstd::bulk::compress(&content, COMPRESSION_LEVEL).context("compress bucket")?;

    fs::create_dir_all(dir).with_context(|| format!("create {dir:?}"))?;
    let path = dir.join(format!("{}.{BUCKET_EXTENSION}", bucket.id));
    let temp = temp_path(&path);
    fs::write(&temp, &compressed).with_context(|| format!("write {temp:?}"))?;
    if let Err(err) = fs::rename(&temp, &path) {
        if let Err(err) = fs::remove_file(&temp) {
            warn!("failed to remove temp file {temp:?}: {err}");
        }
        return Err(err).with_context(|| format!("rename {temp:?} to {path:?}"));
    }
    info!(
        bucket = bucket.id,
        size = %format_size(compressed.len(), DECIMAL),
        "saved bucket"
    );
    Ok(())
}

pub(crate) fn serialize_bucket(bucket: &Bucket) -> Vec<u8> {
    let mut writer = BinaryWriter::new();
    writer.write_bytes(MAGIC);
    writer.write_u32(CACHE_DATABASE_VERSION);
    writer.write_u32(bucket.id);
    writer.write_u32(bucket.generation());
    writer.write_blob(&bucket.path_table.memory_from(CompactPathTable::INITIAL_SIZE));
    writer.write_blob(&bucket.cas_table.memory_from(CompactCasKeyTable::INITIAL_SIZE));
    let containers = bucket.containers();
    writer.write_7bit(containers.len() as u64);
    for (cmd_key, container) in containers {
        writer.write_cas_key(&cmd_key);
        container.write(&mut writer);
    }
    writer.into_inner()
}

fn read_bucket(path: &Path, case: CaseSensitivity, generations: &Arc<Generations>) -> Result<Bucket> {
    let compressed = fs::read(path).context("read file")?;
    let content = zstd::stream::decode_all(compressed.as_slice()).context("decompress")?;
    deserialize_bucket(&content, case, generations)
}

pub(crate) fn deserialize_bucket(
    content: &[u8],
    case: CaseSensitivity,
    generations: &Arc<Generations>,
) -> Result<Bucket> {
    let mut reader = BinaryReader::new(content);
    if reader.read_bytes(MAGIC.len()).context("read magic")? != MAGIC {
        bail!("not a bucket file");
    }
    let version = reader.read_u32().context("read database version")?;
    if !(OLDEST_READABLE_DATABASE_VERSION..=CACHE_DATABASE_VERSION).contains(&version) {
        bail!("unsupported database version {version} (current is {CACHE_DATABASE_VERSION})");
    }
    let id = reader.read_u32().context("read bucket id")?;
    if version >= CACHE_DATABASE_VERSION {
        generations.observe(reader.read_u32().context("read generation")?);
    }

    let path_table = CompactPathTable::new(case);
    path_table
        .read_mem(reader.read_blob().context("read path table")?, true)
        .context("load path table")?;
    let cas_table = CompactCasKeyTable::new();
    cas_table
        .read_mem(reader.read_blob().context("read cas table")?, true)
        .context("load cas table")?;

    let count = reader.read_7bit().context("read command count")?;
    let mut entries = HashMap::new();
    for _ in 0..count {
        let cmd_key = reader.read_cas_key().context("read command key")?;
        let container = CacheEntries::read(&mut reader, version)
            .with_context(|| format!("read entries for {cmd_key}"))?;
        entries.insert(cmd_key, Arc::new(container));
    }
    if !reader.is_at_end() {
        bail!("{} trailing bytes in bucket", reader.remaining());
    }
    Ok(Bucket::from_parts(id, path_table, cas_table, entries, generations.clone()))
}
