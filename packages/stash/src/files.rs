//! Hashing local files.
//!
//! Hashes of plain files are cached keyed on their size and modification
//! time, so a file is only read again once it changed. Directory preparsing
//! records those stamps for a whole directory in one pass, which saves a
//! `stat` per file on filesystems where that is slow.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use derive_more::Debug;
use protocol::{CasKey, RootPaths};
use tracing::{debug, instrument, trace};

/// What a file looked like when it was hashed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct FileStamp {
    len: u64,
    mtime: SystemTime,
}

impl FileStamp {
    fn from_metadata(metadata: &fs::Metadata) -> Result<Self> {
        Ok(Self {
            len: metadata.len(),
            mtime: metadata.modified().context("read mtime")?,
        })
    }
}

#[derive(Copy, Clone, Debug)]
struct HashedFile {
    stamp: FileStamp,
    key: CasKey,
}

/// Coalesces concurrent preparses of one directory.
#[derive(Debug, Default)]
struct PreparedDir {
    done: Mutex<bool>,
}

/// A file's content as stored in the cache: possibly with roots substituted.
#[derive(Clone, Debug)]
pub(crate) struct FileContent {
    pub key: CasKey,
    #[debug("{} bytes", content.len())]
    pub content: Vec<u8>,
}

#[derive(Debug, Default)]
#[debug("FileHasher({} cached)", hashes.len())]
pub(crate) struct FileHasher {
    hashes: DashMap<PathBuf, HashedFile>,
    stamps: DashMap<PathBuf, FileStamp>,
    prepared: DashMap<PathBuf, Arc<PreparedDir>>,
}

impl FileHasher {
    /// Key of the file at `path`. Content is normalized with `roots` when
    /// given; those hashes are not cached.
    pub fn hash(&self, path: &Path, roots: Option<&RootPaths>) -> Result<CasKey> {
        if let Some(roots) = roots {
            return Ok(self.read(path, Some(roots))?.key);
        }

        let stamp = self.stamp(path)?;
        if let Some(hashed) = self.hashes.get(path) {
            if hashed.stamp == stamp {
                trace!(?path, key = %hashed.key, "hash cache hit");
                return Ok(hashed.key);
            }
        }
        let key = hash_file(path)?;
        self.hashes
            .insert(path.to_path_buf(), HashedFile { stamp, key });
        Ok(key)
    }

    /// Read the file and compute its key, bypassing the cache.
    pub fn read(&self, path: &Path, roots: Option<&RootPaths>) -> Result<FileContent> {
        let content = fs::read(path).with_context(|| format!("read {path:?}"))?;
        Ok(match roots.and_then(|roots| roots.normalize_content(&content)) {
            Some(normalized) => FileContent {
                key: CasKey::from_buffer(&normalized).as_normalized(true),
                content: normalized,
            },
            None => FileContent {
                key: CasKey::from_buffer(&content),
                content,
            },
        })
    }

    /// Forget any cached hash of `path`, for files this process writes.
    pub fn forget(&self, path: &Path) {
        self.hashes.remove(path);
        self.stamps.remove(path);
    }

    /// Record the stamp of every file directly inside `dir`.
    ///
    /// Only the first caller for a directory scans it; concurrent callers
    /// wait for that scan and later callers return at once. Returns the
    /// number of files this call recorded.
    #[instrument(name = "FileHasher::preparse_directory", skip(self))]
    pub fn preparse_directory(&self, dir: &Path) -> Result<usize> {
        let prepared = self.prepared.entry(dir.to_path_buf()).or_default().clone();
        let mut done = prepared.done.lock().unwrap_or_else(PoisonError::into_inner);
        if *done {
            return Ok(0);
        }

        let mut recorded = 0;
        for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("list {dir:?}"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry
                .metadata()
                .with_context(|| format!("stat {:?}", entry.path()))?;
            self.stamps
                .insert(entry.into_path(), FileStamp::from_metadata(&metadata)?);
            recorded += 1;
        }
        *done = true;
        debug!(recorded, "directory preparsed");
        Ok(recorded)
    }

    /// A preparsed stamp is used once; after that the file is stat'ed again.
    fn stamp(&self, path: &Path) -> Result<FileStamp> {
        if let Some((_, stamp)) = self.stamps.remove(path) {
            return Ok(stamp);
        }
        let metadata = fs::metadata(path).with_context(|| format!("stat {path:?}"))?;
        FileStamp::from_metadata(&metadata)
    }
}

/// Stream a file through the hasher.
#[instrument]
fn hash_file(path: &Path) -> Result<CasKey> {
    let mut file = File::open(path).with_context(|| format!("open {path:?}"))?;
    let mut hasher = blake3::Hasher::new();
    let bytes = std::io::copy(&mut file, &mut hasher).context("hash file")?;
    let key = CasKey::from_hasher(&hasher);
    trace!(?path, %key, bytes, "hash file");
    Ok(key)
}
