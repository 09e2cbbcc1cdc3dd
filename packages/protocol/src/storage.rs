//! Content-addressed blob storage shared by the client and the server.

use std::{
    fmt::Debug as StdDebug,
    fs::{File, create_dir_all, metadata, remove_file, rename},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::CasKey;

/// zstd level used for blobs on disk.
const COMPRESSION_LEVEL: i32 = 3;

/// Blob store keyed by [`CasKey`].
///
/// The cache never mutates blobs; it only checks for their presence, reads
/// outputs on a hit, and writes outputs the server reports missing.
pub trait Storage: StdDebug + Send + Sync {
    /// Whether a blob exists for `key`.
    fn exists(&self, key: &CasKey) -> Result<bool>;

    /// Read the content stored for `key`, or `None` if absent.
    fn read(&self, key: &CasKey) -> Result<Option<Vec<u8>>>;

    /// Store `content` under `key`, verifying the key matches the content.
    /// Returns `true` if the blob was newly written.
    fn write(&self, key: &CasKey, content: &[u8]) -> Result<bool>;

    /// Remove the blob for `key`. Returns `true` if it existed.
    fn delete(&self, key: &CasKey) -> Result<bool>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn exists(&self, key: &CasKey) -> Result<bool> {
        self.as_ref().exists(key)
    }

    fn read(&self, key: &CasKey) -> Result<Option<Vec<u8>>> {
        self.as_ref().read(key)
    }

    fn write(&self, key: &CasKey, content: &[u8]) -> Result<bool> {
        self.as_ref().write(key, content)
    }

    fn delete(&self, key: &CasKey) -> Result<bool> {
        self.as_ref().delete(key)
    }
}

/// Filesystem storage.
///
/// ## File structure
///
/// Each blob is named by the hex of its key, prefixed with two levels of
/// folders taken from the first four hex characters:
/// `{root}/{key[0..2]}/{key[2..4]}/{key}`.
///
/// ## Compression
///
/// Content is transparently compressed with zstd. Callers write and read
/// uncompressed bytes regardless of the key's compressed flag.
///
/// ## Atomic writes
///
/// Writes go to a uniquely named temporary file which is renamed into place,
/// so concurrent writers of the same key never expose a partial blob.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[debug("DiskStorage(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// The directory is created when the first blob is written.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Example: `CasKey("abcd1234...")` -> `root/ab/cd/abcd1234...`
    fn key_path(&self, key: &CasKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }
}

impl Storage for DiskStorage {
    #[instrument(name = "DiskStorage::exists")]
    fn exists(&self, key: &CasKey) -> Result<bool> {
        let path = self.key_path(key);
        match metadata(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("check if blob exists at {path:?}")),
        }
    }

    #[instrument(name = "DiskStorage::read")]
    fn read(&self, key: &CasKey) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(format!("open blob file {path:?}")),
        };
        let mut decoder = zstd::Decoder::new(file).context("create zstd decoder")?;
        let mut content = Vec::new();
        decoder
            .read_to_end(&mut content)
            .with_context(|| format!("read decompressed blob {path:?}"))?;
        Ok(Some(content))
    }

    #[instrument(name = "DiskStorage::write", skip(content), fields(len = content.len()))]
    fn write(&self, key: &CasKey, content: &[u8]) -> Result<bool> {
        let actual = CasKey::from_buffer(content);
        if actual != key.without_flags() {
            bail!("hash mismatch: {actual:?} != {key:?}");
        }

        let path = self.key_path(key);
        if self.exists(key)? {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .with_context(|| format!("create parent directory {parent:?}"))?;
        }

        let temp = temp_path(&path);
        let written = File::create(&temp)
            .context("create temporary file")
            .and_then(|file| {
                let mut encoder =
                    zstd::Encoder::new(file, COMPRESSION_LEVEL).context("create zstd encoder")?;
                encoder.write_all(content).context("write content")?;
                encoder.finish().context("flush zstd encoder")?.sync_all().context("sync file")
            });
        if let Err(err) = written {
            remove_temp(&temp);
            return Err(err).with_context(|| format!("write blob to {temp:?}"));
        }

        match rename(&temp, &path) {
            Ok(()) => Ok(true),
            Err(err) => {
                remove_temp(&temp);
                if err.kind() == ErrorKind::AlreadyExists {
                    Ok(false)
                } else {
                    Err(err).context(format!("rename {temp:?} to {path:?}"))
                }
            }
        }
    }

    #[instrument(name = "DiskStorage::delete")]
    fn delete(&self, key: &CasKey) -> Result<bool> {
        let path = self.key_path(key);
        match remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("remove blob {path:?}")),
        }
    }
}

/// Generate a temporary file path in the same directory as the target.
pub fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

fn remove_temp(temp: &Path) {
    if let Err(err) = remove_file(temp) {
        warn!("failed to remove temp file {temp:?}: {err}");
    }
}
