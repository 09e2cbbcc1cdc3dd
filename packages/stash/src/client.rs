//! The cache client.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::{Debug, Display};
use humansize::{DECIMAL, format_size};
use itertools::Itertools;
use protocol::{
    CACHE_DATABASE_VERSION, CACHE_NETWORK_VERSION, CacheEntriesTraverser, CasKey, CaseSensitivity,
    CompactCasKeyTable, CompactPathTable, EntryView, MessageType, NetworkClient, NetworkClientExt,
    ProcessLogLine, ProcessStartInfo, RootPaths, Storage,
    message::{
        ConnectRequest, FetchEntriesRequest, FetchEntriesResponse, FetchTableRequest,
        FetchTableResponse, ReportUsedEntryRequest, StoreEntryDoneRequest, StoreEntryRequest,
        StoreEntryResponse, StoreTableRequest,
    },
    process::{decode_log_lines, encode_log_lines},
    storage::temp_path,
};
use rayon::prelude::*;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    CacheClientConfig,
    cmd_key::cmd_key,
    files::{FileContent, FileHasher},
};

/// A fetch that finds the server tables rebuilt under it starts over once
/// with a fresh mirror.
const FETCH_ATTEMPTS: u32 = 2;

/// Outcome of [`CacheClient::fetch_from_cache`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheResult {
    pub hit: bool,

    /// Log lines the cached process produced, to be replayed.
    pub log_lines: Vec<ProcessLogLine>,

    /// Id of the entry that hit, `0` on a miss.
    pub entry_id: u32,

    /// Why nothing hit. Only filled in when
    /// [`CacheClientConfig::report_miss_reason`] is set.
    pub miss_reason: Option<MissReason>,
}

/// Why a fetch did not hit. Describes the most recently used candidate when
/// there were several.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum MissReason {
    #[display("cache hits are disabled")]
    Disabled,

    #[display("no entries for this command")]
    NoEntries,

    #[display("input {path} differs from all {candidates} entries")]
    InputMismatch { path: String, candidates: usize },

    #[display("output {path} of all {candidates} entries is missing from storage")]
    OutputMissing { path: String, candidates: usize },

    #[display("server tables changed during the fetch")]
    TablesChanged,

    #[display("{_0}")]
    Error(String),
}

/// Client side of the build cache.
///
/// Network exchanges of one client are serialized: a store or fetch holds
/// the session for its whole request sequence. File hashing happens before
/// the session is taken, so concurrent callers only queue for the network.
#[derive(Debug)]
#[debug("CacheClient({})", config.client_name)]
pub struct CacheClient {
    config: CacheClientConfig,
    network: Arc<dyn NetworkClient>,
    storage: Arc<dyn Storage>,
    files: FileHasher,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    buckets: HashMap<u32, ClientBucket>,
}

/// What the client knows about one bucket.
struct ClientBucket {
    /// Tables that offsets in store requests refer to. The server holds a
    /// copy per connection, as far as `acked_*` says.
    send_paths: CompactPathTable,
    send_cas: CompactCasKeyTable,
    acked_paths: u32,
    acked_cas: u32,

    /// Prefix of the server's bucket tables, for resolving fetched entries.
    mirror_paths: CompactPathTable,
    mirror_cas: CompactCasKeyTable,
    mirror_generation: u32,
}

impl Default for ClientBucket {
    fn default() -> Self {
        Self {
            send_paths: CompactPathTable::new(CaseSensitivity::Sensitive),
            send_cas: CompactCasKeyTable::new(),
            acked_paths: CompactPathTable::INITIAL_SIZE,
            acked_cas: CompactCasKeyTable::INITIAL_SIZE,
            mirror_paths: CompactPathTable::new(CaseSensitivity::Sensitive),
            mirror_cas: CompactCasKeyTable::new(),
            mirror_generation: 0,
        }
    }
}

impl ClientBucket {
    fn reset_mirror(&mut self, generation: u32) {
        debug!(generation, "resetting table mirror");
        self.mirror_paths = CompactPathTable::new(CaseSensitivity::Sensitive);
        self.mirror_cas = CompactCasKeyTable::new();
        self.mirror_generation = generation;
    }
}

/// An output file ready to be stored.
#[derive(Debug)]
struct OutputFile {
    local: PathBuf,
    normalized: bool,
    content: FileContent,
}

/// Why a candidate entry can't be used.
enum Rejection {
    Input(String),
    Output(String),
}

impl CacheClient {
    /// Connect to the server behind `network`, failing if it speaks another
    /// protocol version.
    #[instrument(name = "CacheClient::connect", skip(network, storage))]
    pub fn connect(
        network: Arc<dyn NetworkClient>,
        storage: Arc<dyn Storage>,
        config: CacheClientConfig,
    ) -> Result<Self> {
        let request = ConnectRequest::builder()
            .version(CACHE_NETWORK_VERSION)
            .client_name(&config.client_name)
            .build();
        let version = network
            .request::<_, u32>(MessageType::Connect, &request)
            .context("connect handshake")?;
        if version != CACHE_NETWORK_VERSION {
            bail!("server speaks network version {version}, client {CACHE_NETWORK_VERSION}");
        }
        Ok(Self {
            config,
            network,
            storage,
            files: FileHasher::default(),
            session: Mutex::new(Session::default()),
        })
    }

    pub fn config(&self) -> &CacheClientConfig {
        &self.config
    }

    /// Store the result of running `process`: the inputs it read, the
    /// outputs it wrote, and its log. Returns whether an entry was
    /// committed; failures are logged and never partially commit.
    #[instrument(
        name = "CacheClient::write_to_cache",
        skip_all,
        fields(bucket = bucket, process_id = process_id, description = %process.description)
    )]
    pub fn write_to_cache(
        &self,
        roots: &RootPaths,
        bucket: u32,
        process: &ProcessStartInfo,
        inputs: &[impl AsRef<Path> + Sync],
        outputs: &[impl AsRef<Path> + Sync],
        log_lines: &[ProcessLogLine],
        process_id: u32,
    ) -> bool {
        match self.try_write_to_cache(roots, bucket, process, inputs, outputs, log_lines) {
            Ok(entry_id) => {
                debug!(entry_id, "stored cache entry");
                true
            }
            Err(err) => {
                warn!("storing cache entry failed: {err:#}");
                false
            }
        }
    }

    fn try_write_to_cache(
        &self,
        roots: &RootPaths,
        bucket: u32,
        process: &ProcessStartInfo,
        inputs: &[impl AsRef<Path> + Sync],
        outputs: &[impl AsRef<Path> + Sync],
        log_lines: &[ProcessLogLine],
    ) -> Result<u32> {
        let cmd_key = cmd_key(roots, process);
        let inputs = inputs
            .par_iter()
            .map(|path| {
                let path = path.as_ref();
                let key = self.files.hash(path, self.normalizing(path, roots))?;
                Ok((table_path(roots, path)?, key))
            })
            .collect::<Result<Vec<_>>>()
            .context("hash inputs")?;
        let outputs = outputs
            .par_iter()
            .map(|path| {
                let path = path.as_ref();
                let content = self.files.read(path, self.normalizing(path, roots))?;
                Ok((
                    table_path(roots, path)?,
                    OutputFile {
                        local: path.to_path_buf(),
                        normalized: content.key.is_normalized(),
                        content,
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()
            .context("read outputs")?;

        if self.config.validate_cache_writes_input {
            self.validate_inputs(roots, &inputs)?;
        }
        let log_lines = encode_log_lines(log_lines);

        let mut session = self.session();
        let state = session.buckets.entry(bucket).or_default();
        let input_offsets = inputs
            .iter()
            .map(|(path, key)| intern(state, path, key))
            .collect::<Vec<_>>();
        let output_offsets = outputs
            .iter()
            .map(|(path, output)| intern(state, path, &output.content.key))
            .collect::<Vec<_>>();
        self.push_tables(bucket, state)?;

        let request = StoreEntryRequest::builder()
            .bucket(bucket)
            .cmd_key(cmd_key)
            .inputs(input_offsets)
            .outputs(output_offsets)
            .log_lines(log_lines)
            .build();
        let (token, missing) = match self.network.request(MessageType::StoreEntry, &request)? {
            StoreEntryResponse::Committed { entry_id } => return Ok(entry_id),
            StoreEntryResponse::Staged { token, missing } => (token, missing),
        };

        if let Err(err) = self.upload(&outputs, &missing) {
            self.finish_store(token, false)?;
            return Err(err);
        }
        match self.finish_store(token, true)? {
            0 => bail!("server did not commit the entry"),
            entry_id => Ok(entry_id),
        }
    }

    /// Look for a stored result of `process` whose inputs match the local
    /// files. On a hit the outputs are written to their local paths.
    #[instrument(
        name = "CacheClient::fetch_from_cache",
        skip_all,
        fields(bucket = bucket, description = %process.description)
    )]
    pub fn fetch_from_cache(
        &self,
        roots: &RootPaths,
        bucket: u32,
        process: &ProcessStartInfo,
    ) -> CacheResult {
        if !self.config.use_cache_hit {
            return self.miss(MissReason::Disabled);
        }
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.try_fetch_from_cache(roots, bucket, process) {
                Ok(Some(result)) => return result,
                Ok(None) => debug!(attempt, "tables changed while fetching"),
                Err(err) => {
                    warn!("fetching from cache failed: {err:#}");
                    return self.miss(MissReason::Error(format!("{err:#}")));
                }
            }
        }
        self.miss(MissReason::TablesChanged)
    }

    /// One fetch attempt; `None` when the server tables changed under the
    /// mirror and the attempt should be repeated.
    fn try_fetch_from_cache(
        &self,
        roots: &RootPaths,
        bucket: u32,
        process: &ProcessStartInfo,
    ) -> Result<Option<CacheResult>> {
        let cmd_key = cmd_key(roots, process);
        let mut session = self.session();
        let state = session.buckets.entry(bucket).or_default();

        let request = FetchEntriesRequest::builder()
            .bucket(bucket)
            .cmd_key(cmd_key)
            .build();
        let response: FetchEntriesResponse = self.network.request(MessageType::FetchEntries, &request)?;
        if response.entries.is_empty() {
            return Ok(Some(self.miss(MissReason::NoEntries)));
        }
        if response.generation != state.mirror_generation
            || response.cas_table_size < state.mirror_cas.size()
            || response.path_table_size < state.mirror_paths.size()
        {
            state.reset_mirror(response.generation);
        }

        let traverser = CacheEntriesTraverser::new(&response.entries, CACHE_DATABASE_VERSION)
            .context("read fetched entries")?;
        let candidates = usize::from(traverser.entry_count());
        let mut first_rejection = None;
        for entry in traverser {
            let entry = entry.context("read fetched entry")?;
            let rejection = match self.check_candidate(roots, bucket, state, &entry) {
                Ok(Ok(outputs)) => {
                    self.materialize(roots, &outputs)
                        .context("write outputs")?;
                    let log_lines = decode_log_lines(entry.log_lines()).context("decode log lines")?;
                    let report = ReportUsedEntryRequest::builder()
                        .bucket(bucket)
                        .cmd_key(cmd_key)
                        .entry_id(entry.id)
                        .build();
                    self.network
                        .request::<_, ()>(MessageType::ReportUsedEntry, &report)?;
                    info!(entry = entry.id, outputs = outputs.len(), "cache hit");
                    return Ok(Some(CacheResult {
                        hit: true,
                        log_lines,
                        entry_id: entry.id,
                        miss_reason: None,
                    }));
                }
                Ok(Err(rejection)) => rejection,
                Err(err) if state.mirror_generation != response.generation => {
                    debug!("mirror out of date: {err:#}");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };
            first_rejection.get_or_insert(rejection);
        }

        let reason = match first_rejection {
            Some(Rejection::Input(path)) => MissReason::InputMismatch { path, candidates },
            Some(Rejection::Output(path)) => MissReason::OutputMissing { path, candidates },
            None => MissReason::NoEntries,
        };
        debug!(%reason, "cache miss");
        Ok(Some(self.miss(reason)))
    }

    /// Check a candidate's inputs against local files and its outputs
    /// against storage. Returns the outputs to materialize when usable.
    fn check_candidate(
        &self,
        roots: &RootPaths,
        bucket: u32,
        state: &mut ClientBucket,
        entry: &EntryView<'_>,
    ) -> Result<Result<Vec<(PathBuf, CasKey)>, Rejection>> {
        for offset in entry.inputs() {
            let (path, key) = self.resolve(bucket, state, offset)?;
            let local = PathBuf::from(roots.denormalize_path(&path)?);
            let matches = self
                .files
                .hash(&local, key.is_normalized().then_some(roots))
                .map(|actual| actual == key)
                .unwrap_or_else(|err| {
                    trace!(?local, "input unavailable: {err:#}");
                    false
                });
            if !matches {
                trace!(entry = entry.id, ?local, "input differs");
                return Ok(Err(Rejection::Input(local.display().to_string())));
            }
        }

        let mut outputs = Vec::new();
        for offset in entry.outputs() {
            let (path, key) = self.resolve(bucket, state, offset)?;
            let local = PathBuf::from(roots.denormalize_path(&path)?);
            if !self.storage.exists(&key)? {
                trace!(entry = entry.id, %key, "output missing from storage");
                return Ok(Err(Rejection::Output(local.display().to_string())));
            }
            outputs.push((local, key));
        }
        Ok(Ok(outputs))
    }

    /// Resolve a server cas table offset through the mirror, downloading
    /// table ranges the mirror doesn't hold yet.
    fn resolve(&self, bucket: u32, state: &mut ClientBucket, offset: u32) -> Result<(String, CasKey)> {
        let known = state.mirror_cas.size();
        if offset >= known {
            let bytes = self.fetch_table(bucket, state, MessageType::FetchCasTable, known)?;
            if let Err(err) = state.mirror_cas.read_mem(&bytes, false) {
                state.reset_mirror(0);
                return Err(err).context("extend cas table mirror");
            }
        }
        let (path_offset, key) = state.mirror_cas.get_path_and_key(offset)?;
        let known = state.mirror_paths.size();
        if path_offset >= known {
            let bytes = self.fetch_table(bucket, state, MessageType::FetchPathTable, known)?;
            if let Err(err) = state.mirror_paths.read_mem(&bytes, false) {
                state.reset_mirror(0);
                return Err(err).context("extend path table mirror");
            }
        }
        Ok((state.mirror_paths.get_string(path_offset)?, key))
    }

    fn fetch_table(
        &self,
        bucket: u32,
        state: &mut ClientBucket,
        message: MessageType,
        known_size: u32,
    ) -> Result<Vec<u8>> {
        let request = FetchTableRequest::builder()
            .bucket(bucket)
            .generation(state.mirror_generation)
            .known_size(known_size)
            .build();
        let response: FetchTableResponse = self.network.request(message, &request)?;
        if response.generation != state.mirror_generation {
            state.reset_mirror(response.generation);
            bail!("bucket {bucket} tables were rebuilt");
        }
        trace!(%message, known_size, len = response.bytes.len(), "fetched table range");
        Ok(response.bytes)
    }

    /// Write fetched outputs to their local paths.
    fn materialize(&self, roots: &RootPaths, outputs: &[(PathBuf, CasKey)]) -> Result<()> {
        for (path, key) in outputs {
            let content = self
                .storage
                .read(key)?
                .ok_or_else(|| eyre!("output {key} disappeared from storage"))?;
            let content = if key.is_normalized() {
                roots.denormalize_content(&content)?
            } else {
                content
            };
            write_file(path, &content)?;
            self.files.forget(path);
            trace!(?path, size = %format_size(content.len(), DECIMAL), "materialized output");
        }
        Ok(())
    }

    /// Push table bytes the server hasn't acknowledged. The server replies
    /// with its size, so a push from the wrong place is retried from there.
    fn push_tables(&self, bucket: u32, state: &mut ClientBucket) -> Result<()> {
        state.acked_paths = self.push_table(
            bucket,
            MessageType::StorePathTable,
            state.acked_paths,
            |from| state.send_paths.memory_from(from),
            state.send_paths.size(),
        )?;
        state.acked_cas = self.push_table(
            bucket,
            MessageType::StoreCasTable,
            state.acked_cas,
            |from| state.send_cas.memory_from(from),
            state.send_cas.size(),
        )?;
        Ok(())
    }

    fn push_table(
        &self,
        bucket: u32,
        message: MessageType,
        mut acked: u32,
        memory_from: impl Fn(u32) -> Vec<u8>,
        size: u32,
    ) -> Result<u32> {
        for _ in 0..2 {
            if acked >= size {
                break;
            }
            let request = StoreTableRequest::builder()
                .bucket(bucket)
                .start(acked)
                .bytes(memory_from(acked))
                .build();
            acked = self.network.request(message, &request)?;
        }
        if acked != size {
            bail!("server holds {acked} bytes of the {message} table, client {size}");
        }
        Ok(acked)
    }

    fn upload(&self, outputs: &[(String, OutputFile)], missing: &[CasKey]) -> Result<()> {
        let missing = missing.iter().collect::<HashSet<_>>();
        let uploads = outputs
            .iter()
            .filter(|(_, output)| missing.contains(&output.content.key))
            .unique_by(|(_, output)| output.content.key)
            .collect::<Vec<_>>();
        for (_, output) in &uploads {
            let key = &output.content.key;
            self.storage
                .write(key, &output.content.content)
                .with_context(|| format!("upload {:?}", output.local))?;
            if self.config.validate_cache_writes_output {
                let stored = self
                    .storage
                    .read(key)?
                    .ok_or_else(|| eyre!("uploaded output {key} is not in storage"))?;
                if CasKey::from_buffer(&stored) != key.without_flags() {
                    bail!("uploaded output {:?} does not match its key {key}", output.local);
                }
            }
            trace!(local = ?output.local, normalized = output.normalized, "uploaded output");
        }
        debug!(uploaded = uploads.len(), "outputs uploaded");
        Ok(())
    }

    fn finish_store(&self, token: u32, success: bool) -> Result<u32> {
        let request = StoreEntryDoneRequest::builder()
            .token(token)
            .success(success)
            .build();
        self.network.request(MessageType::StoreEntryDone, &request)
    }

    fn validate_inputs(&self, roots: &RootPaths, inputs: &[(String, CasKey)]) -> Result<()> {
        inputs.par_iter().try_for_each(|(path, key)| {
            let local = roots.denormalize_path(path)?;
            let local = Path::new(&local);
            let current = self.files.read(local, self.normalizing(local, roots))?.key;
            if current != *key {
                bail!("input {local:?} changed during the build");
            }
            Ok(())
        })
    }

    /// Ask the server to stop.
    #[instrument(name = "CacheClient::request_server_shutdown", skip(self))]
    pub fn request_server_shutdown(&self, reason: &str) -> Result<()> {
        let _session = self.session();
        self.network
            .request(MessageType::RequestShutdown, &reason.to_string())
    }

    /// Run an administrative command on the server and return its output.
    #[instrument(name = "CacheClient::execute_command", skip(self))]
    pub fn execute_command(&self, command: &str) -> Result<String> {
        let _session = self.session();
        self.network
            .request(MessageType::ExecuteCommand, &command.to_string())
    }

    /// Record the size and modification time of every file in `dir` so later
    /// hashing doesn't stat them one by one. Concurrent calls for the same
    /// directory scan it once. Returns the number of files this call saw.
    pub fn preparse_directory(&self, dir: impl AsRef<Path>) -> Result<usize> {
        self.files.preparse_directory(dir.as_ref())
    }

    /// Roots to normalize `path`'s content with, if its extension asks for it.
    fn normalizing<'r>(&self, path: &Path, roots: &'r RootPaths) -> Option<&'r RootPaths> {
        let extension = path.extension()?.to_str()?;
        self.config
            .normalize_extensions
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(extension))
            .then_some(roots)
    }

    fn miss(&self, reason: MissReason) -> CacheResult {
        CacheResult {
            miss_reason: self.config.report_miss_reason.then_some(reason),
            ..CacheResult::default()
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn intern(state: &ClientBucket, path: &str, key: &CasKey) -> u32 {
    let (path_offset, _) = state.send_paths.add(path);
    state.send_cas.add(key, path_offset).0
}

/// The root-relative form of a local path, as stored in tables.
fn table_path(roots: &RootPaths, path: &Path) -> Result<String> {
    let path = path
        .to_str()
        .ok_or_else(|| eyre!("path {path:?} is not valid utf-8"))?;
    Ok(roots.normalize_path(path))
}

fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {parent:?}"))?;
    }
    let temp = temp_path(path);
    fs::write(&temp, content).with_context(|| format!("write {temp:?}"))?;
    if let Err(err) = fs::rename(&temp, path) {
        if let Err(err) = fs::remove_file(&temp) {
            warn!("failed to remove temp file {temp:?}: {err}");
        }
        return Err(err).with_context(|| format!("rename {temp:?} to {path:?}"));
    }
    Ok(())
}
