//! Request handling.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail, eyre},
};
use derive_more::Debug;
use protocol::{
    CACHE_NETWORK_VERSION, CasKey, CompactCasKeyTable, CompactPathTable, ConnectionId,
    MessageType, Storage, WireMessage,
    binary::{BinaryReader, BinaryWriter},
    message::{
        ConnectRequest, FetchEntriesRequest, FetchEntriesResponse, FetchTableRequest,
        FetchTableResponse, ReportUsedEntryRequest, StoreEntryDoneRequest, StoreEntryRequest,
        StoreEntryResponse, StoreTableRequest,
    },
    now_seconds,
    transport::{decode_request, encode_response},
};
use serde::Serialize;
use tap::Pipe;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    CacheServerConfig,
    bucket::{Bucket, BucketStatus, Generations},
};

/// The cache server: every bucket's tables and entries plus the state of
/// each client connection.
///
/// All methods take `&self`; the server is shared between connection
/// handlers behind an `Arc`. Requests are handled synchronously, so async
/// front ends run them on blocking threads.
#[derive(Debug)]
#[debug("CacheServer(root = {:?})", self.config.root_dir)]
pub struct CacheServer {
    pub(crate) config: CacheServerConfig,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) buckets: RwLock<HashMap<u32, Arc<Bucket>>>,
    pub(crate) generations: Arc<Generations>,
    connections: Mutex<HashMap<ConnectionId, Arc<Mutex<Connection>>>>,
    next_connection: AtomicU64,
    next_token: AtomicU32,
    should_shutdown: AtomicBool,
    pub(crate) should_wipe: AtomicBool,
    pub(crate) force_maintenance: AtomicBool,
}

/// What the server knows about one client.
#[derive(Default)]
struct Connection {
    client_name: Option<String>,

    /// The client's own tables, per bucket, as far as it pushed them.
    tables: HashMap<u32, ConnectionTables>,

    /// Stores waiting for the client to upload missing outputs.
    staged: HashMap<u32, StagedEntry>,
}

#[derive(Default)]
struct ConnectionTables {
    path_table: CompactPathTable,
    cas_table: CompactCasKeyTable,
}

/// A store with offsets already translated to the bucket's tables.
struct StagedEntry {
    bucket: u32,
    generation: u32,
    cmd_key: CasKey,
    inputs: Vec<u32>,
    outputs: Vec<u32>,
    output_keys: Vec<CasKey>,
    log_lines: Vec<u8>,
}

/// Summary of the server for the `status` command.
#[derive(Clone, Debug, Serialize)]
pub struct ServerStatus {
    pub root_dir: String,
    pub connections: usize,
    pub should_shutdown: bool,
    pub buckets: Vec<BucketStatus>,
}

impl CacheServer {
    pub fn new(config: CacheServerConfig, storage: Arc<dyn Storage>) -> Self {
        let should_wipe = config.wipe_on_load;
        Self {
            config,
            storage,
            buckets: RwLock::new(HashMap::new()),
            generations: Arc::new(Generations::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            next_token: AtomicU32::new(1),
            should_shutdown: AtomicBool::new(false),
            should_wipe: AtomicBool::new(should_wipe),
            force_maintenance: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CacheServerConfig {
        &self.config
    }

    /// Whether a client asked the server to stop.
    pub fn should_shutdown(&self) -> bool {
        self.should_shutdown.load(Ordering::Acquire)
    }

    /// Whether the `maintenance` command ran since the last maintenance.
    pub fn maintenance_requested(&self) -> bool {
        self.force_maintenance.load(Ordering::Acquire)
    }

    /// Register a new client connection.
    pub fn open_connection(&self) -> ConnectionId {
        let id = ConnectionId::from(self.next_connection.fetch_add(1, Ordering::Relaxed));
        self.lock_connections()
            .insert(id, Arc::new(Mutex::new(Connection::default())));
        debug!(%id, "connection opened");
        id
    }

    /// Forget a connection, discarding its tables and staged stores.
    pub fn close_connection(&self, id: ConnectionId) {
        if let Some(connection) = self.lock_connections().remove(&id) {
            let connection = connection.lock().unwrap_or_else(PoisonError::into_inner);
            debug!(%id, staged = connection.staged.len(), "connection closed");
        }
    }

    /// Handle a request frame, producing the response frame. Errors become
    /// error responses.
    pub fn handle_frame(&self, connection: ConnectionId, frame: &[u8]) -> Vec<u8> {
        decode_request(frame)
            .and_then(|(message, body)| self.handle_request(connection, message, body))
            .pipe(encode_response)
    }

    /// Handle one request body, returning the response body.
    pub fn handle_request(
        &self,
        connection: ConnectionId,
        message: MessageType,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        let mut reader = BinaryReader::new(body);
        let mut writer = BinaryWriter::new();
        self.handle_message(connection, message, &mut reader, &mut writer)?;
        if !reader.is_at_end() {
            bail!("{} trailing bytes after {message} request", reader.remaining());
        }
        Ok(writer.into_inner())
    }

    /// Dispatch a request read from `reader`, writing the response to
    /// `writer`.
    #[instrument(name = "CacheServer::handle_message", skip(self, reader, writer))]
    pub fn handle_message(
        &self,
        connection: ConnectionId,
        message: MessageType,
        reader: &mut BinaryReader<'_>,
        writer: &mut BinaryWriter,
    ) -> Result<()> {
        let connection = self.connection(connection)?;
        let mut connection = connection.lock().unwrap_or_else(PoisonError::into_inner);
        if message != MessageType::Connect && connection.client_name.is_none() {
            bail!("{message} before connect handshake");
        }

        match message {
            MessageType::Connect => {
                let request = ConnectRequest::read(reader)?;
                self.handle_connect(&mut connection, request)?.write(writer);
            }
            MessageType::StorePathTable => {
                let request = StoreTableRequest::read(reader)?;
                let table = &connection.tables.entry(request.bucket).or_default().path_table;
                store_table(table.size(), &request, |bytes| table.read_mem(bytes, false))?;
                table.size().write(writer);
            }
            MessageType::StoreCasTable => {
                let request = StoreTableRequest::read(reader)?;
                let table = &connection.tables.entry(request.bucket).or_default().cas_table;
                store_table(table.size(), &request, |bytes| table.read_mem(bytes, false))?;
                table.size().write(writer);
            }
            MessageType::StoreEntry => {
                let request = StoreEntryRequest::read(reader)?;
                self.handle_store_entry(&mut connection, request)?.write(writer);
            }
            MessageType::StoreEntryDone => {
                let request = StoreEntryDoneRequest::read(reader)?;
                self.handle_store_entry_done(&mut connection, request)?
                    .write(writer);
            }
            MessageType::FetchPathTable => {
                let request = FetchTableRequest::read(reader)?;
                self.handle_fetch_table(request, |bucket, from| bucket.path_table.memory_from(from))
                    .write(writer);
            }
            MessageType::FetchCasTable => {
                let request = FetchTableRequest::read(reader)?;
                self.handle_fetch_table(request, |bucket, from| bucket.cas_table.memory_from(from))
                    .write(writer);
            }
            MessageType::FetchEntries => {
                let request = FetchEntriesRequest::read(reader)?;
                self.handle_fetch_entries(request).write(writer);
            }
            MessageType::ReportUsedEntry => {
                let request = ReportUsedEntryRequest::read(reader)?;
                self.handle_report_used_entry(request);
            }
            MessageType::ExecuteCommand => {
                let command = String::read(reader)?;
                self.execute_command(&command)?.write(writer);
            }
            MessageType::RequestShutdown => {
                let reason = String::read(reader)?;
                info!(%reason, "shutdown requested");
                self.should_shutdown.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    fn handle_connect(&self, connection: &mut Connection, request: ConnectRequest) -> Result<u32> {
        if request.version != CACHE_NETWORK_VERSION {
            bail!(
                "client network version {} does not match server version {CACHE_NETWORK_VERSION}",
                request.version
            );
        }
        info!(client = %request.client_name, "client connected");
        connection.client_name = Some(request.client_name);
        Ok(CACHE_NETWORK_VERSION)
    }

    #[instrument(name = "CacheServer::store_entry", skip_all, fields(bucket = request.bucket, cmd = %request.cmd_key))]
    fn handle_store_entry(
        &self,
        connection: &mut Connection,
        request: StoreEntryRequest,
    ) -> Result<StoreEntryResponse> {
        let tables = connection
            .tables
            .get(&request.bucket)
            .ok_or_else(|| eyre!("no tables pushed for bucket {}", request.bucket))?;
        let inputs = resolve_offsets(tables, &request.inputs).context("resolve inputs")?;
        let outputs = resolve_offsets(tables, &request.outputs).context("resolve outputs")?;

        let bucket = self.bucket_or_create(request.bucket);
        let _gate = bucket.enter();
        let input_offsets = inputs
            .iter()
            .map(|(path, key)| bucket.intern(path, key))
            .collect::<Vec<_>>();
        let output_offsets = outputs
            .iter()
            .map(|(path, key)| bucket.intern(path, key))
            .collect::<Vec<_>>();
        let output_keys = outputs.iter().map(|(_, key)| *key).collect::<Vec<_>>();

        let missing = self.missing_keys(&output_keys)?;
        if missing.is_empty() {
            let added = bucket.commit(
                &request.cmd_key,
                &input_offsets,
                &output_offsets,
                request.log_lines,
                now_seconds(),
            );
            debug!(?added, "entry committed");
            return Ok(StoreEntryResponse::Committed {
                entry_id: added.id(),
            });
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        debug!(token, missing = missing.len(), "entry staged");
        connection.staged.insert(
            token,
            StagedEntry {
                bucket: request.bucket,
                generation: bucket.generation(),
                cmd_key: request.cmd_key,
                inputs: input_offsets,
                outputs: output_offsets,
                output_keys,
                log_lines: request.log_lines,
            },
        );
        Ok(StoreEntryResponse::Staged { token, missing })
    }

    /// Commit or discard a staged store. Responds with the entry id, or `0`
    /// when nothing was committed.
    #[instrument(name = "CacheServer::store_entry_done", skip_all, fields(token = request.token))]
    fn handle_store_entry_done(
        &self,
        connection: &mut Connection,
        request: StoreEntryDoneRequest,
    ) -> Result<u32> {
        let staged = connection
            .staged
            .remove(&request.token)
            .ok_or_else(|| eyre!("unknown staged entry {}", request.token))?;
        if !request.success {
            debug!("client abandoned staged entry");
            return Ok(0);
        }

        let bucket = self.bucket_or_create(staged.bucket);
        let _gate = bucket.enter();
        if bucket.generation() != staged.generation {
            warn!("bucket tables were rebuilt while the entry was staged");
            return Ok(0);
        }
        let missing = self.missing_keys(&staged.output_keys)?;
        if !missing.is_empty() {
            warn!(missing = missing.len(), "outputs still missing from storage");
            return Ok(0);
        }

        let added = bucket.commit(
            &staged.cmd_key,
            &staged.inputs,
            &staged.outputs,
            staged.log_lines,
            now_seconds(),
        );
        debug!(?added, "staged entry committed");
        Ok(added.id())
    }

    /// Table bytes past what the client holds. A generation mismatch resends
    /// the table from the start.
    fn handle_fetch_table(
        &self,
        request: FetchTableRequest,
        memory_from: impl Fn(&Bucket, u32) -> Vec<u8>,
    ) -> FetchTableResponse {
        let Some(bucket) = self.bucket(request.bucket) else {
            return FetchTableResponse {
                generation: 0,
                bytes: Vec::new(),
            };
        };
        let _gate = bucket.enter();
        let generation = bucket.generation();
        let from = if generation == request.generation {
            request.known_size.max(CompactCasKeyTable::INITIAL_SIZE)
        } else {
            CompactCasKeyTable::INITIAL_SIZE
        };
        let bytes = memory_from(&bucket, from);
        trace!(bucket = bucket.id, from, len = bytes.len(), "serving table range");
        FetchTableResponse { generation, bytes }
    }

    fn handle_fetch_entries(&self, request: FetchEntriesRequest) -> FetchEntriesResponse {
        let Some(bucket) = self.bucket(request.bucket) else {
            return FetchEntriesResponse {
                generation: 0,
                path_table_size: CompactPathTable::INITIAL_SIZE,
                cas_table_size: CompactCasKeyTable::INITIAL_SIZE,
                entries: Vec::new(),
            };
        };
        let _gate = bucket.enter();
        let entries = bucket.write_entries(&request.cmd_key);
        FetchEntriesResponse {
            generation: bucket.generation(),
            path_table_size: bucket.path_table.size(),
            cas_table_size: bucket.cas_table.size(),
            entries,
        }
    }

    fn handle_report_used_entry(&self, request: ReportUsedEntryRequest) {
        let Some(bucket) = self.bucket(request.bucket) else {
            return;
        };
        let _gate = bucket.enter();
        let touched = bucket
            .container(&request.cmd_key)
            .is_some_and(|container| container.touch(request.entry_id, now_seconds()));
        if touched {
            bucket.mark_dirty();
        } else {
            debug!(entry = request.entry_id, "reported entry no longer exists");
        }
    }

    /// Run an administrative command and return its output.
    #[instrument(name = "CacheServer::execute_command", skip(self))]
    pub fn execute_command(&self, command: &str) -> Result<String> {
        match command.trim() {
            "status" => serde_json::to_string_pretty(&self.status()).context("serialize status"),
            "maintenance" => {
                self.force_maintenance.store(true, Ordering::Release);
                Ok(String::from("maintenance scheduled"))
            }
            "obliterate" => {
                let removed = self.obliterate()?;
                Ok(format!("obliterated {removed} buckets"))
            }
            "save" => {
                let saved = self.save()?;
                Ok(format!("saved {saved} buckets"))
            }
            other => bail!("unknown command {other:?}"),
        }
    }

    pub fn status(&self) -> ServerStatus {
        let mut buckets = self
            .all_buckets()
            .iter()
            .map(|bucket| bucket.status())
            .collect::<Vec<_>>();
        buckets.sort_by_key(|bucket| bucket.id);
        ServerStatus {
            root_dir: self.config.root_dir.display().to_string(),
            connections: self.lock_connections().len(),
            should_shutdown: self.should_shutdown(),
            buckets,
        }
    }

    /// Number of entries stored for `cmd_key`, mostly for diagnostics.
    pub fn entry_count(&self, bucket: u32, cmd_key: &CasKey) -> usize {
        self.bucket(bucket)
            .and_then(|bucket| bucket.container(cmd_key))
            .map(|container| container.len())
            .unwrap_or_default()
    }

    /// Current table generation of a bucket, `0` if it doesn't exist.
    pub fn bucket_generation(&self, bucket: u32) -> u32 {
        self.bucket(bucket)
            .map(|bucket| bucket.generation())
            .unwrap_or_default()
    }

    /// Keys from `keys` that storage does not have, without duplicates.
    fn missing_keys(&self, keys: &[CasKey]) -> Result<Vec<CasKey>> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for key in keys {
            if !seen.insert(*key) {
                continue;
            }
            if !self
                .storage
                .exists(key)
                .with_context(|| format!("check storage for {key}"))?
            {
                missing.push(*key);
            }
        }
        Ok(missing)
    }

    pub(crate) fn bucket(&self, id: u32) -> Option<Arc<Bucket>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub(crate) fn bucket_or_create(&self, id: u32) -> Arc<Bucket> {
        if let Some(bucket) = self.bucket(id) {
            return bucket;
        }
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| {
                info!(bucket = id, "creating bucket");
                Arc::new(Bucket::new(id, self.config.case_sensitivity, self.generations.clone()))
            })
            .clone()
    }

    pub(crate) fn all_buckets(&self) -> Vec<Arc<Bucket>> {
        let mut buckets = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        buckets.sort_by_key(|bucket| bucket.id);
        buckets
    }

    fn connection(&self, id: ConnectionId) -> Result<Arc<Mutex<Connection>>> {
        self.lock_connections()
            .get(&id)
            .cloned()
            .ok_or_eyre("unknown connection")
    }

    fn lock_connections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<Mutex<Connection>>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Append pushed table bytes if they continue what the connection holds.
/// The response is the resulting size, so a client that pushed from the
/// wrong place knows where to resume.
fn store_table(
    size: u32,
    request: &StoreTableRequest,
    read_mem: impl FnOnce(&[u8]) -> Result<()>,
) -> Result<()> {
    if request.start > size {
        debug!(start = request.start, size, "table push does not continue current size");
        return Ok(());
    }
    let overlap = (size - request.start) as usize;
    if overlap < request.bytes.len() {
        read_mem(&request.bytes[overlap..]).context("append table bytes")?;
    }
    Ok(())
}

/// Translate connection table offsets into `(path, key)` pairs.
fn resolve_offsets(tables: &ConnectionTables, offsets: &[u32]) -> Result<Vec<(String, CasKey)>> {
    offsets
        .iter()
        .map(|offset| {
            let (path_offset, key) = tables.cas_table.get_path_and_key(*offset)?;
            let path = tables.path_table.get_string(path_offset)?;
            Ok((path, key))
        })
        .collect()
}
