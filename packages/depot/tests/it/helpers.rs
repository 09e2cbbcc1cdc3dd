//! Shared fixtures for depot integration tests.
//!
//! Tests talk to the server the way a client does: over an
//! [`InProcessClient`], pushing their own tables and sending offsets.

use std::{path::Path, sync::Arc};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use depot::{CacheServer, CacheServerConfig, InProcessClient};
use protocol::{
    CACHE_DATABASE_VERSION, CACHE_NETWORK_VERSION, CacheEntriesTraverser, CasKey, CaseSensitivity,
    CompactCasKeyTable, CompactPathTable, DiskStorage, MessageType, NetworkClientExt, Storage,
    message::{
        ConnectRequest, FetchEntriesRequest, FetchEntriesResponse, FetchTableRequest,
        FetchTableResponse, ReportUsedEntryRequest, StoreEntryDoneRequest, StoreEntryRequest,
        StoreEntryResponse, StoreTableRequest,
    },
};
use tempfile::TempDir;

pub const BUCKET: u32 = 1;

/// A server over temporary directories.
pub struct TestServer {
    pub server: Arc<CacheServer>,
    pub storage: Arc<DiskStorage>,
    pub config: CacheServerConfig,
    pub _temp: TempDir,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_config(|root| CacheServerConfig::builder().root_dir(root).build())
    }

    pub fn with_config(config: impl FnOnce(&Path) -> CacheServerConfig) -> Self {
        let temp = tempfile::tempdir().expect("create temp dir");
        let config = config(&temp.path().join("db"));
        let storage = Arc::new(DiskStorage::new(temp.path().join("cas")));
        let server = Arc::new(CacheServer::new(config.clone(), storage.clone()));
        Self {
            server,
            storage,
            config,
            _temp: temp,
        }
    }

    /// A fresh server over the same directories, with its database loaded.
    pub fn restart(&self) -> Result<Arc<CacheServer>> {
        let server = Arc::new(CacheServer::new(self.config.clone(), self.storage.clone()));
        server.load()?;
        Ok(server)
    }

    /// Put `content` into storage, returning its key.
    pub fn blob(&self, content: &[u8]) -> CasKey {
        let key = CasKey::from_buffer(content);
        self.storage.write(&key, content).expect("write blob");
        key
    }

    pub fn connect(&self) -> Result<Session> {
        Session::connect(self.server.clone(), BUCKET)
    }
}

/// One client connection with its own tables for a bucket.
pub struct Session {
    pub client: InProcessClient,
    pub bucket: u32,
    path_table: CompactPathTable,
    cas_table: CompactCasKeyTable,
    path_acked: u32,
    cas_acked: u32,
}

/// An entry as a client sees it after resolving offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedEntry {
    pub id: u32,
    pub inputs: Vec<(String, CasKey)>,
    pub outputs: Vec<(String, CasKey)>,
    pub log_lines: Vec<u8>,
}

impl Session {
    pub fn connect(server: Arc<CacheServer>, bucket: u32) -> Result<Self> {
        let client = InProcessClient::new(server);
        let version = client.request::<_, u32>(
            MessageType::Connect,
            &ConnectRequest::builder()
                .version(CACHE_NETWORK_VERSION)
                .client_name("integration test")
                .build(),
        )?;
        assert_eq!(version, CACHE_NETWORK_VERSION);
        Ok(Self {
            client,
            bucket,
            path_table: CompactPathTable::new(CaseSensitivity::Sensitive),
            cas_table: CompactCasKeyTable::new(),
            path_acked: CompactPathTable::INITIAL_SIZE,
            cas_acked: CompactCasKeyTable::INITIAL_SIZE,
        })
    }

    /// Register a file in the local tables.
    pub fn file(&self, path: &str, key: &CasKey) -> u32 {
        let (path_offset, _) = self.path_table.add(path);
        self.cas_table.add(key, path_offset).0
    }

    /// Push whatever the server hasn't acknowledged yet.
    pub fn push(&mut self) -> Result<()> {
        self.path_acked = self.push_table(
            MessageType::StorePathTable,
            self.path_acked,
            self.path_table.memory_from(self.path_acked),
        )?;
        self.cas_acked = self.push_table(
            MessageType::StoreCasTable,
            self.cas_acked,
            self.cas_table.memory_from(self.cas_acked),
        )?;
        Ok(())
    }

    pub fn push_table(&self, message: MessageType, start: u32, bytes: Vec<u8>) -> Result<u32> {
        self.client.request(
            message,
            &StoreTableRequest::builder()
                .bucket(self.bucket)
                .start(start)
                .bytes(bytes)
                .build(),
        )
    }

    pub fn store(
        &mut self,
        cmd_key: &CasKey,
        inputs: &[(&str, CasKey)],
        outputs: &[(&str, CasKey)],
        log_lines: &[u8],
    ) -> Result<StoreEntryResponse> {
        let inputs = inputs
            .iter()
            .map(|(path, key)| self.file(path, key))
            .collect::<Vec<_>>();
        let outputs = outputs
            .iter()
            .map(|(path, key)| self.file(path, key))
            .collect::<Vec<_>>();
        self.push()?;
        self.client.request(
            MessageType::StoreEntry,
            &StoreEntryRequest::builder()
                .bucket(self.bucket)
                .cmd_key(*cmd_key)
                .inputs(inputs)
                .outputs(outputs)
                .log_lines(log_lines.to_vec())
                .build(),
        )
    }

    /// Store and expect an immediate commit.
    pub fn store_committed(
        &mut self,
        cmd_key: &CasKey,
        inputs: &[(&str, CasKey)],
        outputs: &[(&str, CasKey)],
        log_lines: &[u8],
    ) -> Result<u32> {
        match self.store(cmd_key, inputs, outputs, log_lines)? {
            StoreEntryResponse::Committed { entry_id } => Ok(entry_id),
            StoreEntryResponse::Staged { missing, .. } => bail!("unexpectedly staged, missing {missing:?}"),
        }
    }

    pub fn done(&self, token: u32, success: bool) -> Result<u32> {
        self.client.request(
            MessageType::StoreEntryDone,
            &StoreEntryDoneRequest::builder()
                .token(token)
                .success(success)
                .build(),
        )
    }

    pub fn report_used(&self, cmd_key: &CasKey, entry_id: u32) -> Result<()> {
        self.client.request(
            MessageType::ReportUsedEntry,
            &ReportUsedEntryRequest::builder()
                .bucket(self.bucket)
                .cmd_key(*cmd_key)
                .entry_id(entry_id)
                .build(),
        )
    }

    pub fn fetch_table(&self, message: MessageType, generation: u32, known_size: u32) -> Result<FetchTableResponse> {
        self.client.request(
            message,
            &FetchTableRequest::builder()
                .bucket(self.bucket)
                .generation(generation)
                .known_size(known_size)
                .build(),
        )
    }

    pub fn fetch_raw(&self, cmd_key: &CasKey) -> Result<FetchEntriesResponse> {
        self.client.request(
            MessageType::FetchEntries,
            &FetchEntriesRequest::builder()
                .bucket(self.bucket)
                .cmd_key(*cmd_key)
                .build(),
        )
    }

    /// Fetch the entries for `cmd_key`, most recently used first, resolved
    /// through freshly downloaded server tables.
    pub fn fetch(&self, cmd_key: &CasKey) -> Result<Vec<FetchedEntry>> {
        let response = self.fetch_raw(cmd_key)?;
        if response.entries.is_empty() {
            return Ok(Vec::new());
        }

        let path_table = CompactPathTable::new(CaseSensitivity::Sensitive);
        let paths = self.fetch_table(MessageType::FetchPathTable, 0, 0)?;
        path_table.read_mem(&paths.bytes, false)?;
        let cas_table = CompactCasKeyTable::new();
        let keys = self.fetch_table(MessageType::FetchCasTable, 0, 0)?;
        cas_table.read_mem(&keys.bytes, false)?;

        let resolve = |offset: u32| -> Result<(String, CasKey)> {
            let (path_offset, key) = cas_table.get_path_and_key(offset)?;
            Ok((path_table.get_string(path_offset)?, key))
        };
        CacheEntriesTraverser::new(&response.entries, CACHE_DATABASE_VERSION)?
            .map(|entry| {
                let entry = entry.context("read entry")?;
                let mut inputs = entry.inputs().map(resolve).collect::<Result<Vec<_>>>()?;
                inputs.sort();
                let mut outputs = entry.outputs().map(resolve).collect::<Result<Vec<_>>>()?;
                outputs.sort();
                Ok(FetchedEntry {
                    id: entry.id,
                    inputs,
                    outputs,
                    log_lines: entry.log_lines().to_vec(),
                })
            })
            .collect()
    }
}

/// Owned `(path, key)` pairs, sorted, for comparing with fetched entries.
pub fn pairs(files: &[(&str, CasKey)]) -> Vec<(String, CasKey)> {
    let mut pairs = files
        .iter()
        .map(|(path, key)| (path.to_string(), *key))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
}
