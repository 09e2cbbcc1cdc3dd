//! Request and response types exchanged between `stash` and `depot`.
//!
//! Every message is a `MessageType` tag followed by a body encoded with the
//! [`binary`](crate::binary) primitives. Bodies implement [`WireMessage`].

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::{Debug, Display};
use strum::{EnumIter, FromRepr};

use crate::{
    CasKey,
    binary::{BinaryReader, BinaryWriter},
};

/// Discriminant of a request, sent as a single byte.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, FromRepr, EnumIter)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    StorePathTable = 2,
    StoreCasTable = 3,
    StoreEntry = 4,
    StoreEntryDone = 5,
    FetchPathTable = 6,
    FetchCasTable = 7,
    FetchEntries = 8,
    ReportUsedEntry = 9,
    ExecuteCommand = 10,
    RequestShutdown = 11,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        Self::from_repr(value).ok_or_else(|| eyre!("unknown message type {value}"))
    }
}

/// A message body with a binary encoding.
pub trait WireMessage: Sized {
    fn write(&self, writer: &mut BinaryWriter);
    fn read(reader: &mut BinaryReader<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        self.write(&mut writer);
        writer.into_inner()
    }

    /// Decode a body, failing if any bytes are left over.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(bytes);
        let message = Self::read(&mut reader)?;
        if !reader.is_at_end() {
            bail!("{} trailing bytes after message", reader.remaining());
        }
        Ok(message)
    }
}

/// Bodies with no content.
impl WireMessage for () {
    fn write(&self, _: &mut BinaryWriter) {}

    fn read(_: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(())
    }
}

/// Bare `u32` bodies (table sizes, entry ids).
impl WireMessage for u32 {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(*self);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        reader.read_u32()
    }
}

/// Bare string bodies (commands and their output, shutdown reasons).
impl WireMessage for String {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_string(self);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        reader.read_string()
    }
}

/// Opening handshake; the server refuses mismatched versions.
#[derive(Clone, PartialEq, Eq, Debug, Builder)]
#[non_exhaustive]
pub struct ConnectRequest {
    pub version: u32,

    /// Free-form client identification for server logs.
    #[builder(default, into)]
    pub client_name: String,
}

impl WireMessage for ConnectRequest {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.version);
        writer.write_string(&self.client_name);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            version: reader.read_u32().context("read version")?,
            client_name: reader.read_string().context("read client name")?,
        })
    }
}

/// Table bytes pushed by a client into its connection's view of a bucket.
///
/// `start` is the table size the bytes continue from; the server appends
/// them only if it already holds at least `start` bytes and replies with its
/// resulting size.
#[derive(Clone, PartialEq, Eq, Debug, Builder)]
#[non_exhaustive]
pub struct StoreTableRequest {
    pub bucket: u32,
    pub start: u32,
    #[debug("{} bytes", bytes.len())]
    pub bytes: Vec<u8>,
}

impl WireMessage for StoreTableRequest {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.bucket);
        writer.write_u32(self.start);
        writer.write_blob(&self.bytes);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            bucket: reader.read_u32().context("read bucket")?,
            start: reader.read_u32().context("read start")?,
            bytes: reader.read_blob().context("read table bytes")?.to_vec(),
        })
    }
}

/// A build result, with inputs and outputs given as offsets into the
/// client's cas table for the bucket (as previously pushed with
/// [`MessageType::StoreCasTable`]).
#[derive(Clone, PartialEq, Eq, Debug, Builder)]
#[non_exhaustive]
pub struct StoreEntryRequest {
    pub bucket: u32,
    pub cmd_key: CasKey,
    #[builder(default)]
    pub inputs: Vec<u32>,
    #[builder(default)]
    pub outputs: Vec<u32>,
    #[builder(default)]
    #[debug("{} bytes", log_lines.len())]
    pub log_lines: Vec<u8>,
}

impl WireMessage for StoreEntryRequest {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.bucket);
        writer.write_cas_key(&self.cmd_key);
        write_offsets(writer, &self.inputs);
        write_offsets(writer, &self.outputs);
        writer.write_blob(&self.log_lines);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            bucket: reader.read_u32().context("read bucket")?,
            cmd_key: reader.read_cas_key().context("read cmd key")?,
            inputs: read_offsets(reader).context("read inputs")?,
            outputs: read_offsets(reader).context("read outputs")?,
            log_lines: reader.read_blob().context("read log lines")?.to_vec(),
        })
    }
}

/// Outcome of a store.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StoreEntryResponse {
    /// The entry is visible under `entry_id`; nothing else to do.
    Committed { entry_id: u32 },

    /// The server lacks the listed outputs. The client uploads them and then
    /// sends [`StoreEntryDoneRequest`] with `token`.
    Staged { token: u32, missing: Vec<CasKey> },
}

impl WireMessage for StoreEntryResponse {
    fn write(&self, writer: &mut BinaryWriter) {
        match self {
            StoreEntryResponse::Committed { entry_id } => {
                writer.write_u8(0);
                writer.write_u32(*entry_id);
            }
            StoreEntryResponse::Staged { token, missing } => {
                writer.write_u8(1);
                writer.write_u32(*token);
                writer.write_7bit(missing.len() as u64);
                for key in missing {
                    writer.write_cas_key(key);
                }
            }
        }
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        match reader.read_u8()? {
            0 => Ok(StoreEntryResponse::Committed {
                entry_id: reader.read_u32().context("read entry id")?,
            }),
            1 => {
                let token = reader.read_u32().context("read token")?;
                let count = reader.read_7bit().context("read missing count")?;
                let missing = (0..count)
                    .map(|_| reader.read_cas_key())
                    .collect::<Result<Vec<_>>>()
                    .context("read missing keys")?;
                Ok(StoreEntryResponse::Staged { token, missing })
            }
            other => bail!("invalid store entry response tag {other}"),
        }
    }
}

/// Finish a staged store. With `success == false` the staged entry is
/// discarded.
#[derive(Clone, PartialEq, Eq, Debug, Builder)]
#[non_exhaustive]
pub struct StoreEntryDoneRequest {
    pub token: u32,
    pub success: bool,
}

impl WireMessage for StoreEntryDoneRequest {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.token);
        writer.write_bool(self.success);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            token: reader.read_u32().context("read token")?,
            success: reader.read_bool().context("read success")?,
        })
    }
}

/// Ask for the bytes of a bucket table past `known_size`.
#[derive(Clone, PartialEq, Eq, Debug, Builder)]
#[non_exhaustive]
pub struct FetchTableRequest {
    pub bucket: u32,

    /// Generation of the tables the client already holds.
    pub generation: u32,
    pub known_size: u32,
}

impl WireMessage for FetchTableRequest {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.bucket);
        writer.write_u32(self.generation);
        writer.write_u32(self.known_size);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            bucket: reader.read_u32().context("read bucket")?,
            generation: reader.read_u32().context("read generation")?,
            known_size: reader.read_u32().context("read known size")?,
        })
    }
}

/// Table bytes from the server.
///
/// When `generation` differs from the one requested the tables were rebuilt
/// since the client last synced: `bytes` then start at the beginning of the
/// table and the client must discard its copy first.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FetchTableResponse {
    pub generation: u32,
    #[debug("{} bytes", bytes.len())]
    pub bytes: Vec<u8>,
}

impl WireMessage for FetchTableResponse {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.generation);
        writer.write_blob(&self.bytes);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            generation: reader.read_u32().context("read generation")?,
            bytes: reader.read_blob().context("read table bytes")?.to_vec(),
        })
    }
}

/// Look up every entry stored for a command.
#[derive(Clone, PartialEq, Eq, Debug, Builder)]
#[non_exhaustive]
pub struct FetchEntriesRequest {
    pub bucket: u32,
    pub cmd_key: CasKey,
}

impl WireMessage for FetchEntriesRequest {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.bucket);
        writer.write_cas_key(&self.cmd_key);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            bucket: reader.read_u32().context("read bucket")?,
            cmd_key: reader.read_cas_key().context("read cmd key")?,
        })
    }
}

/// Entries for a command, with the table state needed to resolve them.
///
/// `entries` is a serialized [`CacheEntries`](crate::CacheEntries) in the
/// current database layout, empty if the command is unknown. Walk it with
/// [`CacheEntriesTraverser`](crate::entry::CacheEntriesTraverser).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FetchEntriesResponse {
    pub generation: u32,
    pub path_table_size: u32,
    pub cas_table_size: u32,
    #[debug("{} bytes", entries.len())]
    pub entries: Vec<u8>,
}

impl WireMessage for FetchEntriesResponse {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.generation);
        writer.write_u32(self.path_table_size);
        writer.write_u32(self.cas_table_size);
        writer.write_blob(&self.entries);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            generation: reader.read_u32().context("read generation")?,
            path_table_size: reader.read_u32().context("read path table size")?,
            cas_table_size: reader.read_u32().context("read cas table size")?,
            entries: reader.read_blob().context("read entries")?.to_vec(),
        })
    }
}

/// The client used this entry for a hit.
#[derive(Clone, PartialEq, Eq, Debug, Builder)]
#[non_exhaustive]
pub struct ReportUsedEntryRequest {
    pub bucket: u32,
    pub cmd_key: CasKey,
    pub entry_id: u32,
}

impl WireMessage for ReportUsedEntryRequest {
    fn write(&self, writer: &mut BinaryWriter) {
        writer.write_u32(self.bucket);
        writer.write_cas_key(&self.cmd_key);
        writer.write_u32(self.entry_id);
    }

    fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            bucket: reader.read_u32().context("read bucket")?,
            cmd_key: reader.read_cas_key().context("read cmd key")?,
            entry_id: reader.read_u32().context("read entry id")?,
        })
    }
}

fn write_offsets(writer: &mut BinaryWriter, offsets: &[u32]) {
    writer.write_7bit(offsets.len() as u64);
    for offset in offsets {
        writer.write_7bit(u64::from(*offset));
    }
}

fn read_offsets(reader: &mut BinaryReader<'_>) -> Result<Vec<u32>> {
    let count = reader.read_len()?;
    (0..count).map(|_| reader.read_7bit_u32()).collect()
}
