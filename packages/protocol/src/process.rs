//! Description of a cacheable process and the log it produced.

use bon::Builder;
use color_eyre::{Result, eyre::eyre};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::binary::{BinaryReader, BinaryWriter};

/// How a process was started; the input to the command key.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ProcessStartInfo {
    /// Path to the executable.
    #[builder(into)]
    pub application: String,

    /// Command line arguments, not including the application.
    #[builder(default, into)]
    pub arguments: Vec<String>,

    /// Working directory the process runs in.
    #[builder(into)]
    pub working_dir: String,

    /// Human readable description used in logs (for example the file being
    /// compiled). Not part of the command key.
    #[builder(default, into)]
    pub description: String,
}

/// Severity of a captured log line.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize, FromRepr)]
#[repr(u8)]
pub enum LogLineKind {
    Info = 0,
    Warning = 1,
    Error = 2,
}

/// A line of output captured from a process, replayed on a cache hit.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{text}")]
pub struct ProcessLogLine {
    pub text: String,
    pub kind: LogLineKind,
}

impl ProcessLogLine {
    pub fn new(text: impl Into<String>, kind: LogLineKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(text, LogLineKind::Info)
    }
}

/// Encode log lines as `varint count, (varint len, utf8, u8 kind)*`.
///
/// An empty slice encodes to an empty blob rather than a zero count so that
/// "no log" is cheap to store and compare.
pub fn encode_log_lines(lines: &[ProcessLogLine]) -> Vec<u8> {
    if lines.is_empty() {
        return Vec::new();
    }
    let mut writer = BinaryWriter::new();
    writer.write_7bit(lines.len() as u64);
    for line in lines {
        writer.write_string(&line.text);
        writer.write_u8(line.kind as u8);
    }
    writer.into_inner()
}

/// Decode a blob produced by [`encode_log_lines`].
pub fn decode_log_lines(bytes: &[u8]) -> Result<Vec<ProcessLogLine>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = BinaryReader::new(bytes);
    let count = reader.read_7bit()?;
    let mut lines = Vec::new();
    for _ in 0..count {
        let text = reader.read_string()?;
        let kind = reader.read_u8()?;
        let kind = LogLineKind::from_repr(kind).ok_or_else(|| eyre!("invalid log line kind {kind}"))?;
        lines.push(ProcessLogLine { text, kind });
    }
    Ok(lines)
}
