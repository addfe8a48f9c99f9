//! Shared protocol constants and message records for the ecpipe transport

use serde::{Deserialize, Serialize};

/// Default TCP port for both `serve` and the client subcommands
pub const DEFAULT_PORT: u16 = 20000;

// Frame header: payload length as big-endian u16
pub const LEN_PREFIX: usize = 2;

// Largest payload a single frame can carry; larger records are rejected, never truncated
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

// Client-side read size when streaming a local file upstream
pub const UPLOAD_CHUNK: usize = 4096;

// Server-side cap on a single socket read while feeding the encoder
pub const SERVER_READ_CHUNK: usize = 64 * 1024;

// On-disk block layout of the archiver: 4 KiB blocks carrying a 16 byte header.
// Download chunks carry exactly one block payload so reads never straddle blocks.
pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_HEADER: usize = 16;
pub const DOWNLOAD_CHUNK: usize = BLOCK_SIZE - BLOCK_HEADER;

/// Separator between the algorithm label and the digest in `ServerReply::hash`
pub const HASH_SEPARATOR: &str = " - ";

/// Fixed suffix of every stored artifact name
pub const ARTIFACT_SUFFIX: &str = ".ec";

// Centralized timeout constants for consistent behavior across server and client
pub mod timeouts {
    // Time a fresh connection gets to deliver its request frame (s)
    pub const REQUEST_SECS: u64 = 30;

    // Longest silence tolerated on the socket mid-stream (s)
    pub const IDLE_SECS: u64 = 60;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Time a client waits for the server's reply after the last byte was sent (s).
    // The encoder finalises only after end-of-data, so this must cover a full encode.
    pub const REPLY_SECS: u64 = 600;
}

/// Operation requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Upload,
    Download,
    List,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Upload => "upload",
            Op::Download => "download",
            Op::List => "list",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single request a client sends at the start of a connection.
///
/// `file_name` is a source path hint for uploads and the stored artifact
/// name for downloads. `file_size` is only meaningful for uploads, where it
/// is the exact number of raw bytes that follow the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub op: Op,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl ClientRequest {
    pub fn upload(file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            op: Op::Upload,
            file_name: file_name.into(),
            file_size: Some(file_size),
        }
    }

    pub fn download(file_name: impl Into<String>) -> Self {
        Self {
            op: Op::Download,
            file_name: file_name.into(),
            file_size: None,
        }
    }

    pub fn list(file_name: impl Into<String>) -> Self {
        Self {
            op: Op::List,
            file_name: file_name.into(),
            file_size: None,
        }
    }

    /// Semantic checks that serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.file_name.is_empty() {
            return Err("file_name must not be empty".to_string());
        }
        if self.op == Op::Upload && self.file_size.is_none() {
            return Err("upload requires file_size".to_string());
        }
        Ok(())
    }
}

/// Server answer to a request.
///
/// On success `hash` has the form `<label> - <digest>`; see [`ServerReply::digest`].
/// Failures set `okay = false` and describe the cause in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReply {
    pub okay: bool,
    pub file_name: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerReply {
    pub fn success(file_name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            okay: true,
            file_name: file_name.into(),
            hash: hash.into(),
            error: None,
        }
    }

    pub fn failure(file_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            okay: false,
            file_name: file_name.into(),
            hash: String::new(),
            error: Some(error.into()),
        }
    }

    /// The comparable content digest embedded after [`HASH_SEPARATOR`]
    pub fn digest(&self) -> Option<&str> {
        digest_component(&self.hash)
    }
}

/// Second component of `hash` split on [`HASH_SEPARATOR`], trimmed
pub fn digest_component(hash: &str) -> Option<&str> {
    hash.split(HASH_SEPARATOR)
        .nth(1)
        .map(str::trim)
        .filter(|d| !d.is_empty())
}

/// `hash` field value for a SHA-256 hex digest computed by ecpipe itself
pub fn labelled_sha256(hex: &str) -> String {
    format!("sha256{}{}", HASH_SEPARATOR, hex)
}
