//! Checksum and hashing utilities

use sha2::{Digest, Sha256};

/// Incremental SHA-256 over the bytes of one transfer
#[derive(Default)]
pub struct StreamDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest
    pub fn finish_hex(self) -> String {
        to_hex(&self.hasher.finalize())
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// Digest comparison that tolerates case differences in hex output of external tools
pub fn digests_match(local: &str, remote: &str) -> bool {
    local.trim().eq_ignore_ascii_case(remote.trim())
}
