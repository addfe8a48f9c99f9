//! Append-only JSONL journal of transfers kept under the server root.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::protocol::Op;

pub const TRANSFER_LOG_NAME: &str = ".ecpipe_transfers.jsonl";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Truncated,
    Rejected,
    Failed,
    Interrupted,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub op: Op,
    pub peer: String,
    pub file_name: String,
    pub artifact: Option<String>,
    pub bytes: u64,
    pub status: TransferStatus,
    pub hash: Option<String>,
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn new(op: Op, peer: &str, file_name: &str, status: TransferStatus) -> Self {
        TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            op,
            peer: peer.to_string(),
            file_name: file_name.to_string(),
            artifact: None,
            bytes: 0,
            status,
            hash: None,
            error: None,
        }
    }
}

/// Append-only JSONL journal of exchanges handled by the server
pub struct TransferLog {
    log_file_path: PathBuf,
    // Serializes appends from concurrent handlers so lines never interleave
    write_lock: Mutex<()>,
}

impl TransferLog {
    pub fn new(root: &Path) -> Self {
        TransferLog {
            log_file_path: root.join(TRANSFER_LOG_NAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer log file")?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
