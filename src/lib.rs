//! ecpipe library
//!
//! Push files over TCP into an external erasure-coding archiver, and pull
//! them back out, with end-to-end SHA-256 verification.

pub mod archiver;
pub mod bridge;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod log;
pub mod logger;
pub mod naming;
pub mod net_async;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod url;
