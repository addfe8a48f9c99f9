//! Server configuration: built-in defaults, then a TOML file, then CLI flags

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archiver::ProcessArchiver;
use crate::cli::ServeArgs;
use crate::protocol::{timeouts, DEFAULT_PORT};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub archiver: ArchiverSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    pub workers: usize,
    pub queue_depth: usize,
    pub request_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub transfer_log: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            workers: num_cpus::get() * 4,
            queue_depth: 64,
            request_timeout_secs: timeouts::REQUEST_SECS,
            idle_timeout_secs: timeouts::IDLE_SECS,
            transfer_log: true,
        }
    }
}

/// External tool invocation. `{id}`, `{output}` and `{input}` are substituted per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverSettings {
    pub program: String,
    pub encode_args: Vec<String>,
    pub decode_args: Vec<String>,
}

impl Default for ArchiverSettings {
    fn default() -> Self {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect();
        ArchiverSettings {
            program: "ec-archive".to_string(),
            encode_args: args(&["encode", "--id", "{id}", "--output", "{output}", "--json"]),
            decode_args: args(&["decode", "--input", "{input}"]),
        }
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("ecpipe");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("ecpipe");
    }
    PathBuf::from(".ecpipe")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("ecpipe.toml")
}

impl ServerConfig {
    /// An explicit path must exist; the default path is optional
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(p) => Self::from_file(p),
            None => {
                let p = default_config_path();
                if p.exists() {
                    Self::from_file(&p)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }

    pub fn apply_cli(&mut self, args: &ServeArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(ref bind) = args.bind {
            self.server.bind = bind.clone();
        }
        if let Some(workers) = args.workers {
            self.server.workers = workers;
        }
        if let Some(depth) = args.queue_depth {
            self.server.queue_depth = depth;
        }
    }

    pub fn bind_addr(&self) -> String {
        let host = &self.server.bind;
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.server.port)
        } else {
            format!("{}:{}", host, self.server.port)
        }
    }

    pub fn workers(&self) -> usize {
        self.server.workers.max(1)
    }

    pub fn queue_depth(&self) -> usize {
        self.server.queue_depth.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.idle_timeout_secs.max(1))
    }

    pub fn archiver(&self) -> ProcessArchiver {
        ProcessArchiver::new(
            &self.archiver.program,
            self.archiver.encode_args.clone(),
            self.archiver.decode_args.clone(),
        )
    }
}
