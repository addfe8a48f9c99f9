//! External erasure-coding tool, driven as a byte-stream pipeline
//!
//! The server never looks inside the archive format. An [`Encoder`] is a
//! byte sink that yields an [`EncodeReport`] once its input is closed; a
//! [`Decoder`] is a byte source. Both are owned handles: dropping one
//! terminates the underlying process, so every early return releases it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Final machine-readable result of an encode run
#[derive(Debug, Clone, Deserialize)]
pub struct EncodeReport {
    pub stats: EncodeStats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodeStats {
    /// `<label> - <digest>`, passed through to the client untouched
    pub hash: String,
}

impl EncodeReport {
    /// Accepts either a single JSON document or line-oriented output whose
    /// last parseable line is the report.
    pub fn parse(stdout: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(stdout);
        if let Ok(report) = serde_json::from_str(text.trim()) {
            return Ok(report);
        }
        for line in text.lines().rev().map(str::trim).filter(|l| !l.is_empty()) {
            if let Ok(report) = serde_json::from_str(line) {
                return Ok(report);
            }
        }
        bail!("encoder produced no result containing stats.hash")
    }
}

pub trait Encoder: Send {
    fn input(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin);

    /// Close the input (end-of-data) and wait for the report
    fn finish(self) -> impl Future<Output = Result<EncodeReport>> + Send;
}

pub trait Decoder: Send {
    fn output(&mut self) -> &mut (dyn AsyncRead + Send + Unpin);

    /// Wait for the process to exit once its output has been drained
    fn finish(self) -> impl Future<Output = Result<()>> + Send;
}

/// Factory for encoder/decoder handles, shared by all connection handlers
pub trait Archiver: Send + Sync + 'static {
    type Encoder: Encoder + 'static;
    type Decoder: Decoder + 'static;

    /// Start encoding into `output`; `id` is unique per invocation
    fn encoder(&self, id: &str, output: &Path) -> Result<Self::Encoder>;

    fn decoder(&self, input: &Path) -> Result<Self::Decoder>;
}

/// Runs a configured program per transfer.
///
/// Arguments may contain `{id}`, `{output}` (encode) and `{input}` (decode)
/// placeholders.
#[derive(Debug, Clone)]
pub struct ProcessArchiver {
    program: PathBuf,
    encode_args: Vec<String>,
    decode_args: Vec<String>,
}

impl ProcessArchiver {
    pub fn new(program: impl Into<PathBuf>, encode_args: Vec<String>, decode_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            encode_args,
            decode_args,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, args: &[String], vars: &[(&str, &str)]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args.iter().map(|a| expand_placeholders(a, vars)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Archiver for ProcessArchiver {
    type Encoder = ProcessEncoder;
    type Decoder = ProcessDecoder;

    fn encoder(&self, id: &str, output: &Path) -> Result<ProcessEncoder> {
        let output = output.to_string_lossy();
        let mut child = self
            .command(&self.encode_args, &[("id", id), ("output", &*output)])
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn encoder {}", self.program.display()))?;
        let stdin = child.stdin.take().context("encoder stdin not captured")?;
        let stdout = child.stdout.take().context("encoder stdout not captured")?;
        let stderr = child.stderr.take().context("encoder stderr not captured")?;
        tracing::debug!(pid = ?child.id(), %id, "encoder started");
        Ok(ProcessEncoder {
            child,
            stdin,
            stdout: drain(stdout),
            stderr: drain(stderr),
        })
    }

    fn decoder(&self, input: &Path) -> Result<ProcessDecoder> {
        let input = input.to_string_lossy();
        let mut child = self
            .command(&self.decode_args, &[("input", &*input)])
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn decoder {}", self.program.display()))?;
        let stdout = child.stdout.take().context("decoder stdout not captured")?;
        let stderr = child.stderr.take().context("decoder stderr not captured")?;
        tracing::debug!(pid = ?child.id(), "decoder started");
        Ok(ProcessDecoder {
            child,
            stdout,
            stderr: drain(stderr),
        })
    }
}

pub struct ProcessEncoder {
    child: Child,
    stdin: ChildStdin,
    // Read concurrently so a chatty encoder never blocks on a full pipe while we feed stdin
    stdout: JoinHandle<io::Result<Vec<u8>>>,
    stderr: JoinHandle<io::Result<Vec<u8>>>,
}

impl Encoder for ProcessEncoder {
    fn input(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.stdin
    }

    fn finish(self) -> impl Future<Output = Result<EncodeReport>> + Send {
        async move {
            let ProcessEncoder {
                mut child,
                stdin,
                stdout,
                stderr,
            } = self;
            drop(stdin);

            let status = child.wait().await.context("wait for encoder")?;
            let out = stdout
                .await
                .context("encoder stdout task")?
                .context("read encoder stdout")?;
            let err = stderr.await.ok().and_then(|r| r.ok()).unwrap_or_default();
            if !status.success() {
                bail!(
                    "encoder exited with {}: {}",
                    status,
                    String::from_utf8_lossy(&err).trim()
                );
            }
            EncodeReport::parse(&out)
        }
    }
}

pub struct ProcessDecoder {
    child: Child,
    stdout: ChildStdout,
    stderr: JoinHandle<io::Result<Vec<u8>>>,
}

impl Decoder for ProcessDecoder {
    fn output(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.stdout
    }

    fn finish(self) -> impl Future<Output = Result<()>> + Send {
        async move {
            let ProcessDecoder {
                mut child,
                stdout,
                stderr,
            } = self;
            drop(stdout);

            let status = child.wait().await.context("wait for decoder")?;
            let err = stderr.await.ok().and_then(|r| r.ok()).unwrap_or_default();
            if !status.success() {
                bail!(
                    "decoder exited with {}: {}",
                    status,
                    String::from_utf8_lossy(&err).trim()
                );
            }
            Ok(())
        }
    }
}

fn drain<R>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

fn expand_placeholders(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = arg.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}
