//! Command-line surface: `serve`, `upload`, `download`

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Parser)]
#[command(
    name = "ecpipe",
    author,
    version,
    about = "Push files to a remote erasure-coding archive over TCP and verify their digests"
)]
pub struct Cli {
    /// Verbose logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept uploads into DIR and serve downloads from it
    Serve(ServeArgs),
    /// Send FILE to the server at ADDR
    Upload(UploadArgs),
    /// Fetch and decode a stored artifact from the server at ADDR
    Download(DownloadArgs),
}

/// Daemon options. Unset values fall back to the config file, then built-in defaults.
#[derive(Clone, Debug, Args)]
pub struct ServeArgs {
    /// Directory where artifacts are stored
    pub dir: PathBuf,

    /// Listen port [default: 20000]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Bind host [default: 0.0.0.0]
    #[arg(long)]
    pub bind: Option<String>,

    /// Connection handlers running at once
    #[arg(long)]
    pub workers: Option<usize>,

    /// Accepted connections allowed to wait for a free handler
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// TOML config file (default: ~/.config/ecpipe/ecpipe.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Debug, Args)]
pub struct UploadArgs {
    /// Server address: host, host:port or ecpipe://host:port
    pub addr: String,

    /// Local file to upload
    pub file: PathBuf,

    /// Server port when ADDR has none
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Clone, Debug, Args)]
pub struct DownloadArgs {
    /// Server address: host, host:port or ecpipe://host:port
    pub addr: String,

    /// Stored artifact name, as returned by upload
    pub name: String,

    /// Where to write the decoded file (default: NAME without its artifact suffix)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Server port when ADDR has none
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}
