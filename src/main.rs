use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use std::path::{Path, PathBuf};

use ecpipe::cli::{Cli, Command, DownloadArgs, ServeArgs, UploadArgs};
use ecpipe::config::ServerConfig;
use ecpipe::naming::declared_base;
use ecpipe::net_async::{client, server};
use ecpipe::protocol_core::ensure_dir_exists;
use ecpipe::url::parse_addr;

fn main() -> Result<()> {
    let cli = Cli::parse();
    ecpipe::logger::init(cli.verbose);

    let command = match cli.command {
        Some(c) => c,
        None => {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match command {
        Command::Serve(args) => serve_main(&rt, args),
        Command::Upload(args) => rt.block_on(upload_main(args)),
        Command::Download(args) => rt.block_on(download_main(args)),
    }
}

fn serve_main(rt: &tokio::runtime::Runtime, args: ServeArgs) -> Result<()> {
    let mut config = ServerConfig::load(args.config.as_deref())?;
    config.apply_cli(&args);

    ensure_dir_exists(&args.dir)?;
    if !args.dir.is_dir() {
        bail!("Root path is not a directory: {}", args.dir.display());
    }
    let root = std::fs::canonicalize(&args.dir)
        .with_context(|| format!("Failed to canonicalize root path: {}", args.dir.display()))?;

    let bind = config.bind_addr();
    println!("Starting ecpipe server:");
    println!("  Root: {}", root.display());
    println!("  Bind: {}", bind);
    println!("  Workers: {} (queue {})", config.workers(), config.queue_depth());
    let archiver = config.archiver();
    println!("  Archiver: {}", archiver.program().display());

    let mut ctx = server::ServerContext::new(root, archiver)
        .with_timeouts(config.request_timeout(), config.idle_timeout());
    if config.server.transfer_log {
        ctx = ctx.with_transfer_log();
    }
    if let Some(log) = &ctx.transfer_log {
        println!("  Journal: {}", log.path().display());
    }
    if config.server.bind == "0.0.0.0" || config.server.bind == "::" {
        eprintln!("WARNING: listening on all interfaces; uploads are unauthenticated");
    }
    let limits = server::PoolLimits {
        workers: config.workers(),
        queue_depth: config.queue_depth(),
    };

    rt.block_on(async move {
        let srv = server::Server::bind(&bind, ctx, limits).await?;
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, shutting down (Ctrl-C)...");
                let _ = stop_tx.send(true);
            }
        });
        srv.run(stop_rx).await
    })
}

async fn upload_main(args: UploadArgs) -> Result<()> {
    let addr = parse_addr(&args.addr, args.port)?;
    let outcome = client::upload(&addr, &args.file, !args.no_progress).await?;

    println!("Stored as: {}", outcome.artifact);
    println!("Bytes:     {}", outcome.bytes);
    println!("Local:     sha256 {}", outcome.local_digest);
    println!("Remote:    {}", outcome.remote_hash);
    if !outcome.verified {
        bail!("hash mismatch: server digest does not match local SHA-256");
    }
    println!("Verified");
    Ok(())
}

async fn download_main(args: DownloadArgs) -> Result<()> {
    let addr = parse_addr(&args.addr, args.port)?;
    let output = match args.output.clone() {
        Some(p) => p,
        None => {
            let base = Path::new(&args.name)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| args.name.clone());
            PathBuf::from(declared_base(&base))
        }
    };
    let outcome = client::download(&addr, &args.name, &output, !args.no_progress).await?;

    println!("Wrote:     {}", outcome.output.display());
    println!("Bytes:     {}", outcome.bytes);
    println!("Local:     sha256 {}", outcome.local_digest);
    println!("Remote:    {}", outcome.remote_hash);
    if !outcome.verified {
        bail!(
            "hash mismatch: kept unverified data at {}",
            outcome.output.display()
        );
    }
    println!("Verified");
    Ok(())
}
