//! Async (Tokio) transport for the ecpipe server and client.
//!
//! One connection carries exactly one exchange: a request frame, then either
//! an upload body and a single reply, or a download ack, data chunks and a
//! trailer.

use anyhow::{anyhow, bail, Context, Result};
use std::time::Instant;

pub mod server {
    use super::*;
    use std::net::SocketAddr;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, watch, Mutex};
    use tokio::task::JoinSet;
    use tokio::time::{timeout, Duration};
    use tracing::{debug, error, info, info_span, warn, Instrument};

    use crate::archiver::{Archiver, Decoder, Encoder};
    use crate::bridge::{cancelled, pump_download, pump_upload, UploadEnd};
    use crate::error::{ProtocolError, TransferError};
    use crate::log::{TransferLog, TransferLogEntry, TransferStatus, TRANSFER_LOG_NAME};
    use crate::naming::{artifact_name, Clock, SystemClock, TokenSource, UuidTokens};
    use crate::protocol::{labelled_sha256, timeouts, ClientRequest, Op, ServerReply};
    use crate::protocol_core::{normalize_under_root, read_message, write_chunk, write_message};

    /// State shared by every connection handler
    pub struct ServerContext<A: Archiver> {
        pub root: PathBuf,
        pub archiver: A,
        pub clock: Arc<dyn Clock>,
        pub tokens: Arc<dyn TokenSource>,
        pub transfer_log: Option<Arc<TransferLog>>,
        pub request_timeout: Duration,
        pub idle_timeout: Duration,
    }

    impl<A: Archiver> ServerContext<A> {
        pub fn new(root: PathBuf, archiver: A) -> Self {
            ServerContext {
                root,
                archiver,
                clock: Arc::new(SystemClock),
                tokens: Arc::new(UuidTokens),
                transfer_log: None,
                request_timeout: Duration::from_secs(timeouts::REQUEST_SECS),
                idle_timeout: Duration::from_secs(timeouts::IDLE_SECS),
            }
        }

        pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        pub fn with_tokens(mut self, tokens: Arc<dyn TokenSource>) -> Self {
            self.tokens = tokens;
            self
        }

        /// Journal every exchange to `<root>/.ecpipe_transfers.jsonl`
        pub fn with_transfer_log(mut self) -> Self {
            self.transfer_log = Some(Arc::new(TransferLog::new(&self.root)));
            self
        }

        pub fn with_timeouts(mut self, request: Duration, idle: Duration) -> Self {
            self.request_timeout = request;
            self.idle_timeout = idle;
            self
        }

        /// Append to the journal off the async workers; file I/O blocks
        pub async fn journal(&self, entry: &TransferLogEntry) {
            let Some(log) = &self.transfer_log else {
                return;
            };
            let log = Arc::clone(log);
            let entry = entry.clone();
            match tokio::task::spawn_blocking(move || log.add_entry(&entry)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("transfer log append failed: {:#}", e),
                Err(e) => warn!("transfer log task failed: {}", e),
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct PoolLimits {
        pub workers: usize,
        pub queue_depth: usize,
    }

    pub struct Server<A: Archiver> {
        listener: TcpListener,
        ctx: Arc<ServerContext<A>>,
        limits: PoolLimits,
    }

    impl<A: Archiver> Server<A> {
        pub async fn bind(bind: &str, ctx: ServerContext<A>, limits: PoolLimits) -> Result<Self> {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("bind {}", bind))?;
            Ok(Server {
                listener,
                ctx: Arc::new(ctx),
                limits: PoolLimits {
                    workers: limits.workers.max(1),
                    queue_depth: limits.queue_depth.max(1),
                },
            })
        }

        pub fn local_addr(&self) -> Result<SocketAddr> {
            Ok(self.listener.local_addr()?)
        }

        /// Accept until `shutdown` flips to true, then stop accepting and wait
        /// for in-flight connections (which observe the same signal) to end.
        ///
        /// Accepted connections go through a bounded queue to a fixed set of
        /// workers; when the queue is full the accept loop waits.
        pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
            let Server {
                listener,
                ctx,
                limits,
            } = self;
            let (tx, rx) = mpsc::channel::<(TcpStream, SocketAddr)>(limits.queue_depth);
            let rx = Arc::new(Mutex::new(rx));

            let mut workers = JoinSet::new();
            for id in 0..limits.workers {
                workers.spawn(worker_loop(
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&ctx),
                    shutdown.clone(),
                ));
            }
            info!(
                addr = %listener.local_addr()?,
                root = %ctx.root.display(),
                workers = limits.workers,
                queue_depth = limits.queue_depth,
                "listening"
            );

            loop {
                let accepted = tokio::select! {
                    _ = cancelled(&mut shutdown) => break,
                    res = listener.accept() => res,
                };
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                debug!(%peer, "connection queued");
                tokio::select! {
                    _ = cancelled(&mut shutdown) => break,
                    res = tx.send((stream, peer)) => {
                        if res.is_err() {
                            error!("all workers exited; stopping accept loop");
                            break;
                        }
                    }
                }
            }

            drop(tx);
            drop(listener);
            info!("no longer accepting; waiting for active connections");
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    error!("worker task failed: {}", e);
                }
            }
            info!("server stopped");
            Ok(())
        }
    }

    async fn worker_loop<A: Archiver>(
        id: usize,
        queue: Arc<Mutex<mpsc::Receiver<(TcpStream, SocketAddr)>>>,
        ctx: Arc<ServerContext<A>>,
        shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = queue.lock().await.recv().await;
            let Some((stream, peer)) = next else {
                break;
            };
            // Own task so a panicking handler takes down only its connection
            let task = tokio::spawn(
                handle_conn(stream, peer.to_string(), Arc::clone(&ctx), shutdown.clone())
                    .instrument(info_span!("conn", %peer)),
            );
            if let Err(e) = task.await {
                error!(worker = id, %peer, "connection handler panicked: {}", e);
            }
        }
        debug!(worker = id, "worker exiting");
    }

    /// Serve one exchange on `stream`. Never fails: problems are logged,
    /// answered with a failure reply where the protocol allows, and the
    /// connection is closed.
    pub async fn handle_conn<A, S>(
        mut stream: S,
        peer: String,
        ctx: Arc<ServerContext<A>>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        A: Archiver,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if *shutdown.borrow() {
            debug!("shutting down; dropping queued connection");
            return;
        }
        let started = Instant::now();
        match serve_exchange(&mut stream, &peer, &ctx, &mut shutdown).await {
            Ok(()) => debug!(elapsed_ms = started.elapsed().as_millis() as u64, "connection done"),
            Err(e) => warn!("connection ended: {:#}", e),
        }
        let _ = stream.shutdown().await;
    }

    async fn read_request_timed<S>(stream: &mut S, wait: Duration) -> Result<ClientRequest, Option<ProtocolError>>
    where
        S: AsyncRead + Unpin,
    {
        match timeout(wait, read_message::<_, ClientRequest>(stream)).await {
            Ok(Ok(req)) => Ok(req),
            Ok(Err(e)) => Err(Some(e)),
            Err(_) => Err(None),
        }
    }

    async fn write_reply_timed<S>(stream: &mut S, reply: &ServerReply, wait: Duration) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match timeout(wait, write_message(stream, reply)).await {
            Ok(res) => res.context("send reply"),
            Err(_) => bail!("reply write timeout ({:?})", wait),
        }
    }

    // Read and drop an upload body so the peer is reading when our reply lands
    async fn discard_body<S>(stream: &mut S, len: u64, idle: Duration, shutdown: &mut watch::Receiver<bool>)
    where
        S: AsyncRead + Unpin,
    {
        if len == 0 {
            return;
        }
        match pump_upload(stream, &mut tokio::io::sink(), len, idle, shutdown).await {
            Ok(p) if !p.is_complete() => debug!("discarded {} of {} body bytes", p.received, len),
            Ok(_) => {}
            Err(e) => debug!("stopped discarding body: {}", e),
        }
    }

    async fn reject<A, S>(stream: &mut S, ctx: &ServerContext<A>, mut entry: TransferLogEntry, reason: &str)
    where
        A: Archiver,
        S: AsyncWrite + Unpin,
    {
        info!(file_name = %entry.file_name, "rejected: {}", reason);
        let reply = ServerReply::failure(entry.file_name.clone(), reason);
        entry.status = TransferStatus::Rejected;
        entry.error = Some(reason.to_string());
        ctx.journal(&entry).await;
        if let Err(e) = write_reply_timed(stream, &reply, ctx.idle_timeout).await {
            debug!("could not deliver rejection: {:#}", e);
        }
    }

    async fn serve_exchange<A, S>(
        stream: &mut S,
        peer: &str,
        ctx: &ServerContext<A>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()>
    where
        A: Archiver,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let read = tokio::select! {
            _ = cancelled(shutdown) => bail!("shutdown before request arrived"),
            res = read_request_timed(stream, ctx.request_timeout) => res,
        };
        let req = match read {
            Ok(req) => req,
            Err(None) => bail!("no request within {:?}", ctx.request_timeout),
            Err(Some(ProtocolError::Closed)) => {
                debug!("peer closed without sending a request");
                return Ok(());
            }
            Err(Some(e)) if e.is_reply_possible() => {
                // No op to journal under; the reply and the log line are enough
                let reply = ServerReply::failure("", format!("bad request: {}", e));
                if let Err(werr) = write_reply_timed(stream, &reply, ctx.idle_timeout).await {
                    debug!("could not deliver rejection: {:#}", werr);
                }
                return Err(anyhow!(e)).context("bad request");
            }
            Err(Some(e)) => return Err(anyhow!(e)).context("read request"),
        };

        let entry = TransferLogEntry::new(req.op, peer, &req.file_name, TransferStatus::Failed);
        if let Err(reason) = req.validate() {
            if req.op == Op::Upload {
                discard_body(stream, req.file_size.unwrap_or(0), ctx.idle_timeout, shutdown).await;
            }
            reject(stream, ctx, entry, &reason).await;
            bail!("invalid request: {}", reason);
        }
        info!(op = %req.op, file_name = %req.file_name, size = ?req.file_size, "request");

        match req.op {
            Op::Upload => handle_upload(stream, ctx, shutdown, &req, entry).await,
            Op::Download => handle_download(stream, ctx, shutdown, &req, entry).await,
            Op::List => {
                reject(stream, ctx, entry, "operation 'list' is not supported").await;
                Ok(())
            }
        }
    }

    async fn handle_upload<A, S>(
        stream: &mut S,
        ctx: &ServerContext<A>,
        shutdown: &mut watch::Receiver<bool>,
        req: &ClientRequest,
        mut entry: TransferLogEntry,
    ) -> Result<()>
    where
        A: Archiver,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let declared = req.file_size.unwrap_or(0);
        let artifact = artifact_name(&req.file_name, ctx.clock.as_ref(), ctx.tokens.as_ref());
        let encoder_id = ctx.tokens.token();
        entry.artifact = Some(artifact.clone());

        let mut encoder = match ctx.archiver.encoder(&encoder_id, &ctx.root.join(&artifact)) {
            Ok(enc) => enc,
            Err(e) => {
                entry.error = Some(format!("{:#}", e));
                ctx.journal(&entry).await;
                discard_body(stream, declared, ctx.idle_timeout, shutdown).await;
                let reply = ServerReply::failure(&artifact, "encoder unavailable");
                let _ = write_reply_timed(stream, &reply, ctx.idle_timeout).await;
                return Err(e.context("start encoder"));
            }
        };
        debug!(%artifact, id = %encoder_id, declared, "streaming into encoder");

        let started = Instant::now();
        let pumped = match pump_upload(stream, encoder.input(), declared, ctx.idle_timeout, shutdown).await {
            Ok(p) => p,
            Err(e) => {
                entry.status = TransferStatus::Interrupted;
                ctx.journal(&entry).await;
                bail!("upload of {} interrupted: {}", artifact, e);
            }
        };
        entry.bytes = pumped.received;
        let input_failure = match &pumped.end {
            UploadEnd::Complete => None,
            UploadEnd::PeerClosed => {
                warn!("peer closed after {} of {} bytes", pumped.received, declared);
                None
            }
            UploadEnd::ReadFailed(e) => {
                warn!("read failed after {} of {} bytes: {}", pumped.received, declared, e);
                None
            }
            UploadEnd::IdleTimeout => {
                warn!("peer idle after {} of {} bytes", pumped.received, declared);
                None
            }
            UploadEnd::SinkFailed(e) => {
                warn!("encoder stopped reading after {} of {} bytes: {}", pumped.received, declared, e);
                Some(format!("encoder input failed: {}", e))
            }
        };
        if input_failure.is_some() {
            discard_body(stream, declared - pumped.received, ctx.idle_timeout, shutdown).await;
        }

        // Finalise even a short stream so the tool closes out what it has,
        // and so a tool that quit early reports why
        let finished = tokio::select! {
            _ = cancelled(shutdown) => {
                entry.status = TransferStatus::Interrupted;
                ctx.journal(&entry).await;
                bail!("encoder for {} interrupted by shutdown", artifact);
            }
            res = encoder.finish() => res,
        };
        let failure = match (finished, input_failure) {
            (Ok(report), None) => Ok(report),
            (Err(e), _) => Err(format!("encoder failed: {:#}", e)),
            (Ok(_), Some(msg)) => Err(msg),
        };
        let report = match failure {
            Ok(r) => r,
            Err(msg) => {
                entry.error = Some(msg.clone());
                ctx.journal(&entry).await;
                let reply = ServerReply::failure(&artifact, msg.clone());
                let _ = write_reply_timed(stream, &reply, ctx.idle_timeout).await;
                bail!(msg);
            }
        };
        let hash = report.stats.hash;
        entry.hash = Some(hash.clone());

        if !pumped.is_complete() {
            let msg = format!("short upload: got {} of {} bytes", pumped.received, declared);
            entry.status = TransferStatus::Truncated;
            entry.error = Some(msg.clone());
            ctx.journal(&entry).await;
            let reply = ServerReply {
                okay: false,
                file_name: artifact,
                hash,
                error: Some(msg.clone()),
            };
            // The peer is usually gone already
            let _ = write_reply_timed(stream, &reply, ctx.idle_timeout).await;
            bail!(msg);
        }

        entry.status = TransferStatus::Completed;
        ctx.journal(&entry).await;
        info!(
            %artifact,
            bytes = pumped.received,
            elapsed_ms = started.elapsed().as_millis() as u64,
            %hash,
            "upload stored"
        );
        write_reply_timed(stream, &ServerReply::success(artifact, hash), ctx.idle_timeout).await
    }

    async fn handle_download<A, S>(
        stream: &mut S,
        ctx: &ServerContext<A>,
        shutdown: &mut watch::Receiver<bool>,
        req: &ClientRequest,
        mut entry: TransferLogEntry,
    ) -> Result<()>
    where
        A: Archiver,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let name = req.file_name.as_str();
        let path = match resolve_artifact(&ctx.root, name) {
            Some(p) => p,
            None => {
                reject(stream, ctx, entry, &format!("no such artifact: {}", name)).await;
                return Ok(());
            }
        };
        entry.artifact = Some(name.to_string());

        let mut decoder = match ctx.archiver.decoder(&path) {
            Ok(dec) => dec,
            Err(e) => {
                entry.error = Some(format!("{:#}", e));
                ctx.journal(&entry).await;
                let reply = ServerReply::failure(name, "decoder unavailable");
                let _ = write_reply_timed(stream, &reply, ctx.idle_timeout).await;
                return Err(e.context("start decoder"));
            }
        };
        write_reply_timed(stream, &ServerReply::success(name, ""), ctx.idle_timeout)
            .await
            .context("send download ack")?;

        let streamed = pump_download(decoder.output(), stream, ctx.idle_timeout, shutdown).await;
        let (bytes, sha256, source_err) = match streamed {
            Ok(s) => (s.bytes, s.sha256, None),
            Err(TransferError::Source(e)) => {
                // Close the chunk stream so the client reads the failure trailer
                let _ = timeout(ctx.idle_timeout, write_chunk(stream, &[])).await;
                (0, String::new(), Some(TransferError::Source(e).to_string()))
            }
            Err(TransferError::Cancelled) => {
                entry.status = TransferStatus::Interrupted;
                ctx.journal(&entry).await;
                bail!("download of {} interrupted by shutdown", name);
            }
            Err(e) => {
                entry.error = Some(e.to_string());
                ctx.journal(&entry).await;
                return Err(anyhow!(e)).context("stream to peer");
            }
        };
        entry.bytes = bytes;

        let finished = tokio::select! {
            _ = cancelled(shutdown) => {
                entry.status = TransferStatus::Interrupted;
                ctx.journal(&entry).await;
                bail!("decoder for {} interrupted by shutdown", name);
            }
            res = decoder.finish() => res,
        };
        let failure = match (source_err, finished) {
            (Some(msg), _) => Some(msg),
            (None, Err(e)) => Some(format!("decoder failed: {:#}", e)),
            (None, Ok(())) => None,
        };

        let trailer = match failure {
            Some(msg) => {
                entry.error = Some(msg.clone());
                ctx.journal(&entry).await;
                warn!("download of {} failed: {}", name, msg);
                ServerReply::failure(name, msg)
            }
            None => {
                let hash = labelled_sha256(&sha256);
                entry.status = TransferStatus::Completed;
                entry.hash = Some(hash.clone());
                ctx.journal(&entry).await;
                info!(artifact = %name, bytes, "download served");
                ServerReply::success(name, hash)
            }
        };
        write_reply_timed(stream, &trailer, ctx.idle_timeout).await
    }

    /// Artifacts are addressed by name relative to the root; anything that
    /// escapes it, or names the journal, does not exist.
    fn resolve_artifact(root: &Path, name: &str) -> Option<PathBuf> {
        if Path::new(name).file_name().map(|f| f == TRANSFER_LOG_NAME).unwrap_or(false) {
            return None;
        }
        normalize_under_root(root, Path::new(name))
            .ok()
            .filter(|p| p.exists())
    }

}

pub mod client {
    use super::*;
    use std::ffi::OsString;
    use std::path::{Path, PathBuf};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{timeout, Duration};

    use crate::checksum::{digests_match, StreamDigest};
    use crate::progress::TransferProgress;
    use crate::protocol::{timeouts, ClientRequest, ServerReply, UPLOAD_CHUNK};
    use crate::protocol_core::{read_chunk, read_message, write_message};
    use crate::url::RemoteAddr;

    #[derive(Debug, Clone)]
    pub struct UploadOutcome {
        /// Name the server stored the upload under
        pub artifact: String,
        pub bytes: u64,
        pub local_digest: String,
        pub remote_hash: String,
        pub verified: bool,
    }

    #[derive(Debug, Clone)]
    pub struct DownloadOutcome {
        pub artifact: String,
        /// Where the bytes ended up; a `.part` file when verification failed
        pub output: PathBuf,
        pub bytes: u64,
        pub local_digest: String,
        pub remote_hash: String,
        pub verified: bool,
    }

    fn reply_timeout() -> Duration {
        Duration::from_secs(timeouts::REPLY_SECS)
    }

    async fn write_all_timed(stream: &mut TcpStream, buf: &[u8], wait: Duration) -> Result<()> {
        match timeout(wait, stream.write_all(buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => bail!("write timeout ({:?})", wait),
        }
    }

    async fn read_reply_timed(stream: &mut TcpStream, wait: Duration) -> Result<ServerReply> {
        match timeout(wait, read_message::<_, ServerReply>(stream)).await {
            Ok(res) => res.context("read server reply"),
            Err(_) => bail!("no reply from server within {:?}", wait),
        }
    }

    pub async fn connect(addr: &RemoteAddr) -> Result<TcpStream> {
        let target = addr.socket_string();
        let wait = Duration::from_millis(timeouts::CONNECT_MS);
        let stream = match timeout(wait, TcpStream::connect(&target)).await {
            Ok(res) => res.with_context(|| format!("connect {}", target))?,
            Err(_) => bail!("connect {} timed out ({:?})", target, wait),
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Push `file` to the server and check the hash it reports against the
    /// locally computed SHA-256. A mismatch is reported through
    /// `verified`, not as an error.
    pub async fn upload(addr: &RemoteAddr, file: &Path, show_progress: bool) -> Result<UploadOutcome> {
        let meta = tokio::fs::metadata(file)
            .await
            .with_context(|| format!("stat {}", file.display()))?;
        if !meta.is_file() {
            bail!("{} is not a regular file", file.display());
        }
        let size = meta.len();
        let source = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("open {}", file.display()))?;

        let mut stream = connect(addr).await?;
        // Only the name travels; local directories stay private
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string_lossy().into_owned());
        let request = ClientRequest::upload(name, size);
        write_message(&mut stream, &request).await.context("send request")?;

        let progress = TransferProgress::new(Some(size), show_progress, "upload");
        let started = Instant::now();
        let mut reader = source.take(size);
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        let mut digest = StreamDigest::new();
        let idle = Duration::from_secs(timeouts::IDLE_SECS);
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .with_context(|| format!("read {}", file.display()))?;
            if n == 0 {
                break;
            }
            if let Err(e) = write_all_timed(&mut stream, &buf[..n], idle).await {
                progress.abandon();
                // The server may have refused the upload and said why
                if let Ok(reply) = read_reply_timed(&mut stream, Duration::from_secs(1)).await {
                    if !reply.okay {
                        bail!("server rejected upload: {}", reply.error.unwrap_or_default());
                    }
                }
                return Err(e.context("send file data"));
            }
            digest.update(&buf[..n]);
            progress.inc(n as u64);
        }
        if digest.bytes() != size {
            progress.abandon();
            bail!(
                "{} shrank while uploading: sent {} of {} bytes",
                file.display(),
                digest.bytes(),
                size
            );
        }
        stream.flush().await?;
        progress.set_message("waiting for server");

        let reply = read_reply_timed(&mut stream, reply_timeout()).await?;
        if !reply.okay {
            progress.abandon();
            bail!(
                "server failed to store upload: {}",
                reply.error.as_deref().unwrap_or("no reason given")
            );
        }
        progress.finish("upload done");
        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "upload finished");

        let local_digest = digest.finish_hex();
        let verified = reply
            .digest()
            .map(|remote| digests_match(&local_digest, remote))
            .unwrap_or(false);
        Ok(UploadOutcome {
            artifact: reply.file_name,
            bytes: size,
            local_digest,
            remote_hash: reply.hash,
            verified,
        })
    }

    /// Fetch the decoded contents of `artifact` into `output`.
    ///
    /// Bytes land in `<output>.part` and are renamed into place only once the
    /// server trailer's digest matches.
    pub async fn download(
        addr: &RemoteAddr,
        artifact: &str,
        output: &Path,
        show_progress: bool,
    ) -> Result<DownloadOutcome> {
        let mut stream = connect(addr).await?;
        write_message(&mut stream, &ClientRequest::download(artifact))
            .await
            .context("send request")?;

        let ack = read_reply_timed(&mut stream, reply_timeout()).await?;
        if !ack.okay {
            bail!(
                "server refused download: {}",
                ack.error.as_deref().unwrap_or("no reason given")
            );
        }

        let part = part_path(output);
        let mut file = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("create {}", part.display()))?;
        let progress = TransferProgress::new(None, show_progress, "download");
        let idle = Duration::from_secs(timeouts::IDLE_SECS);
        let mut buf = Vec::new();
        let mut digest = StreamDigest::new();
        loop {
            let n = match timeout(idle, read_chunk(&mut stream, &mut buf)).await {
                Ok(res) => res.context("read data chunk")?,
                Err(_) => bail!("server idle for {:?} mid-download", idle),
            };
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .with_context(|| format!("write {}", part.display()))?;
            digest.update(&buf[..n]);
            progress.inc(n as u64);
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let trailer = read_reply_timed(&mut stream, reply_timeout()).await?;
        if !trailer.okay {
            progress.abandon();
            let _ = tokio::fs::remove_file(&part).await;
            bail!(
                "server failed to decode {}: {}",
                artifact,
                trailer.error.as_deref().unwrap_or("no reason given")
            );
        }

        let bytes = digest.bytes();
        let local_digest = digest.finish_hex();
        let verified = trailer
            .digest()
            .map(|remote| digests_match(&local_digest, remote))
            .unwrap_or(false);
        let output = if verified {
            tokio::fs::rename(&part, output)
                .await
                .with_context(|| format!("rename {} -> {}", part.display(), output.display()))?;
            progress.finish("download done");
            output.to_path_buf()
        } else {
            progress.abandon();
            part
        };
        Ok(DownloadOutcome {
            artifact: artifact.to_string(),
            output,
            bytes,
            local_digest,
            remote_hash: trailer.hash,
            verified,
        })
    }

    fn part_path(output: &Path) -> PathBuf {
        let mut name = OsString::from(output.as_os_str());
        name.push(".part");
        PathBuf::from(name)
    }

}
