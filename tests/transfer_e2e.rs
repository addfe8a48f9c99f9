use std::collections::HashSet;
use std::future::Future;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ecpipe::archiver::{Archiver, Decoder, EncodeReport, EncodeStats, Encoder};
use ecpipe::checksum::sha256_hex;
use ecpipe::error::ProtocolError;
use ecpipe::log::{TransferLog, TransferStatus};
use ecpipe::net_async::client;
use ecpipe::net_async::server::{PoolLimits, Server, ServerContext};
use ecpipe::protocol::{ClientRequest, ServerReply};
use ecpipe::protocol_core::{read_chunk, read_message, write_message};
use ecpipe::url::RemoteAddr;

/// Counts handles that are still alive
struct Live(Arc<AtomicUsize>);

impl Live {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Live(Arc::clone(counter))
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stores the raw bytes as the "archive" and reports their SHA-256
#[derive(Clone, Default)]
struct MemArchiver {
    live: Arc<AtomicUsize>,
    fail_encode: bool,
    wrong_hash: bool,
    fail_decode: bool,
    /// Serve the stored bytes, then never reach EOF
    stall_decode: bool,
}

struct MemEncoder {
    buf: Vec<u8>,
    output: PathBuf,
    fail: bool,
    wrong_hash: bool,
    _live: Live,
}

struct MemDecoder {
    data: Box<dyn AsyncRead + Send + Unpin>,
    fail: bool,
    _open: Option<DuplexStream>,
    _live: Live,
}

impl Archiver for MemArchiver {
    type Encoder = MemEncoder;
    type Decoder = MemDecoder;

    fn encoder(&self, _id: &str, output: &Path) -> Result<MemEncoder> {
        Ok(MemEncoder {
            buf: Vec::new(),
            output: output.to_path_buf(),
            fail: self.fail_encode,
            wrong_hash: self.wrong_hash,
            _live: Live::new(&self.live),
        })
    }

    fn decoder(&self, input: &Path) -> Result<MemDecoder> {
        let stored = Cursor::new(std::fs::read(input)?);
        let (data, open): (Box<dyn AsyncRead + Send + Unpin>, _) = if self.stall_decode {
            let (held, pending) = tokio::io::duplex(64);
            (Box::new(stored.chain(pending)), Some(held))
        } else {
            (Box::new(stored), None)
        };
        Ok(MemDecoder {
            data,
            fail: self.fail_decode,
            _open: open,
            _live: Live::new(&self.live),
        })
    }
}

impl Encoder for MemEncoder {
    fn input(&mut self) -> &mut (dyn tokio::io::AsyncWrite + Send + Unpin) {
        &mut self.buf
    }

    fn finish(self) -> impl Future<Output = Result<EncodeReport>> + Send {
        async move {
            if self.fail {
                bail!("out of shards");
            }
            tokio::fs::write(&self.output, &self.buf).await?;
            let digest = if self.wrong_hash {
                "00".repeat(32)
            } else {
                sha256_hex(&self.buf)
            };
            Ok(EncodeReport {
                stats: EncodeStats {
                    hash: format!("sha256 - {}", digest),
                },
            })
        }
    }
}

impl Decoder for MemDecoder {
    fn output(&mut self) -> &mut (dyn tokio::io::AsyncRead + Send + Unpin) {
        &mut self.data
    }

    fn finish(self) -> impl Future<Output = Result<()>> + Send {
        async move {
            if self.fail {
                bail!("block 3 corrupt");
            }
            Ok(())
        }
    }
}

struct TestServer {
    addr: RemoteAddr,
    root: PathBuf,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    dir: tempfile::TempDir,
}

impl TestServer {
    async fn start<A: Archiver>(archiver: A, workers: usize, tune: impl FnOnce(ServerContext<A>) -> ServerContext<A>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let ctx = tune(ServerContext::new(root.clone(), archiver).with_transfer_log());
        let limits = PoolLimits {
            workers,
            queue_depth: 16,
        };
        let server = Server::bind("127.0.0.1:0", ctx, limits).await.unwrap();
        let port = server.local_addr().unwrap().port();
        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(rx));
        TestServer {
            addr: RemoteAddr {
                host: "127.0.0.1".into(),
                port,
            },
            root,
            stop,
            task,
            dir,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr.socket_string()).await.unwrap()
    }

    fn artifacts(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".ec"))
            .collect();
        names.sort();
        names
    }

    fn journal(&self) -> TransferLog {
        TransferLog::new(&self.root)
    }

    /// Stop the server; the returned dir keeps the root alive for inspection
    async fn shutdown(self) -> tempfile::TempDir {
        self.stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        self.dir
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, data).unwrap();
    p
}

#[tokio::test]
async fn upload_digest_matches_and_is_journaled() {
    let archiver = MemArchiver::default();
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 4, |c| c).await;
    let src = tempfile::tempdir().unwrap();
    let data = pattern(100_003);
    let file = write_source(src.path(), "report.pdf", &data);

    let outcome = client::upload(&srv.addr, &file, false).await.unwrap();

    assert!(outcome.verified);
    assert_eq!(outcome.bytes, data.len() as u64);
    assert_eq!(outcome.local_digest, sha256_hex(&data));
    assert!(outcome.artifact.starts_with("report.pdf_"));
    assert!(outcome.artifact.ends_with(".ec"));
    assert_eq!(std::fs::read(srv.root.join(&outcome.artifact)).unwrap(), data);
    assert_eq!(live.load(Ordering::SeqCst), 0);

    let entries = srv.journal().read_log().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, TransferStatus::Completed);
    // Only the base name crosses the wire
    assert_eq!(entries[0].file_name, "report.pdf");
    assert_eq!(entries[0].bytes, data.len() as u64);
    assert_eq!(entries[0].artifact.as_deref(), Some(outcome.artifact.as_str()));
    srv.shutdown().await;
}

#[tokio::test]
async fn empty_file_round_trips() {
    let srv = TestServer::start(MemArchiver::default(), 2, |c| c).await;
    let src = tempfile::tempdir().unwrap();
    let file = write_source(src.path(), "empty", b"");

    let outcome = client::upload(&srv.addr, &file, false).await.unwrap();
    assert!(outcome.verified);
    assert_eq!(outcome.bytes, 0);

    let out = src.path().join("back");
    let got = client::download(&srv.addr, &outcome.artifact, &out, false).await.unwrap();
    assert!(got.verified);
    assert_eq!(std::fs::read(&out).unwrap(), b"");
    srv.shutdown().await;
}

#[tokio::test]
async fn concurrent_same_name_uploads_get_distinct_artifacts() {
    let srv = TestServer::start(MemArchiver::default(), 4, |c| c).await;
    let src = tempfile::tempdir().unwrap();
    let file = write_source(src.path(), "same.bin", &pattern(20_000));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let addr = srv.addr.clone();
        let file = file.clone();
        tasks.push(tokio::spawn(async move { client::upload(&addr, &file, false).await }));
    }
    let mut names = HashSet::new();
    for t in tasks {
        let outcome = t.await.unwrap().unwrap();
        assert!(outcome.verified);
        names.insert(outcome.artifact);
    }
    assert_eq!(names.len(), 8);
    assert_eq!(srv.artifacts().len(), 8);
    srv.shutdown().await;
}

#[tokio::test]
async fn download_round_trip() {
    let archiver = MemArchiver::default();
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 2, |c| c).await;
    let src = tempfile::tempdir().unwrap();
    // Spans several download chunks with a short tail
    let data = pattern(4080 * 5 + 17);
    let file = write_source(src.path(), "photo.raw", &data);
    let stored = client::upload(&srv.addr, &file, false).await.unwrap();

    let out = src.path().join("restored.raw");
    let got = client::download(&srv.addr, &stored.artifact, &out, false).await.unwrap();

    assert!(got.verified);
    assert_eq!(got.output, out);
    assert_eq!(got.bytes, data.len() as u64);
    assert_eq!(std::fs::read(&out).unwrap(), data);
    assert!(!src.path().join("restored.raw.part").exists());
    assert_eq!(live.load(Ordering::SeqCst), 0);
    srv.shutdown().await;
}

#[tokio::test]
async fn decoder_failure_reaches_client_in_trailer() {
    let archiver = MemArchiver {
        fail_decode: true,
        ..Default::default()
    };
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 2, |c| c).await;
    let src = tempfile::tempdir().unwrap();
    let file = write_source(src.path(), "scan.tif", &pattern(9000));
    let stored = client::upload(&srv.addr, &file, false).await.unwrap();

    let out = src.path().join("scan.back");
    let err = client::download(&srv.addr, &stored.artifact, &out, false)
        .await
        .unwrap_err()
        .to_string();

    assert!(err.contains("block 3 corrupt"), "{}", err);
    assert!(!out.exists());
    assert!(!src.path().join("scan.back.part").exists());
    assert_eq!(live.load(Ordering::SeqCst), 0);
    let entries = srv.journal().read_log().unwrap();
    let last = entries.last().unwrap();
    assert_eq!(last.status, TransferStatus::Failed);
    assert!(last.error.as_deref().unwrap().contains("block 3 corrupt"));
    srv.shutdown().await;
}

#[tokio::test]
async fn shutdown_interrupts_download_and_releases_decoder() {
    let archiver = MemArchiver {
        stall_decode: true,
        ..Default::default()
    };
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 2, |c| c).await;
    std::fs::write(srv.root.join("stuck.ec"), pattern(10_000)).unwrap();
    let mut conn = srv.connect().await;

    write_message(&mut conn, &ClientRequest::download("stuck.ec")).await.unwrap();
    let ack: ServerReply = read_message(&mut conn).await.unwrap();
    assert!(ack.okay);
    let mut buf = Vec::new();
    assert_eq!(read_chunk(&mut conn, &mut buf).await.unwrap(), 4080);
    assert_eq!(read_chunk(&mut conn, &mut buf).await.unwrap(), 4080);
    assert_eq!(live.load(Ordering::SeqCst), 1);

    let journal = srv.journal();
    let _root = srv.shutdown().await;

    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert!(read_chunk(&mut conn, &mut buf).await.is_err());
    assert_eq!(journal.read_log().unwrap()[0].status, TransferStatus::Interrupted);
}

#[tokio::test]
async fn download_of_unknown_or_escaping_name_is_refused() {
    let archiver = MemArchiver::default();
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 2, |c| c).await;
    let out = tempfile::tempdir().unwrap();

    for name in ["missing.ec", "../../etc/passwd", "/etc/passwd", ".ecpipe_transfers.jsonl"] {
        let err = client::download(&srv.addr, name, &out.path().join("x"), false)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("refused"), "{}: {}", name, err);
    }
    assert_eq!(live.load(Ordering::SeqCst), 0);
    srv.shutdown().await;
}

#[tokio::test]
async fn list_is_rejected_and_connection_closed() {
    let srv = TestServer::start(MemArchiver::default(), 2, |c| c).await;
    let mut conn = srv.connect().await;

    write_message(&mut conn, &ClientRequest::list("anything")).await.unwrap();
    let reply: ServerReply = read_message(&mut conn).await.unwrap();

    assert!(!reply.okay);
    assert!(reply.error.unwrap().contains("not supported"));
    let next = read_message::<_, ServerReply>(&mut conn).await;
    assert!(matches!(next, Err(ProtocolError::Closed)));

    let entries = srv.journal().read_log().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, TransferStatus::Rejected);
    srv.shutdown().await;
}

#[tokio::test]
async fn malformed_and_invalid_requests_get_failure_replies() {
    let srv = TestServer::start(MemArchiver::default(), 2, |c| c).await;

    let bodies: [&[u8]; 3] = [
        b"this is not json",
        br#"{"op":"delete","file_name":"x"}"#,
        br#"{"op":"upload","file_name":"no-size"}"#,
    ];
    for body in bodies {
        let mut conn = srv.connect().await;
        conn.write_all(&(body.len() as u16).to_be_bytes()).await.unwrap();
        conn.write_all(body).await.unwrap();
        let reply: ServerReply = read_message(&mut conn).await.unwrap();
        assert!(!reply.okay, "{}", String::from_utf8_lossy(body));
        assert!(reply.error.is_some());
    }
    assert!(srv.artifacts().is_empty());
    srv.shutdown().await;
}

#[tokio::test]
async fn invalid_upload_body_is_consumed_before_reply() {
    let archiver = MemArchiver::default();
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 2, |c| c).await;
    let mut conn = srv.connect().await;
    let body = pattern(200_000);

    write_message(&mut conn, &ClientRequest::upload("", body.len() as u64)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), conn.write_all(&body))
        .await
        .expect("server stopped reading the body")
        .unwrap();
    conn.shutdown().await.unwrap();

    let reply: ServerReply = read_message(&mut conn).await.unwrap();
    assert!(!reply.okay);
    assert!(reply.error.unwrap().contains("file_name"));
    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert_eq!(srv.journal().read_log().unwrap()[0].status, TransferStatus::Rejected);
    srv.shutdown().await;
}

#[tokio::test]
async fn early_close_finalises_encoder_and_reports_short_upload() {
    let archiver = MemArchiver::default();
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 2, |c| c).await;
    let mut conn = srv.connect().await;

    write_message(&mut conn, &ClientRequest::upload("cut.bin", 100)).await.unwrap();
    conn.write_all(&pattern(40)).await.unwrap();
    conn.shutdown().await.unwrap();

    let reply: ServerReply = read_message(&mut conn).await.unwrap();
    assert!(!reply.okay);
    assert!(reply.error.unwrap().contains("40 of 100"));
    assert_eq!(reply.hash, format!("sha256 - {}", sha256_hex(&pattern(40))));
    assert_eq!(live.load(Ordering::SeqCst), 0);

    let stored = srv.artifacts();
    assert_eq!(stored.len(), 1);
    assert_eq!(std::fs::read(srv.root.join(&stored[0])).unwrap().len(), 40);
    let entries = srv.journal().read_log().unwrap();
    assert_eq!(entries[0].status, TransferStatus::Truncated);
    srv.shutdown().await;
}

#[tokio::test]
async fn encoder_failure_is_reported_to_client() {
    let archiver = MemArchiver {
        fail_encode: true,
        ..Default::default()
    };
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 2, |c| c).await;
    let src = tempfile::tempdir().unwrap();
    let file = write_source(src.path(), "doomed", &pattern(5000));

    let err = client::upload(&srv.addr, &file, false).await.unwrap_err().to_string();
    assert!(err.contains("out of shards"), "{}", err);
    assert_eq!(live.load(Ordering::SeqCst), 0);
    assert_eq!(srv.journal().read_log().unwrap()[0].status, TransferStatus::Failed);
    srv.shutdown().await;
}

#[tokio::test]
async fn digest_mismatch_is_not_verified() {
    let archiver = MemArchiver {
        wrong_hash: true,
        ..Default::default()
    };
    let srv = TestServer::start(archiver, 2, |c| c).await;
    let src = tempfile::tempdir().unwrap();
    let file = write_source(src.path(), "f", &pattern(1000));

    let outcome = client::upload(&srv.addr, &file, false).await.unwrap();
    assert!(!outcome.verified);
    assert_eq!(outcome.remote_hash, format!("sha256 - {}", "00".repeat(32)));
    srv.shutdown().await;
}

#[tokio::test]
async fn shutdown_interrupts_upload_and_releases_encoder() {
    let archiver = MemArchiver::default();
    let live = Arc::clone(&archiver.live);
    let srv = TestServer::start(archiver, 2, |c| c).await;
    let mut conn = srv.connect().await;

    write_message(&mut conn, &ClientRequest::upload("big.bin", 1_000_000)).await.unwrap();
    conn.write_all(&pattern(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(live.load(Ordering::SeqCst), 1);

    let journal = srv.journal();
    let _root = srv.shutdown().await;

    assert_eq!(live.load(Ordering::SeqCst), 0);
    let next = read_message::<_, ServerReply>(&mut conn).await;
    assert!(next.is_err());
    assert_eq!(journal.read_log().unwrap()[0].status, TransferStatus::Interrupted);
}

#[tokio::test]
async fn request_timeout_closes_silent_connection() {
    let srv = TestServer::start(MemArchiver::default(), 2, |c| {
        c.with_timeouts(Duration::from_millis(200), Duration::from_secs(5))
    })
    .await;
    let mut conn = srv.connect().await;

    let res = tokio::time::timeout(Duration::from_secs(3), read_message::<_, ServerReply>(&mut conn))
        .await
        .expect("server kept the connection open");
    assert!(matches!(res, Err(ProtocolError::Closed)));
    srv.shutdown().await;
}

#[tokio::test]
async fn single_worker_serialises_connections() {
    let srv = TestServer::start(MemArchiver::default(), 1, |c| c).await;
    let src = tempfile::tempdir().unwrap();
    let file = write_source(src.path(), "queued", &pattern(2000));

    // Occupies the only worker until it goes away
    let holder = srv.connect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let addr = srv.addr.clone();
    let queued = tokio::spawn(async move { client::upload(&addr, &file, false).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!queued.is_finished());

    drop(holder);
    let outcome = tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .expect("queued upload never ran")
        .unwrap()
        .unwrap();
    assert!(outcome.verified);
    srv.shutdown().await;
}

#[cfg(unix)]
mod process_archiver {
    use super::*;
    use ecpipe::archiver::ProcessArchiver;

    const STORE_AND_HASH: &str = r#"cat > "$2" && h=$(sha256sum "$2" | cut -d' ' -f1) && printf '{"stats":{"hash":"sha256 - %s"}}\n' "$h""#;

    fn sh_archiver() -> ProcessArchiver {
        ProcessArchiver::new(
            "sh",
            vec!["-c".into(), STORE_AND_HASH.into(), "sh".into(), "{id}".into(), "{output}".into()],
            vec!["-c".into(), r#"cat "$1""#.into(), "sh".into(), "{input}".into()],
        )
    }

    #[tokio::test]
    async fn upload_and_download_through_external_tool() {
        let srv = TestServer::start(sh_archiver(), 2, |c| c).await;
        let src = tempfile::tempdir().unwrap();
        let data = pattern(300_000);
        let file = write_source(src.path(), "archive.tar", &data);

        let stored = client::upload(&srv.addr, &file, false).await.unwrap();
        assert!(stored.verified, "{:?}", stored);

        let out = src.path().join("archive.copy");
        let got = client::download(&srv.addr, &stored.artifact, &out, false).await.unwrap();
        assert!(got.verified);
        assert_eq!(std::fs::read(&out).unwrap(), data);
        srv.shutdown().await;
    }

    #[tokio::test]
    async fn encoder_exiting_early_reports_its_stderr() {
        let archiver = ProcessArchiver::new(
            "sh",
            vec![
                "-c".into(),
                "head -c 10 >/dev/null; echo 'shard store offline' >&2; exit 4".into(),
            ],
            vec![],
        );
        let srv = TestServer::start(archiver, 2, |c| c).await;
        let src = tempfile::tempdir().unwrap();
        // Far more than a pipe buffer, so the write side sees the exit
        let file = write_source(src.path(), "huge.img", &pattern(8 * 1024 * 1024));

        let err = client::upload(&srv.addr, &file, false).await.unwrap_err().to_string();
        assert!(err.contains("shard store offline"), "{}", err);
        assert!(err.contains("exit status: 4"), "{}", err);

        let entries = srv.journal().read_log().unwrap();
        assert_eq!(entries[0].status, TransferStatus::Failed);
        assert!(entries[0].error.as_deref().unwrap().contains("shard store offline"));
        srv.shutdown().await;
    }

    #[tokio::test]
    async fn missing_tool_fails_upload_cleanly() {
        let archiver = ProcessArchiver::new("/nonexistent/ec-tool", vec![], vec![]);
        let srv = TestServer::start(archiver, 2, |c| c).await;
        let src = tempfile::tempdir().unwrap();
        let file = write_source(src.path(), "x", &pattern(100));

        let err = client::upload(&srv.addr, &file, false).await.unwrap_err().to_string();
        assert!(err.contains("encoder unavailable"), "{}", err);
        srv.shutdown().await;
    }
}
