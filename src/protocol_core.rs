//! Shared protocol logic for both the server and the client
//!
//! Frames are a big-endian u16 payload length followed by that many bytes of
//! UTF-8 JSON. Download data travels in binary chunks using the same 2-byte
//! prefix, terminated by a zero-length chunk.

use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::protocol::{LEN_PREFIX, MAX_PAYLOAD};

/// Normalize a path to be safely under a root directory.
/// This prevents path traversal attacks by:
/// 1. Rejecting absolute paths, parent directory components, and root/prefix components
/// 2. Rejecting NUL bytes in path
/// 3. Canonicalizing the final path to resolve symlinks
/// 4. Ensuring the result is under the root
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("path is empty");
    }

    let canon_root = root
        .canonicalize()
        .map_err(|e| anyhow!("failed to canonicalize root {:?}: {}", root, e))?;
    let joined = canon_root.join(&safe);

    // Existing paths resolve symlinks; new paths only need their parent resolved
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?
    } else {
        match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(name)) if parent.exists() => parent
                .canonicalize()
                .map_err(|e| anyhow!("failed to canonicalize parent {:?}: {}", parent, e))?
                .join(name),
            _ => joined,
        }
    };

    if !final_path.starts_with(&canon_root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }

    Ok(final_path)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Serialize `msg` and prepend its length. Fails fast when the payload does
/// not fit the prefix instead of truncating.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg).map_err(ProtocolError::Malformed)?;
    let len = u16::try_from(payload.len()).map_err(|_| ProtocolError::TooLarge {
        size: payload.len(),
        max: MAX_PAYLOAD,
    })?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse a frame payload. Non-JSON is `Malformed`; JSON with the wrong shape
/// or values is `Invalid`.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(ProtocolError::Malformed)?;
    serde_json::from_value(value).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

/// Write one framed message as a single buffer
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one framed message
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let len = match read_len_prefix(reader).await? {
        Some(len) => len,
        None => return Err(ProtocolError::Closed),
    };
    let mut payload = vec![0u8; len];
    read_body(reader, &mut payload, "payload").await?;
    decode_payload(&payload)
}

/// Write one binary data chunk. An empty `data` is the end-of-stream marker.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::TooLarge {
        size: data.len(),
        max: MAX_PAYLOAD,
    })?;
    let mut buf = Vec::with_capacity(LEN_PREFIX + data.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(data);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one binary data chunk into `buf`, returning its length (0 = end of stream)
pub async fn read_chunk<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = match read_len_prefix(reader).await? {
        Some(len) => len,
        None => return Err(ProtocolError::Truncated("data stream ended without terminator")),
    };
    buf.resize(len, 0);
    read_body(reader, buf, "data chunk").await?;
    Ok(len)
}

// None when the peer closed before sending any byte of the prefix
async fn read_len_prefix<R>(reader: &mut R) -> Result<Option<usize>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hdr = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = reader.read(&mut hdr[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated("length prefix"));
        }
        filled += n;
    }
    Ok(Some(u16::from_be_bytes(hdr) as usize))
}

async fn read_body<R>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ProtocolError::Truncated(what)),
        Err(e) => Err(e.into()),
    }
}
