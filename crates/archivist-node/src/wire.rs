//! Framed reads and writes on a data-port stream.
//!
//! Every field is read until filled. A stream that ends mid-field is an
//! `UnexpectedEof` I/O error, never a short value.

use archivist_protocol::codec::{check_payload_len, LENGTH_PREFIX_SIZE};
use archivist_protocol::{
    parse_wire_id, wire_id, FileId, JsonFrameCodec, ProtocolError, CHUNK_SIZE, ID_LEN, TAG_LEN,
};
use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Fail with a `TimedOut` I/O error when `fut` does not finish within `idle`.
pub async fn within<T>(idle: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(idle, fut)
        .await
        .map_err(|_| ProtocolError::Io(io::ErrorKind::TimedOut.into()))?
}

/// Read an 8-byte tag. `None` when the peer closed the stream cleanly
/// between requests.
pub async fn read_tag<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<[u8; TAG_LEN]>> {
    let mut tag = [0u8; TAG_LEN];
    if r.read(&mut tag[..1]).await? == 0 {
        return Ok(None);
    }
    r.read_exact(&mut tag[1..]).await?;
    Ok(Some(tag))
}

pub async fn read_token<R: AsyncRead + Unpin>(r: &mut R) -> Result<[u8; TAG_LEN]> {
    let mut token = [0u8; TAG_LEN];
    r.read_exact(&mut token).await?;
    Ok(token)
}

pub async fn read_byte<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8> {
    Ok(r.read_u8().await?)
}

pub async fn write_byte<W: AsyncWrite + Unpin>(w: &mut W, b: u8) -> Result<()> {
    w.write_u8(b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_id<R: AsyncRead + Unpin>(r: &mut R) -> Result<FileId> {
    let mut raw = [0u8; ID_LEN];
    r.read_exact(&mut raw).await?;
    parse_wire_id(&raw)
}

pub async fn write_id<W: AsyncWrite + Unpin>(w: &mut W, id: &FileId) -> Result<()> {
    w.write_all(&wire_id(id)).await?;
    Ok(())
}

/// Read a length prefix, refusing anything above `i32::MAX`.
pub async fn read_len<R: AsyncRead + Unpin>(r: &mut R) -> Result<usize> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    r.read_exact(&mut prefix).await?;
    check_payload_len(prefix)
}

/// Read a length-prefixed JSON value.
///
/// The payload is always consumed in full, so a JSON error leaves the stream
/// positioned at the next request.
pub async fn read_json<T, R>(r: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let len = read_len(r).await?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + len.min(CHUNK_SIZE));
    buf.extend_from_slice(&(len as i64).to_be_bytes());
    read_into(r, &mut buf, len, None).await?;

    let mut codec = JsonFrameCodec::<T>::new();
    codec
        .decode(&mut buf)?
        .ok_or_else(|| ProtocolError::Io(io::ErrorKind::UnexpectedEof.into()))
}

pub async fn write_json<T, W>(w: &mut W, value: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut codec = JsonFrameCodec::<T>::new();
    let mut buf = BytesMut::new();
    codec.encode(value, &mut buf)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read a length-prefixed blob in chunks. Memory grows with what actually
/// arrives, not with the declared length.
pub async fn read_blob<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    read_blob_inner(r, None).await
}

/// As [`read_blob`], but every chunk (and the length prefix) must arrive
/// within `idle`. A sender that stalls mid-blob gets a `TimedOut` error
/// however large the declared length.
pub async fn read_blob_idle<R: AsyncRead + Unpin>(r: &mut R, idle: Duration) -> Result<Vec<u8>> {
    read_blob_inner(r, Some(idle)).await
}

async fn read_blob_inner<R: AsyncRead + Unpin>(r: &mut R, idle: Option<Duration>) -> Result<Vec<u8>> {
    let len = match idle {
        Some(idle) => within(idle, read_len(r)).await?,
        None => read_len(r).await?,
    };
    let mut buf = BytesMut::with_capacity(len.min(CHUNK_SIZE));
    read_into(r, &mut buf, len, idle).await?;
    Ok(buf.to_vec())
}

async fn read_into<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut BytesMut,
    len: usize,
    idle: Option<Duration>,
) -> Result<()> {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(CHUNK_SIZE);
        let read = r.read_exact(&mut chunk[..n]);
        match idle {
            Some(idle) => {
                tokio::time::timeout(idle, read)
                    .await
                    .map_err(|_| ProtocolError::Io(io::ErrorKind::TimedOut.into()))??;
            }
            None => {
                read.await?;
            }
        }
        buf.extend_from_slice(&chunk[..n]);
        remaining -= n;
    }
    Ok(())
}

/// Write a length prefix followed by `data` in fixed-size chunks.
pub async fn write_blob<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    w.write_i64(data.len() as i64).await?;
    for chunk in data.chunks(CHUNK_SIZE) {
        w.write_all(chunk).await?;
    }
    w.flush().await?;
    Ok(())
}
