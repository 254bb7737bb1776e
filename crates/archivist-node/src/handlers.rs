//! Server side of the data protocol: one request loop per accepted connection.
//!
//! Errors returned from here close the connection. Requests whose input was
//! fully consumed but unusable (bad id, bad JSON) or that hit an unavailable
//! store are answered with `STATUS_ERROR` and the loop goes on.

use std::net::SocketAddr;

use archivist_protocol::{
    FileId, FileRecord, PeerRole, ProtocolError, RequestTag, STATUS_ACCEPT, STATUS_DELETED,
    STATUS_DELETE_MISSING, STATUS_DUPLICATE, STATUS_ERROR, STATUS_MISSING, STATUS_NO_FREE_SPACE,
    STATUS_SENDING,
};
use archivist_replication::{
    decide_push, merge_meta_update, on_push_received, validate_blob, PushDecision, ReceiveOutcome,
};
use archivist_storage::StorageError;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::client::{PeerClient, PushOutcome};
use crate::context::NodeContext;
use crate::wire;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("unknown request tag {0:?}")]
    UnknownTag(String),
    #[error("idle timeout")]
    IdleTimeout,
}

pub type Result<T> = std::result::Result<T, HandlerError>;

/// Serve requests on `stream` until the peer hangs up.
pub async fn serve_connection(mut stream: TcpStream, role: PeerRole, ctx: &NodeContext) -> Result<()> {
    let remote = stream.peer_addr().map_err(ProtocolError::from)?;
    let span = tracing::info_span!("conn", node = %ctx.node_id, %remote, ?role);
    request_loop(&mut stream, remote, role, ctx).instrument(span).await
}

async fn request_loop(
    stream: &mut TcpStream,
    remote: SocketAddr,
    role: PeerRole,
    ctx: &NodeContext,
) -> Result<()> {
    loop {
        let raw = match tokio::time::timeout(ctx.idle_timeout, wire::read_tag(stream)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                tracing::debug!("handlers: peer closed connection");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(HandlerError::IdleTimeout),
        };

        let Some(tag) = RequestTag::parse(&raw) else {
            let shown = String::from_utf8_lossy(&raw).into_owned();
            tracing::warn!(tag = %shown, "handlers: unknown request tag, closing");
            wire::write_byte(stream, STATUS_ERROR).await?;
            return Err(HandlerError::UnknownTag(shown));
        };

        tracing::debug!(request = %tag, "handlers: request");
        match tag {
            RequestTag::FilePull => file_pull(stream, ctx).await?,
            RequestTag::FilePush => file_push(stream, remote, role, ctx).await?,
            RequestTag::FileDelete => file_delete(stream, role, ctx).await?,
            RequestTag::MetaDownload => meta_download(stream, ctx).await?,
            RequestTag::MetaUpdate => meta_update(stream, role, ctx).await?,
        }
    }
}

/// Malformed input that was read in full. The stream is still in sync.
fn is_recoverable(e: &ProtocolError) -> bool {
    matches!(e, ProtocolError::InvalidId | ProtocolError::Json(_))
}

async fn reject(
    stream: &mut TcpStream,
    request: RequestTag,
    reason: &(dyn std::fmt::Display + Sync),
) -> Result<()> {
    tracing::warn!(%request, %reason, "handlers: request rejected");
    wire::write_byte(stream, STATUS_ERROR).await?;
    Ok(())
}

async fn file_pull(stream: &mut TcpStream, ctx: &NodeContext) -> Result<()> {
    let id = match wire::within(ctx.idle_timeout, wire::read_id(stream)).await {
        Ok(id) => id,
        Err(e) if is_recoverable(&e) => return reject(stream, RequestTag::FilePull, &e).await,
        Err(e) => return Err(e.into()),
    };

    match ctx.archive.read_blob(&id) {
        Ok(Some(data)) => {
            wire::write_byte(stream, STATUS_SENDING).await?;
            wire::write_blob(stream, &data).await?;
            tracing::debug!(file = %id, bytes = data.len(), "handlers: blob sent");
        }
        Ok(None) => wire::write_byte(stream, STATUS_MISSING).await?,
        Err(e) => return reject(stream, RequestTag::FilePull, &e).await,
    }
    Ok(())
}

async fn file_push(
    stream: &mut TcpStream,
    remote: SocketAddr,
    role: PeerRole,
    ctx: &NodeContext,
) -> Result<()> {
    let record: FileRecord = match wire::within(ctx.idle_timeout, wire::read_json(stream)).await {
        Ok(r) => r,
        Err(e) if is_recoverable(&e) => return reject(stream, RequestTag::FilePush, &e).await,
        Err(e) => return Err(e.into()),
    };

    let existing = match ctx.archive.blob_checksum(&record.id) {
        Ok(c) => c,
        Err(e) => return reject(stream, RequestTag::FilePush, &e).await,
    };
    match decide_push(existing, &record.checksum, ctx.archive.free_space()) {
        PushDecision::Duplicate => {
            tracing::debug!(file = %record.id, "handlers: duplicate push, no transfer");
            wire::write_byte(stream, STATUS_DUPLICATE).await?;
            return Ok(());
        }
        PushDecision::NoFreeSpace => {
            tracing::warn!(file = %record.id, "handlers: push refused, no free space");
            wire::write_byte(stream, STATUS_NO_FREE_SPACE).await?;
            return Ok(());
        }
        PushDecision::Accept => wire::write_byte(stream, STATUS_ACCEPT).await?,
    }

    // From here on the client expects no reply, so failures close the connection.
    let data = wire::read_blob_idle(stream, ctx.idle_timeout).await?;
    if !validate_blob(&record, &data) {
        tracing::warn!(
            file = %record.id,
            expected = %record.checksum,
            bytes = data.len(),
            "handlers: checksum mismatch, blob discarded"
        );
        return Ok(());
    }
    ctx.archive.store_blob(&record.id, &data)?;

    let outcome = on_push_received(&record, ctx.node_id, &remote.ip().to_string());
    let saved = ctx
        .archive
        .update(&record.id, |existing| merge_meta_update(outcome.record(), existing.as_ref()))?;
    tracing::info!(
        file = %record.id,
        name = %record.name,
        bytes = data.len(),
        locations = saved.server_locations.len(),
        "handlers: file stored"
    );

    if let ReceiveOutcome::StoredAndQueued(_) = outcome {
        ctx.schedule_replication(saved.id);
    }
    if role == PeerRole::Client {
        cascade(ctx, Cascade::Push(saved, Bytes::from(data)));
    }
    Ok(())
}

async fn file_delete(stream: &mut TcpStream, role: PeerRole, ctx: &NodeContext) -> Result<()> {
    let id = match wire::within(ctx.idle_timeout, wire::read_id(stream)).await {
        Ok(id) => id,
        Err(e) if is_recoverable(&e) => return reject(stream, RequestTag::FileDelete, &e).await,
        Err(e) => return Err(e.into()),
    };

    let dequeued = ctx.queue.remove(&id);
    let removed = match ctx.archive.remove(&id) {
        Ok(removed) => removed,
        Err(e) => return reject(stream, RequestTag::FileDelete, &e).await,
    };
    let blob_deleted = match ctx.archive.delete_blob(&id) {
        Ok(deleted) => deleted,
        Err(e) => {
            tracing::warn!(file = %id, error = %e, "handlers: blob delete failed");
            false
        }
    };
    tracing::info!(file = %id, removed, blob_deleted, dequeued, "handlers: delete");

    if !removed {
        wire::write_byte(stream, STATUS_DELETE_MISSING).await?;
        return Ok(());
    }
    wire::write_byte(stream, STATUS_DELETED).await?;
    if role == PeerRole::Client {
        cascade(ctx, Cascade::Delete(id));
    }
    Ok(())
}

async fn meta_download(stream: &mut TcpStream, ctx: &NodeContext) -> Result<()> {
    match ctx.archive.list_all() {
        Ok(records) => {
            wire::write_byte(stream, STATUS_SENDING).await?;
            wire::write_json(stream, &records).await?;
            tracing::debug!(records = records.len(), "handlers: metadata sent");
            Ok(())
        }
        Err(e) => reject(stream, RequestTag::MetaDownload, &e).await,
    }
}

/// meta-update has no reply, so nothing here can answer `STATUS_ERROR`
/// without desynchronising the client. Failures close the connection.
async fn meta_update(stream: &mut TcpStream, role: PeerRole, ctx: &NodeContext) -> Result<()> {
    let incoming: FileRecord = wire::within(ctx.idle_timeout, wire::read_json(stream)).await?;
    let record = ctx
        .archive
        .update(&incoming.id, |existing| merge_meta_update(&incoming, existing.as_ref()))?;
    tracing::debug!(file = %record.id, locations = record.server_locations.len(), "handlers: metadata updated");
    if role == PeerRole::Client {
        cascade(ctx, Cascade::MetaUpdate(record));
    }
    Ok(())
}

/// A client mutation forwarded to every other known node.
#[derive(Clone)]
enum Cascade {
    /// Stamped record plus the bytes it describes.
    Push(FileRecord, Bytes),
    MetaUpdate(FileRecord),
    Delete(FileId),
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cascade::Push(record, data) => write!(f, "Push({}, {} bytes)", record.id, data.len()),
            Cascade::MetaUpdate(record) => write!(f, "MetaUpdate({})", record.id),
            Cascade::Delete(id) => write!(f, "Delete({id})"),
        }
    }
}

/// Forward `op` in the background. The client's reply is already sent;
/// per-peer failures are logged and skipped.
fn cascade(ctx: &NodeContext, op: Cascade) {
    let ctx = ctx.clone();
    let span = tracing::info_span!("cascade", node = %ctx.node_id);
    tokio::spawn(
        async move {
            let peers = ctx.peers.discover().await;
            let mut forwarded = 0usize;
            for candidate in peers.iter().filter(|c| c.peer.id != ctx.node_id) {
                match forward(&ctx, candidate.addr, &op).await {
                    Ok(()) => forwarded += 1,
                    Err(e) => {
                        tracing::warn!(peer = %candidate.addr, error = %e, "cascade: peer failed");
                    }
                }
            }
            tracing::debug!(?op, peers = peers.len(), forwarded, "cascade: done");
        }
        .instrument(span),
    );
}

async fn forward(ctx: &NodeContext, addr: SocketAddr, op: &Cascade) -> crate::client::Result<()> {
    let mut client = PeerClient::connect(addr, PeerRole::Server, ctx.connect_timeout)
        .await?
        .with_io_timeout(ctx.idle_timeout);
    match op {
        Cascade::Push(record, data) => {
            // Identical bytes already there: the record still has to land.
            if client.push_file(record, data).await? == PushOutcome::Duplicate {
                client.update_meta(record).await?;
            }
        }
        Cascade::MetaUpdate(record) => client.update_meta(record).await?,
        Cascade::Delete(id) => {
            client.delete_file(id).await?;
        }
    }
    client.close().await
}
