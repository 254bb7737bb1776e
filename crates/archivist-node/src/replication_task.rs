//! Replication background task -- push queued files to the emptiest peer.
//!
//! One loop per node:
//!   1. Queue empty -> wait for a wake signal or the idle interval
//!   2. Drain a batch, discover peers (none -> requeue, back off)
//!   3. Per file: pick a target, push record + blob, save the new location
//!      locally, tell every other peer about it

use std::net::SocketAddr;
use std::time::Duration;

use archivist_protocol::{FileId, FileRecord, PeerRole};
use archivist_replication::{merge_meta_update, Candidate, ReplicationConfig, ReplicationEngine};
use rand::Rng;
use tokio::sync::broadcast;

use crate::client::{PeerClient, PushOutcome};
use crate::context::NodeContext;

/// What happened to one queued id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Pushed and the record now has enough copies.
    Done,
    /// Pushed, but more copies are wanted.
    Again,
    /// Record or blob is gone, or already replicated enough.
    Dropped,
    /// Nothing was pushed. Try again later.
    Failed,
}

/// Run the replication loop until shutdown.
pub async fn run_replication_loop(
    ctx: NodeContext,
    engine: ReplicationEngine,
    mut shutdown: broadcast::Receiver<()>,
) {
    let config = engine.config().clone();
    let idle = Duration::from_secs(config.idle_interval_secs);
    tracing::info!(
        batch_size = config.batch_size,
        target_copies = config.target_copies,
        pending = ctx.queue.len(),
        "replication: started"
    );

    loop {
        if ctx.queue.is_empty() {
            tokio::select! {
                _ = ctx.wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.recv() => break,
            }
            continue;
        }

        let batch = ctx.queue.drain(config.batch_size);
        let mut candidates = ctx.peers.discover().await;
        candidates.retain(|c| c.peer.id != ctx.node_id);

        if candidates.is_empty() {
            ctx.queue.requeue(batch.iter().copied());
            let delay = backoff_delay(&config);
            tracing::info!(
                pending = ctx.queue.len(),
                retry_in_ms = delay.as_millis() as u64,
                "replication: no peers"
            );
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
            continue;
        }

        let mut failed = 0usize;
        for id in &batch {
            match replicate_one(&ctx, &engine, *id, &mut candidates).await {
                Step::Done | Step::Dropped => {}
                Step::Again => ctx.queue.enqueue(*id),
                Step::Failed => {
                    ctx.queue.enqueue(*id);
                    failed += 1;
                }
            }
        }

        // Every id bounced; do not spin on the same batch.
        if failed == batch.len() {
            let delay = backoff_delay(&config);
            tracing::debug!(failed, retry_in_ms = delay.as_millis() as u64, "replication: batch failed");
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }
    }

    tracing::info!(pending = ctx.queue.len(), "replication: stopped");
}

async fn replicate_one(
    ctx: &NodeContext,
    engine: &ReplicationEngine,
    id: FileId,
    candidates: &mut [Candidate<SocketAddr>],
) -> Step {
    let record = match ctx.archive.lookup(&id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::debug!(file = %id, "replication: record gone, dropping");
            return Step::Dropped;
        }
        Err(e) => {
            tracing::warn!(file = %id, error = %e, "replication: lookup failed");
            return Step::Failed;
        }
    };
    if engine.is_satisfied(&record) {
        return Step::Dropped;
    }
    let data = match ctx.archive.read_blob(&id) {
        Ok(Some(data)) => data,
        Ok(None) => {
            tracing::debug!(file = %id, "replication: blob gone, dropping");
            return Step::Dropped;
        }
        Err(e) => {
            tracing::warn!(file = %id, error = %e, "replication: blob read failed");
            return Step::Failed;
        }
    };

    let Some(idx) = engine.select_target(&record, candidates) else {
        return Step::Failed;
    };
    let target = candidates[idx].clone();
    let updated = record.with_location(target.peer.id);

    match push_to(ctx, target.addr, &updated, &data).await {
        Ok(PushOutcome::Transferred) | Ok(PushOutcome::Duplicate) => {}
        Ok(PushOutcome::NoFreeSpace) => {
            tracing::info!(file = %id, peer = %target.addr, "replication: target is full");
            candidates[idx].peer.free_space = 0;
            return Step::Failed;
        }
        Err(e) => {
            tracing::warn!(file = %id, peer = %target.addr, error = %e, "replication: push failed");
            return Step::Failed;
        }
    }
    ReplicationEngine::charge(&mut candidates[idx], data.len() as u64);

    let updated = match ctx
        .archive
        .update(&id, |current| merge_meta_update(&updated, current.as_ref()))
    {
        Ok(saved) => saved,
        Err(e) => {
            tracing::warn!(file = %id, error = %e, "replication: local record update failed");
            updated
        }
    };
    tracing::info!(
        file = %id,
        peer = %target.addr,
        target = %target.peer.id,
        bytes = data.len(),
        locations = updated.server_locations.len(),
        "replication: file replicated"
    );

    propagate(ctx, &updated, candidates, &target).await;

    if engine.is_satisfied(&updated) {
        Step::Done
    } else {
        Step::Again
    }
}

/// Push over a fresh peer-server connection. A target that already holds
/// identical bytes still gets the new record.
async fn push_to(
    ctx: &NodeContext,
    addr: SocketAddr,
    record: &FileRecord,
    data: &[u8],
) -> crate::client::Result<PushOutcome> {
    let mut client = PeerClient::connect(addr, PeerRole::Server, ctx.connect_timeout)
        .await?
        .with_io_timeout(ctx.idle_timeout);
    let outcome = client.push_file(record, data).await?;
    if outcome == PushOutcome::Duplicate {
        client.update_meta(record).await?;
    }
    client.close().await?;
    Ok(outcome)
}

/// Best-effort meta-update to every discovered peer except the target.
async fn propagate(
    ctx: &NodeContext,
    record: &FileRecord,
    candidates: &[Candidate<SocketAddr>],
    target: &Candidate<SocketAddr>,
) {
    for peer in candidates.iter().filter(|c| c.peer.id != target.peer.id) {
        if let Err(e) = send_meta(ctx, peer.addr, record).await {
            tracing::debug!(file = %record.id, peer = %peer.addr, error = %e, "replication: meta-update failed");
        }
    }
}

async fn send_meta(ctx: &NodeContext, addr: SocketAddr, record: &FileRecord) -> crate::client::Result<()> {
    let mut client = PeerClient::connect(addr, PeerRole::Server, ctx.connect_timeout)
        .await?
        .with_io_timeout(ctx.idle_timeout);
    client.update_meta(record).await?;
    client.close().await
}

/// No-peers interval plus up to 10% jitter.
fn backoff_delay(config: &ReplicationConfig) -> Duration {
    let base_ms = config.no_peers_interval_secs.saturating_mul(1000);
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 10);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Returns true when shutdown arrived first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}
