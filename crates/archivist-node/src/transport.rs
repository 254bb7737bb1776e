//! Data-port listener: accept loop, handshake, connection limit.

use std::sync::Arc;

use archivist_protocol::{PeerRole, ACCEPT_TOKEN, BUSY_TOKEN};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};

use crate::context::NodeContext;
use crate::handlers;
use crate::wire;

/// Bounds the number of connections served at once.
///
/// A permit lives inside the connection task, so it is released on every
/// exit path including a panic.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    slots: Arc<Semaphore>,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Take a slot without waiting. `None` when the server is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    pub fn active(&self) -> usize {
        self.max - self.slots.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Accept connections on `listener` until shutdown.
pub async fn serve(listener: TcpListener, ctx: NodeContext, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let Some(permit) = ctx.limiter.try_acquire() else {
                            tracing::warn!(%remote, max = ctx.limiter.max(), "transport: busy, refusing connection");
                            tokio::spawn(refuse(stream));
                            continue;
                        };
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            tracing::debug!(%remote, active = ctx.limiter.active(), "transport: connection accepted");
                            if let Err(e) = accept(stream, &ctx).await {
                                tracing::debug!(%remote, error = %e, "transport: connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("transport: accept error: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("transport: listener stopped");
                break;
            }
        }
    }
}

async fn refuse(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(&BUSY_TOKEN).await {
        tracing::debug!("transport: could not send busy token: {e}");
    }
    let _ = stream.shutdown().await;
}

async fn accept(mut stream: TcpStream, ctx: &NodeContext) -> Result<(), handlers::HandlerError> {
    stream.write_all(&ACCEPT_TOKEN).await.map_err(wire_io)?;
    let role = wire::within(ctx.idle_timeout, wire::read_byte(&mut stream)).await?;
    let role = PeerRole::from_byte(role);
    handlers::serve_connection(stream, role, ctx).await
}

fn wire_io(e: std::io::Error) -> handlers::HandlerError {
    handlers::HandlerError::Protocol(e.into())
}
