//! Outbound side of the data protocol.
//!
//! Used by the replicator and cascades (peer-server role) and by the CLI
//! (plain-client role). One `PeerClient` is one connection; requests on it
//! are strictly sequential.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use archivist_protocol::{
    FileId, FileRecord, PeerRole, ProtocolError, RequestTag, ACCEPT_TOKEN, BUSY_TOKEN, DEFAULTS,
    STATUS_ACCEPT, STATUS_DELETED, STATUS_DELETE_MISSING, STATUS_DUPLICATE, STATUS_ERROR,
    STATUS_MISSING, STATUS_NO_FREE_SPACE, STATUS_SENDING, TAG_LEN,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::wire;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server busy")]
    Busy,
    #[error("unexpected handshake token {0:?}")]
    UnexpectedToken([u8; TAG_LEN]),
    #[error("{request}: unexpected status byte {status}")]
    UnexpectedStatus { request: RequestTag, status: u8 },
    #[error("{0}: server reported an error")]
    ServerError(RequestTag),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// How the server answered a file-push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Bytes were sent.
    Transferred,
    /// Server already had identical content. No bytes moved.
    Duplicate,
    /// Server refused for lack of space.
    NoFreeSpace,
}

pub struct PeerClient {
    stream: TcpStream,
    addr: SocketAddr,
    io_timeout: Duration,
}

impl PeerClient {
    /// Connect and complete the handshake.
    pub async fn connect(addr: SocketAddr, role: PeerRole, connect_timeout: Duration) -> Result<Self> {
        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;

        let token = tokio::time::timeout(connect_timeout, wire::read_token(&mut stream))
            .await
            .map_err(|_| ClientError::Timeout)??;
        if token == BUSY_TOKEN {
            return Err(ClientError::Busy);
        }
        if token != ACCEPT_TOKEN {
            return Err(ClientError::UnexpectedToken(token));
        }
        wire::write_byte(&mut stream, role.as_byte()).await?;

        Ok(Self {
            stream,
            addr,
            io_timeout: Duration::from_secs(DEFAULTS.idle_timeout_secs),
        })
    }

    /// Bound every following request by `timeout`.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn timed<T>(io_timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(io_timeout, fut)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Fetch a blob. `None` when the server does not hold it.
    pub async fn pull_file(&mut self, id: &FileId) -> Result<Option<Vec<u8>>> {
        let stream = &mut self.stream;
        Self::timed(self.io_timeout, async move {
            stream.write_all(&RequestTag::FilePull.wire()).await?;
            wire::write_id(stream, id).await?;
            stream.flush().await?;
            match wire::read_byte(stream).await? {
                STATUS_SENDING => Ok(Some(wire::read_blob(stream).await?)),
                STATUS_MISSING => Ok(None),
                status => Err(status_error(RequestTag::FilePull, status)),
            }
        })
        .await
    }

    /// Offer `record`, then send `data` if the server asks for it.
    pub async fn push_file(&mut self, record: &FileRecord, data: &[u8]) -> Result<PushOutcome> {
        let stream = &mut self.stream;
        Self::timed(self.io_timeout, async move {
            stream.write_all(&RequestTag::FilePush.wire()).await?;
            wire::write_json(stream, record).await?;
            match wire::read_byte(stream).await? {
                STATUS_ACCEPT => {
                    wire::write_blob(stream, data).await?;
                    Ok(PushOutcome::Transferred)
                }
                STATUS_DUPLICATE => Ok(PushOutcome::Duplicate),
                STATUS_NO_FREE_SPACE => Ok(PushOutcome::NoFreeSpace),
                status => Err(status_error(RequestTag::FilePush, status)),
            }
        })
        .await
    }

    /// Returns whether the server knew the file.
    pub async fn delete_file(&mut self, id: &FileId) -> Result<bool> {
        let stream = &mut self.stream;
        Self::timed(self.io_timeout, async move {
            stream.write_all(&RequestTag::FileDelete.wire()).await?;
            wire::write_id(stream, id).await?;
            stream.flush().await?;
            match wire::read_byte(stream).await? {
                STATUS_DELETED => Ok(true),
                STATUS_DELETE_MISSING => Ok(false),
                status => Err(status_error(RequestTag::FileDelete, status)),
            }
        })
        .await
    }

    /// The server's whole metadata document.
    pub async fn download_meta(&mut self) -> Result<Vec<FileRecord>> {
        let stream = &mut self.stream;
        Self::timed(self.io_timeout, async move {
            stream.write_all(&RequestTag::MetaDownload.wire()).await?;
            stream.flush().await?;
            match wire::read_byte(stream).await? {
                STATUS_SENDING => Ok(wire::read_json(stream).await?),
                status => Err(status_error(RequestTag::MetaDownload, status)),
            }
        })
        .await
    }

    /// Upsert `record` on the server. There is no reply.
    pub async fn update_meta(&mut self, record: &FileRecord) -> Result<()> {
        let stream = &mut self.stream;
        Self::timed(self.io_timeout, async move {
            stream.write_all(&RequestTag::MetaUpdate.wire()).await?;
            wire::write_json(stream, record).await?;
            Ok(())
        })
        .await
    }

    /// Close the write half so the server sees a clean end of stream.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn status_error(request: RequestTag, status: u8) -> ClientError {
    if status == STATUS_ERROR {
        ClientError::ServerError(request)
    } else {
        ClientError::UnexpectedStatus { request, status }
    }
}
