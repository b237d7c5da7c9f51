//! One-envelope-per-connection TCP transport.
//!
//! A requester connects, writes one frame, reads one frame, and closes. A
//! role server binds once and handles every accepted connection on its own
//! task; a failing request never stops the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::codec::{self, CodecError, Message};
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::observability::{self, Outcome};

const LISTEN_BACKLOG: i32 = 128;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot resolve `{0}`")]
    Resolve(String),
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} closed the connection without a reply")]
    NoReply(String),
    #[error("frame: {0}")]
    Codec(#[from] CodecError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Request processing for one role.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Role name, for logs.
    fn role(&self) -> &str;

    /// Turn one request envelope into a response envelope.
    async fn handle(&self, peer: SocketAddr, request: Envelope) -> Result<Envelope, ProtocolError>;
}

pub async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|_| TransportError::Resolve(addr.to_string()))?
        .next()
        .ok_or_else(|| TransportError::Resolve(addr.to_string()))
}

/// Send one message and wait for the single reply.
///
/// Also returns the local address of the connection, which is the address
/// the peer observed for us.
pub async fn exchange(addr: &str, message: &Message) -> Result<(Message, SocketAddr), TransportError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect { addr: addr.to_string(), source })?;
    let local = stream.local_addr()?;

    codec::write_message(&mut stream, message).await?;
    observability::record_frame_sent();

    let reply = match codec::read_message(&mut stream).await {
        Ok(reply) => reply,
        Err(CodecError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::NoReply(addr.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    observability::record_frame_received();
    debug!(peer = %addr, kind = reply.kind(), "reply received");
    Ok((reply, local))
}

pub struct RoleListener {
    role: String,
    listener: TcpListener,
}

impl RoleListener {
    /// Bind with `SO_REUSEADDR` so a restarted role can reclaim its port.
    pub fn bind(role: &str, addr: SocketAddr) -> Result<Self, TransportError> {
        let bind_err = |source| TransportError::Bind { addr, source };
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        let listener = TcpListener::from_std(socket.into()).map_err(bind_err)?;

        info!(role, addr = %addr, "listening");
        Ok(Self { role: role.to_string(), listener })
    }

    pub async fn bind_to(role: &str, addr: &str) -> Result<Self, TransportError> {
        Self::bind(role, resolve(addr).await?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        observability::record_connection_accepted();
        debug!(role = %self.role, peer = %peer, "accepted");
        Ok((stream, peer))
    }

    /// Accept forever, one task per connection.
    pub async fn serve<H: Handler>(self, handler: Arc<H>) -> Result<(), TransportError> {
        loop {
            let (stream, peer) = match self.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(role = %self.role, error = %e, "accept failed");
                    continue;
                }
            };
            let handler = handler.clone();
            task::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, handler.as_ref()).await {
                    warn!(role = handler.role(), peer = %peer, error = %e, "connection failed");
                }
            });
        }
    }
}

/// Read one request, run the handler, write at most one reply.
pub async fn handle_connection<H>(mut stream: TcpStream, peer: SocketAddr, handler: &H) -> Result<(), TransportError>
where
    H: Handler + ?Sized,
{
    let _closed = scopeguard::guard((), |_| observability::record_connection_closed());
    let role = handler.role();

    let request = codec::read_message(&mut stream).await;
    observability::record_frame_received();
    let result = match request {
        Ok(Message::Envelope(envelope)) => {
            debug!(role, peer = %peer, tickets = ?envelope.purposes(), "request");
            handler.handle(peer, envelope).await
        }
        Ok(Message::Rejected { .. }) => Err(ProtocolError::Malformed("request was a rejection".into())),
        Err(CodecError::Io(e)) => return Err(e.into()),
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(response) => {
            codec::write_message(&mut stream, &Message::Envelope(response)).await?;
            observability::record_frame_sent();
            observability::record_envelope_issued();
            info!(role, peer = %peer, "request served");
        }
        Err(e) if e.is_rejection() => {
            warn!(role, peer = %peer, class = e.class(), error = %e, "request rejected");
            observability::record_failure(Outcome::Rejected);
            observability::record_rejection_class(e.class());
            let reply = Message::Rejected { reason: e.class().to_string() };
            codec::write_message(&mut stream, &reply).await?;
            observability::record_frame_sent();
        }
        Err(e) => {
            error!(role, peer = %peer, class = e.class(), error = %e, "request aborted");
            observability::record_failure(Outcome::Aborted);
        }
    }
    Ok(())
}
