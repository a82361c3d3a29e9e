//! PSK frontend: terminates device TLS and relays plaintext to a local service
//!
//! Each accepted connection runs on its own task: handshake, backend connect,
//! then a byte relay until either side closes or fails. A failing session
//! never affects its neighbours.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants::SESSION_BUFFER_SIZE;
use crate::error::FlashError;
use crate::psk::PskAcceptor;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub backend: SocketAddr,
    pub started: DateTime<Utc>,
}

/// Live sessions across every frontend
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionInfo>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: SessionInfo) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(id, info);
        id
    }

    /// Remove a session; false if it was already gone
    pub fn remove(&self, id: u64) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Why a relay stopped
#[derive(Debug)]
pub enum SessionEnd {
    /// One side read zero bytes
    Closed,
    Failed(FlashError),
}

enum Step {
    FromDevice(io::Result<usize>),
    FromBackend(io::Result<usize>),
}

/// Copy bytes both ways until one side closes or errors, then shut down both
pub async fn relay<D, B>(mut device: D, mut backend: B) -> SessionEnd
where
    D: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut device_buf = vec![0u8; SESSION_BUFFER_SIZE];
    let mut backend_buf = vec![0u8; SESSION_BUFFER_SIZE];

    let end = loop {
        let step = tokio::select! {
            read = device.read(&mut device_buf) => Step::FromDevice(read),
            read = backend.read(&mut backend_buf) => Step::FromBackend(read),
        };

        let forwarded = match step {
            Step::FromDevice(Ok(0)) | Step::FromBackend(Ok(0)) => break SessionEnd::Closed,
            Step::FromDevice(Ok(n)) => backend.write_all(&device_buf[..n]).await,
            Step::FromBackend(Ok(n)) => device.write_all(&backend_buf[..n]).await,
            Step::FromDevice(Err(e)) | Step::FromBackend(Err(e)) => Err(e),
        };
        if let Err(e) = forwarded {
            break SessionEnd::Failed(FlashError::SessionIo(e));
        }
    };

    let _ = device.shutdown().await;
    let _ = backend.shutdown().await;
    end
}

/// Relay a registered session and drop it from the registry when it ends
pub async fn run_session<D, B>(registry: &SessionRegistry, id: u64, device: D, backend: B) -> SessionEnd
where
    D: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let end = relay(device, backend).await;
    match &end {
        SessionEnd::Closed => debug!(session = id, "Session closed"),
        SessionEnd::Failed(e) => warn!(session = id, "Session error: {}", e),
    }
    registry.remove(id);
    end
}

/// One TLS-PSK listener paired with one plaintext backend
pub struct PskFrontend {
    listener: TcpListener,
    backend: SocketAddr,
    acceptor: Arc<PskAcceptor>,
    registry: Arc<SessionRegistry>,
}

impl PskFrontend {
    pub async fn bind(
        listen: SocketAddr,
        backend: SocketAddr,
        acceptor: Arc<PskAcceptor>,
        registry: Arc<SessionRegistry>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        info!("PSK frontend listening on {} -> {}", listener.local_addr()?, backend);
        Ok(Self {
            listener,
            backend,
            acceptor,
            registry,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` turns true; sessions in flight keep running
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let port = self.listener.local_addr()?.port();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(port, "Accept failed: {}", e);
                            continue;
                        }
                    };
                    info!(port, "New client from {}", peer);
                    tokio::spawn(handle_client(
                        stream,
                        peer,
                        self.backend,
                        Arc::clone(&self.acceptor),
                        Arc::clone(&self.registry),
                    ));
                }
                Ok(_) = shutdown.wait_for(|stop| *stop) => {
                    info!(port, "PSK frontend stopped accepting");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    backend: SocketAddr,
    acceptor: Arc<PskAcceptor>,
    registry: Arc<SessionRegistry>,
) {
    let Ok(tls) = acceptor.accept(stream).await else {
        // Already logged by the acceptor
        return;
    };

    let backend_stream = match TcpStream::connect(backend).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, "Backend {} unreachable: {}", backend, e);
            return;
        }
    };

    let id = registry.register(SessionInfo {
        peer,
        backend,
        started: Utc::now(),
    });
    debug!(session = id, %peer, active = registry.len(), "Session open");
    run_session(&registry, id, tls, backend_stream).await;
}
