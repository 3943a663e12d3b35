use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};

use crate::types::NodeId;

/// Deadline for a single frame write; a stuck peer loses its connection.
const SEND_DEADLINE: Duration = Duration::from_secs(5);

/// Outbound queue depth per connection.
const CONN_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("connection to {0} is closed")]
    ConnectionClosed(SocketAddr),
    #[error("no usable listen address")]
    NoListener,
}

/// One newline-terminated frame received from a peer connection, tagged
/// with the remote endpoint it arrived on. Decoding is the overlay's job.
#[derive(Debug)]
pub struct InboundFrame {
    pub remote: SocketAddr,
    pub line: String,
}

struct ConnHandle {
    tx: mpsc::Sender<Vec<u8>>,
    /// First sender identity observed on this connection (set once).
    peer_id: Option<NodeId>,
}

/// Plain-TCP transport: a listener accepting inbound streams plus a dialer
/// with per-peer connection caching. Frames are newline-terminated lines;
/// each connection runs one reader task and one writer task.
#[derive(Clone)]
pub struct Transport {
    conns: Arc<RwLock<HashMap<SocketAddr, ConnHandle>>>,
    peer_index: Arc<RwLock<HashMap<NodeId, SocketAddr>>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    shutdown: watch::Receiver<bool>,
}

impl Transport {
    /// Create a transport and the channel its reader tasks feed.
    pub fn new(shutdown: watch::Receiver<bool>) -> (Self, mpsc::Receiver<InboundFrame>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let transport = Self {
            conns: Arc::new(RwLock::new(HashMap::new())),
            peer_index: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            shutdown,
        };
        (transport, inbound_rx)
    }

    /// Bind a listener and spawn the accept loop. Returns the bound
    /// address (useful when listening on port 0).
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let transport = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            tracing::debug!(%remote, "Accepted inbound stream");
                            transport.spawn_connection(remote, stream).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            break;
                        }
                    },
                }
            }
            tracing::debug!(addr = %local, "Listener stopped");
        });

        Ok(local)
    }

    /// Send one frame to a peer, reusing the cached connection for that
    /// peer (inbound or previously dialed) or dialing a new one.
    pub async fn send(
        &self,
        peer_id: &str,
        addr: SocketAddr,
        frame: Vec<u8>,
    ) -> Result<(), TransportError> {
        if let Some(tx) = self.sender_for(peer_id, addr).await {
            return tx
                .send(frame)
                .await
                .map_err(|_| TransportError::ConnectionClosed(addr));
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Dial { addr, source })?;
        let remote = stream.peer_addr().unwrap_or(addr);
        let tx = self.spawn_connection(remote, stream).await;
        self.bind_peer(remote, peer_id).await;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed(addr))
    }

    async fn sender_for(&self, peer_id: &str, addr: SocketAddr) -> Option<mpsc::Sender<Vec<u8>>> {
        let conns = self.conns.read().await;
        if let Some(conn_addr) = self.peer_index.read().await.get(peer_id) {
            if let Some(handle) = conns.get(conn_addr) {
                return Some(handle.tx.clone());
            }
        }
        conns.get(&addr).map(|handle| handle.tx.clone())
    }

    /// Associate a connection with the first sender identity seen on it.
    /// Later calls for the same connection are no-ops.
    pub async fn bind_peer(&self, remote: SocketAddr, peer_id: &str) {
        {
            let mut conns = self.conns.write().await;
            match conns.get_mut(&remote) {
                Some(handle) if handle.peer_id.is_none() => {
                    handle.peer_id = Some(peer_id.to_string());
                }
                Some(_) => return,
                None => return,
            }
        }
        let mut index = self.peer_index.write().await;
        index.entry(peer_id.to_string()).or_insert(remote);
    }

    /// The peer identity bound to a connection, if it has one yet.
    pub async fn peer_for(&self, remote: SocketAddr) -> Option<NodeId> {
        self.conns.read().await.get(&remote).and_then(|h| h.peer_id.clone())
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    async fn spawn_connection(&self, remote: SocketAddr, stream: TcpStream) -> mpsc::Sender<Vec<u8>> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(CONN_QUEUE);

        {
            let mut conns = self.conns.write().await;
            conns.insert(
                remote,
                ConnHandle {
                    tx: tx.clone(),
                    peer_id: None,
                },
            );
        }

        let transport = self.clone();
        tokio::spawn(async move {
            transport.write_loop(remote, write_half, rx).await;
        });

        let transport = self.clone();
        tokio::spawn(async move {
            transport.read_loop(remote, read_half).await;
        });

        tx
    }

    async fn write_loop(
        &self,
        remote: SocketAddr,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        while let Some(frame) = rx.recv().await {
            let write = async {
                write_half.write_all(&frame).await?;
                write_half.flush().await
            };
            match tokio::time::timeout(SEND_DEADLINE, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(%remote, error = %e, "Write failed, dropping connection");
                    break;
                }
                Err(_) => {
                    tracing::warn!(%remote, "Write deadline exceeded, dropping connection");
                    break;
                }
            }
        }
        self.drop_connection(remote).await;
    }

    async fn read_loop(&self, remote: SocketAddr, read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut lines = BufReader::new(read_half).lines();
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = lines.next_line() => match next {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        if self.inbound_tx.send(InboundFrame { remote, line }).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(%remote, error = %e, "Read failed, closing stream");
                        break;
                    }
                },
            }
        }
        self.drop_connection(remote).await;
    }

    /// Remove a connection from the maps. The peer stays in the peer table
    /// until stale eviction; the next send to it dials again.
    async fn drop_connection(&self, remote: SocketAddr) {
        let peer_id = {
            let mut conns = self.conns.write().await;
            conns.remove(&remote).and_then(|h| h.peer_id)
        };
        if let Some(id) = peer_id {
            let mut index = self.peer_index.write().await;
            if index.get(&id) == Some(&remote) {
                index.remove(&id);
            }
        }
    }
}
