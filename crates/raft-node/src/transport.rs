//! # transport
//!
//! why: carry raft messages between nodes without ever stalling the driver
//! relations: owned by driver.rs; inbound envelopes go to the driver's message queue
//! what: Transport trait and TcpTransport, length-prefixed json frames over tcp
//!
//! every frame is a 4-byte big-endian length followed by one json Envelope.
//! each peer gets its own writer task with a bounded queue; when the queue is
//! full new messages are dropped and raft's retransmission covers the loss.

use crate::config::TransportConfig;
use parking_lot::Mutex;
use raft_core::{Envelope, NodeId, PeerDescriptor};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// delivery of envelopes to peers; no method may block
pub trait Transport: Send {
    fn send(&mut self, messages: Vec<Envelope>);

    /// start delivering to `peer`; re-adding with a new address replaces the old one
    fn add_peer(&mut self, peer: &PeerDescriptor);

    fn remove_peer(&mut self, id: NodeId);

    /// peers that have failed repeatedly since they last accepted a connection
    fn unreachable_peers(&self) -> Vec<NodeId> {
        Vec::new()
    }

    fn shutdown(&mut self);
}

// -- framing --

/// refuses, before writing anything, a frame the remote would reject as too large
pub(crate) async fn write_frame<W>(writer: &mut W, envelope: &Envelope, max_frame_bytes: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit of {}", body.len(), max_frame_bytes),
        ));
    }
    let len = u32::try_from(body.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

pub(crate) async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> io::Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, max_frame_bytes),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// -- peer health --

/// consecutive connection failures per peer
#[derive(Debug, Clone)]
struct PeerHealth {
    failures: Arc<Mutex<HashMap<NodeId, u32>>>,
    threshold: u32,
}

impl PeerHealth {
    fn track(&self, peer: NodeId) {
        self.failures.lock().insert(peer, 0);
    }

    /// failures of peers no longer tracked are ignored
    fn failed(&self, peer: NodeId) {
        let mut failures = self.failures.lock();
        let Some(count) = failures.get_mut(&peer) else {
            return;
        };
        *count += 1;
        if *count == self.threshold {
            warn!(peer, failures = *count, "peer unreachable");
        }
    }

    fn connected(&self, peer: NodeId) {
        let mut failures = self.failures.lock();
        let Some(count) = failures.get_mut(&peer) else {
            return;
        };
        if *count >= self.threshold {
            info!(peer, "peer reachable again");
        }
        *count = 0;
    }

    fn forget(&self, peer: NodeId) {
        self.failures.lock().remove(&peer);
    }

    fn unreachable(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .failures
            .lock()
            .iter()
            .filter(|(_, count)| **count >= self.threshold)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort_unstable();
        peers
    }
}

// -- tcp transport --

#[derive(Debug)]
struct PeerHandle {
    address: String,
    queue: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct TcpTransport {
    id: NodeId,
    config: TransportConfig,
    local_addr: SocketAddr,
    peers: HashMap<NodeId, PeerHandle>,
    health: PeerHealth,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// accept connections on `listener`, forwarding every decoded envelope to `inbound`
    ///
    /// must be called inside a tokio runtime
    pub fn start(
        id: NodeId,
        listener: TcpListener,
        inbound: mpsc::Sender<Envelope>,
        config: TransportConfig,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(id, listener, inbound, cancel.clone(), config.max_frame_bytes));
        info!(node_id = id, addr = %local_addr, "transport listening");
        let health = PeerHealth { failures: Arc::default(), threshold: config.unreachable_after_failures.max(1) };
        Ok(Self { id, config, local_addr, peers: HashMap::new(), health, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, messages: Vec<Envelope>) {
        for envelope in messages {
            let to = envelope.to;
            let Some(peer) = self.peers.get(&to) else {
                debug!(peer = to, "no route to peer, dropping message");
                continue;
            };
            if let Err(e) = peer.queue.try_send(envelope) {
                match e {
                    mpsc::error::TrySendError::Full(_) => debug!(peer = to, "peer queue full, dropping message"),
                    mpsc::error::TrySendError::Closed(_) => debug!(peer = to, "peer writer stopped"),
                }
            }
        }
    }

    fn add_peer(&mut self, peer: &PeerDescriptor) {
        if peer.id == self.id {
            return;
        }
        if let Some(existing) = self.peers.get(&peer.id) {
            if existing.address == peer.address {
                return;
            }
            self.remove_peer(peer.id);
        }
        let (queue, rx) = mpsc::channel(self.config.peer_queue_capacity);
        let cancel = self.cancel.child_token();
        let writer = PeerWriter {
            peer: peer.id,
            address: peer.address.clone(),
            queue: rx,
            cancel: cancel.clone(),
            health: self.health.clone(),
            backoff_min: Duration::from_millis(self.config.reconnect_backoff_min_ms),
            backoff_max: Duration::from_millis(self.config.reconnect_backoff_max_ms.max(self.config.reconnect_backoff_min_ms)),
            delivery_attempts: self.config.delivery_attempts.max(1),
            max_frame_bytes: self.config.max_frame_bytes,
        };
        self.health.track(peer.id);
        tokio::spawn(writer.run());
        debug!(node_id = self.id, peer = peer.id, address = %peer.address, "added peer");
        self.peers.insert(peer.id, PeerHandle { address: peer.address.clone(), queue, cancel });
    }

    fn remove_peer(&mut self, id: NodeId) {
        if let Some(handle) = self.peers.remove(&id) {
            handle.cancel.cancel();
            self.health.forget(id);
            debug!(node_id = self.id, peer = id, "removed peer");
        }
    }

    fn unreachable_peers(&self) -> Vec<NodeId> {
        self.health.unreachable()
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        self.peers.clear();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    id: NodeId,
    listener: TcpListener,
    inbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(node_id = id, %remote, "accepted connection");
                    tokio::spawn(read_loop(stream, inbound.clone(), cancel.child_token(), max_frame_bytes));
                }
                Err(e) => {
                    warn!(node_id = id, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!(node_id = id, "listener stopped");
}

async fn read_loop(
    mut stream: TcpStream,
    inbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut stream, max_frame_bytes) => frame,
        };
        match frame {
            Ok(envelope) => match inbound.try_send(envelope) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => debug!("inbound queue full, dropping message"),
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!(error = %e, "dropping connection");
                break;
            }
        }
    }
}

/// owns the connection to one peer
///
/// a message whose connect or write fails is kept and resent after the backoff,
/// up to `delivery_attempts` tries; newer messages wait in the queue meanwhile
struct PeerWriter {
    peer: NodeId,
    address: String,
    queue: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    health: PeerHealth,
    backoff_min: Duration,
    backoff_max: Duration,
    delivery_attempts: u32,
    max_frame_bytes: usize,
}

impl PeerWriter {
    async fn run(mut self) {
        let mut stream: Option<TcpStream> = None;
        let mut backoff = self.backoff_min;
        let mut retry: Option<(Envelope, u32)> = None;
        loop {
            let (envelope, attempts) = match retry.take() {
                Some(pending) => pending,
                None => tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    next = self.queue.recv() => match next {
                        Some(envelope) => (envelope, 0),
                        None => break,
                    },
                },
            };

            if stream.is_none() {
                match self.connect().await {
                    Ok(connected) => {
                        backoff = self.backoff_min;
                        stream = Some(connected);
                    }
                    Err(reason) => {
                        debug!(peer = self.peer, address = %self.address, %reason, "connect failed");
                        self.health.failed(self.peer);
                        retry = self.keep_for_retry(envelope, attempts + 1);
                        if !self.pause(backoff).await {
                            break;
                        }
                        backoff = (backoff * 2).min(self.backoff_max);
                        continue;
                    }
                }
            }
            let Some(connection) = stream.as_mut() else {
                continue;
            };

            match write_frame(connection, &envelope, self.max_frame_bytes).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                    warn!(peer = self.peer, error = %e, "dropping message too large to send");
                }
                Err(e) => {
                    debug!(peer = self.peer, error = %e, "write failed, reconnecting");
                    self.health.failed(self.peer);
                    stream = None;
                    retry = self.keep_for_retry(envelope, attempts + 1);
                    if !self.pause(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
        debug!(peer = self.peer, "peer writer stopped");
    }

    async fn connect(&self) -> std::result::Result<TcpStream, String> {
        match tokio::time::timeout(self.backoff_max, TcpStream::connect(&self.address)).await {
            Ok(Ok(connected)) => {
                if let Err(e) = connected.set_nodelay(true) {
                    debug!(peer = self.peer, error = %e, "could not disable nagle");
                }
                self.health.connected(self.peer);
                Ok(connected)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("connect timed out".to_string()),
        }
    }

    fn keep_for_retry(&self, envelope: Envelope, attempts: u32) -> Option<(Envelope, u32)> {
        if attempts >= self.delivery_attempts {
            debug!(peer = self.peer, attempts, "giving up on message");
            return None;
        }
        Some((envelope, attempts))
    }

    /// false when cancelled during the wait
    async fn pause(&self, backoff: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(backoff) => true,
        }
    }
}
