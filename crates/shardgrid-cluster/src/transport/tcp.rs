//! TCP transport.
//!
//! Frames are newline-delimited JSON `{ "from": "host:port", "message": .. }`.
//! Each peer gets a writer task that owns the outbound connection: it
//! connects lazily when a message is queued, raises `Associated` once
//! connected, and raises `Disassociated` when the connection drops.
//! Inbound connections are only read; the sender's identity comes from the
//! frame, not the socket address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use shardgrid_core::NodeAddress;

use super::{EventSender, Transport, TransportError, TransportEvent};
use crate::gossip::GossipMessage;

/// Longest accepted frame, newline excluded.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub from: NodeAddress,
    pub message: GossipMessage,
}

struct TcpInner {
    local: NodeAddress,
    events: EventSender,
    /// Per-peer outbound queues, each drained by a writer task.
    outbound: Mutex<HashMap<NodeAddress, mpsc::UnboundedSender<GossipMessage>>>,
    connect_timeout: Duration,
}

/// Gossip transport over plain TCP.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    /// Create a transport for `local` that reports into `events`.
    ///
    /// Must be called within a tokio runtime; writer tasks are spawned on
    /// first use.
    pub fn new(local: NodeAddress, events: EventSender) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                local,
                events,
                outbound: Mutex::new(HashMap::new()),
                connect_timeout: Duration::from_secs(5),
            }),
        }
    }

    pub fn local_address(&self) -> &NodeAddress {
        &self.inner.local
    }

    /// Accept inbound connections on `listener` until `shutdown` flips.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        match listener.local_addr() {
            Ok(addr) => info!(listen = %addr, node = %self.inner.local, "gossip listener started"),
            Err(e) => warn!(error = %e, "gossip listener has no local address"),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, remote)) => {
                            trace!(%remote, "accepted gossip connection");
                            let events = self.inner.events.clone();
                            tokio::spawn(read_inbound(socket, remote, events));
                        }
                        Err(e) => warn!(error = %e, "failed to accept gossip connection"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("gossip listener shutting down");
                    break;
                }
            }
        }
    }

    /// Bind `listen` and serve it in a background task.
    pub async fn bind(
        &self,
        listen: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<tokio::task::JoinHandle<()>, TransportError> {
        let listener = TcpListener::bind(listen).await?;
        let transport = self.clone();
        Ok(tokio::spawn(async move {
            transport.serve(listener, shutdown).await;
        }))
    }

    fn queue_for(&self, to: &NodeAddress) -> mpsc::UnboundedSender<GossipMessage> {
        let mut outbound = self.inner.outbound.lock().expect("outbound lock");
        if let Some(tx) = outbound.get(to) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_peer_writer(
            self.inner.local.clone(),
            to.clone(),
            rx,
            self.inner.events.clone(),
            self.inner.connect_timeout,
        ));
        outbound.insert(to.clone(), tx.clone());
        tx
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: &NodeAddress, message: GossipMessage) -> Result<(), TransportError> {
        self.queue_for(to)
            .send(message)
            .map_err(|_| TransportError::Closed)
    }
}

/// An established outbound connection.
struct PeerConnection {
    writer: OwnedWriteHalf,
    closed: Arc<AtomicBool>,
}

impl PeerConnection {
    /// Split `stream` and watch its read half for the peer hanging up.
    fn open(stream: TcpStream, peer: NodeAddress, events: EventSender) -> Self {
        let (mut reader, writer) = stream.into_split();
        let closed = Arc::new(AtomicBool::new(false));

        let watcher_closed = closed.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            if !watcher_closed.swap(true, Ordering::AcqRel) {
                let _ = events.send(TransportEvent::Disassociated(peer));
            }
        });

        Self { writer, closed }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Mark closed; returns true if this call did the closing.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

async fn connect(peer: &NodeAddress, timeout: Duration) -> Result<TcpStream, TransportError> {
    let attempt = TcpStream::connect((peer.host.as_str(), peer.port));
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(TransportError::Io(e)),
        Err(_) => Err(TransportError::Unreachable(peer.clone())),
    }
}

async fn run_peer_writer(
    local: NodeAddress,
    peer: NodeAddress,
    mut queue: mpsc::UnboundedReceiver<GossipMessage>,
    events: EventSender,
    connect_timeout: Duration,
) {
    let mut conn: Option<PeerConnection> = None;

    while let Some(message) = queue.recv().await {
        if conn.as_ref().is_some_and(PeerConnection::is_closed) {
            conn = None;
        }

        if conn.is_none() {
            match connect(&peer, connect_timeout).await {
                Ok(stream) => {
                    debug!(%peer, "connected to peer");
                    conn = Some(PeerConnection::open(stream, peer.clone(), events.clone()));
                    let _ = events.send(TransportEvent::Associated(peer.clone()));
                }
                Err(e) => {
                    debug!(%peer, error = %e, "peer unreachable, dropping gossip");
                    continue;
                }
            }
        }

        let Some(active) = conn.as_mut() else {
            continue;
        };
        let frame = Frame {
            from: local.clone(),
            message,
        };
        if let Err(e) = active.write_frame(&frame).await {
            debug!(%peer, error = %e, "gossip write failed");
            if active.close() {
                let _ = events.send(TransportEvent::Disassociated(peer.clone()));
            }
            conn = None;
        }
    }

    trace!(%peer, "peer writer stopped");
}

async fn read_inbound(socket: TcpStream, remote: SocketAddr, events: EventSender) {
    let mut reader = BufReader::new(socket);
    let mut line = Vec::new();
    loop {
        line.clear();
        let limit = MAX_FRAME_BYTES as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.last() != Some(&b'\n') && line.len() > MAX_FRAME_BYTES {
                    warn!(%remote, limit = MAX_FRAME_BYTES, "gossip frame too long, closing connection");
                    break;
                }
                let frame = line.trim_ascii();
                if frame.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<Frame>(frame) {
                    Ok(frame) => {
                        let event = TransportEvent::Received {
                            from: frame.from,
                            message: frame.message,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%remote, error = %e, "discarding malformed gossip frame"),
                }
            }
            Err(e) => {
                debug!(%remote, error = %e, "gossip connection read failed");
                break;
            }
        }
    }
    trace!(%remote, "inbound gossip connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseReport;
    use crate::transport::{event_channel, EventReceiver};
    use shardgrid_core::{ClusterPhase, EntityGroupPhase};

    async fn bound_transport(
        shutdown: watch::Receiver<bool>,
    ) -> (TcpTransport, EventReceiver) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = event_channel();
        let transport = TcpTransport::new(NodeAddress::new("127.0.0.1", port), tx);
        let serving = transport.clone();
        tokio::spawn(async move { serving.serve(listener, shutdown).await });
        (transport, rx)
    }

    fn report() -> PhaseReport {
        PhaseReport {
            local_phase: ClusterPhase::Starting,
            target_phase: ClusterPhase::Running,
            group_phases: vec![EntityGroupPhase::Created],
        }
    }

    #[test]
    fn frame_wire_format() {
        let frame = Frame {
            from: NodeAddress::new("10.0.0.1", 6000),
            message: GossipMessage::hello(report(), Some("c".into())),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            json,
            r#"{"from":"10.0.0.1:6000","message":{"local_phase":1,"target_phase":2,"group_phases":[1],"cookie":"c"}}"#
        );
    }

    #[tokio::test]
    async fn sends_frames_between_nodes() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (a, mut a_events) = bound_transport(stop_rx.clone()).await;
        let (b, mut b_events) = bound_transport(stop_rx).await;

        let message = GossipMessage::hello(report(), Some("c".into()));
        a.send(b.local_address(), message.clone()).unwrap();

        assert_eq!(
            a_events.recv().await,
            Some(TransportEvent::Associated(b.local_address().clone()))
        );
        assert_eq!(
            b_events.recv().await,
            Some(TransportEvent::Received {
                from: a.local_address().clone(),
                message,
            })
        );
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_fail_send() {
        let (tx, mut rx) = event_channel();
        let transport = TcpTransport::new(NodeAddress::new("127.0.0.1", 1), tx);

        // Nothing listens on port 1; the send itself is still accepted.
        transport
            .send(&NodeAddress::new("127.0.0.1", 1), GossipMessage::status(report()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (b, mut b_events) = bound_transport(stop_rx).await;

        let mut raw = TcpStream::connect((b.local_address().host.as_str(), b.local_address().port))
            .await
            .unwrap();
        let good = Frame {
            from: NodeAddress::new("127.0.0.1", 9),
            message: GossipMessage::status(report()),
        };
        let mut payload = b"{not json}\n".to_vec();
        payload.extend(serde_json::to_vec(&good).unwrap());
        payload.push(b'\n');
        raw.write_all(&payload).await.unwrap();

        assert_eq!(
            b_events.recv().await,
            Some(TransportEvent::Received {
                from: good.from,
                message: good.message,
            })
        );
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (b, mut b_events) = bound_transport(stop_rx).await;

        let mut raw = TcpStream::connect((b.local_address().host.as_str(), b.local_address().port))
            .await
            .unwrap();
        // No newline, well past the limit.
        let junk = vec![b'x'; MAX_FRAME_BYTES + 1024];
        let _ = raw.write_all(&junk).await;

        // The reader hangs up instead of buffering further.
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), raw.read(&mut buf))
            .await
            .expect("connection should be closed");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(b_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_shutdown_raises_disassociated() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (a, mut a_events) = bound_transport(stop_rx).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = NodeAddress::new("127.0.0.1", port);

        a.send(&peer, GossipMessage::status(report())).unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        assert_eq!(
            a_events.recv().await,
            Some(TransportEvent::Associated(peer.clone()))
        );

        drop(socket);
        drop(listener);
        assert_eq!(
            a_events.recv().await,
            Some(TransportEvent::Disassociated(peer))
        );
    }
}
