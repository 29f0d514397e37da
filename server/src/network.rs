//! Transport seam between the server loop and the peer-to-peer session.
//!
//! The core only ever asks the transport to deliver an opaque frame to a
//! peer on a numbered channel; everything else (session membership, relays,
//! lobby lifecycle) stays behind the [`Transport`] trait. Outbound traffic
//! goes through an mpsc queue drained by its own task so the server loop
//! never blocks on a slow peer. A UDP adapter ships as the default
//! deployment backend, and a loopback implementation backs the tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use shared::framing;
use shared::{PeerId, WireValue};

/// One raw frame pulled off the transport.
#[derive(Debug)]
pub struct InboundFrame {
    pub peer: PeerId,
    pub channel: u8,
    pub bytes: Vec<u8>,
}

/// Events the transport feeds into the server loop.
#[derive(Debug)]
pub enum ServerEvent {
    Frame(InboundFrame),
    PeerDisconnected(PeerId),
}

/// Messages queued for the sender task.
#[derive(Debug)]
pub enum Outbound {
    Send {
        peer: PeerId,
        channel: u8,
        frame: Vec<u8>,
    },
    Fanout {
        peers: Vec<PeerId>,
        channel: u8,
        frame: Vec<u8>,
    },
    Shutdown,
}

/// Narrow send contract the core depends on.
pub trait Transport: Send + Sync + 'static {
    /// Deliver one opaque frame. Must not block; implementations drop the
    /// frame (and log) under backpressure.
    fn send(&self, peer: PeerId, channel: u8, frame: &[u8]);
}

/// Handle the dispatcher and scheduler use to queue outgoing packets.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send_to(&self, peer: PeerId, packet: &WireValue) {
        self.send_on(peer, framing::CHANNEL_GAME, packet);
    }

    pub fn send_on(&self, peer: PeerId, channel: u8, packet: &WireValue) {
        match framing::pack(packet) {
            Ok(frame) => {
                if self
                    .tx
                    .send(Outbound::Send {
                        peer,
                        channel,
                        frame,
                    })
                    .is_err()
                {
                    debug!("sender task gone, dropping packet for {}", peer);
                }
            }
            Err(e) => error!("failed to pack packet for {}: {}", peer, e),
        }
    }

    pub fn fanout(&self, peers: Vec<PeerId>, packet: &WireValue) {
        if peers.is_empty() {
            return;
        }
        match framing::pack(packet) {
            Ok(frame) => {
                if self
                    .tx
                    .send(Outbound::Fanout {
                        peers,
                        channel: framing::CHANNEL_GAME,
                        frame,
                    })
                    .is_err()
                {
                    debug!("sender task gone, dropping broadcast");
                }
            }
            Err(e) => error!("failed to pack broadcast packet: {}", e),
        }
    }

    /// Asks the sender task to drain its queue and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown);
    }
}

/// Spawns the task that drains the outbound queue onto the transport.
pub fn spawn_sender(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                Outbound::Send {
                    peer,
                    channel,
                    frame,
                } => transport.send(peer, channel, &frame),
                Outbound::Fanout {
                    peers,
                    channel,
                    frame,
                } => {
                    for peer in peers {
                        transport.send(peer, channel, &frame);
                    }
                }
                Outbound::Shutdown => break,
            }
        }
    })
}

/// In-memory transport that records every frame, for tests.
#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<(PeerId, u8, Vec<u8>)>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns everything sent so far.
    pub fn take_sent(&self) -> Vec<(PeerId, u8, Vec<u8>)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, peer: PeerId, channel: u8, frame: &[u8]) {
        self.sent.lock().unwrap().push((peer, channel, frame.to_vec()));
    }
}

/// How long a peer may stay silent before the adapter declares it gone.
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct PeerTable {
    by_peer: HashMap<PeerId, SocketAddr>,
    by_addr: HashMap<SocketAddr, PeerId>,
    last_seen: HashMap<PeerId, Instant>,
    next_id: u64,
}

impl PeerTable {
    fn peer_for(&mut self, addr: SocketAddr) -> (PeerId, bool) {
        if let Some(peer) = self.by_addr.get(&addr) {
            let peer = *peer;
            self.last_seen.insert(peer, Instant::now());
            return (peer, false);
        }
        self.next_id += 1;
        let peer = PeerId(self.next_id);
        self.by_addr.insert(addr, peer);
        self.by_peer.insert(peer, addr);
        self.last_seen.insert(peer, Instant::now());
        (peer, true)
    }

    fn drop_peer(&mut self, peer: PeerId) {
        if let Some(addr) = self.by_peer.remove(&peer) {
            self.by_addr.remove(&addr);
        }
        self.last_seen.remove(&peer);
    }

    fn timed_out(&self) -> Vec<PeerId> {
        self.last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() > PEER_TIMEOUT)
            .map(|(peer, _)| *peer)
            .collect()
    }
}

/// UDP deployment adapter.
///
/// Datagram layout is one channel byte followed by the gzip frame. Peer
/// identifiers are handed out per source address on first sight and retired
/// after [`PEER_TIMEOUT`] of silence.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerTable>>,
}

impl UdpTransport {
    pub async fn bind(addr: &str) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("transport listening on {}", addr);
        Ok(Arc::new(Self {
            socket,
            peers: Arc::new(Mutex::new(PeerTable::default())),
        }))
    }

    /// Spawns the ingest loop and the peer timeout checker.
    pub fn spawn_tasks(&self, events: mpsc::UnboundedSender<ServerEvent>) {
        self.spawn_ingest(events.clone());
        self.spawn_timeout_checker(events);
    }

    fn spawn_ingest(&self, events: mpsc::UnboundedSender<ServerEvent>) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            let mut buffer = [0u8; 65536];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if len < 2 {
                            debug!("runt datagram from {}", addr);
                            continue;
                        }
                        let (peer, new) = peers.lock().unwrap().peer_for(addr);
                        if new {
                            debug!("peer {} appeared from {}", peer, addr);
                        }
                        let frame = InboundFrame {
                            peer,
                            channel: buffer[0],
                            bytes: buffer[1..len].to_vec(),
                        };
                        if events.send(ServerEvent::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    fn spawn_timeout_checker(&self, events: mpsc::UnboundedSender<ServerEvent>) {
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let timed_out = {
                    let mut peers = peers.lock().unwrap();
                    let gone = peers.timed_out();
                    for peer in &gone {
                        peers.drop_peer(*peer);
                    }
                    gone
                };
                for peer in timed_out {
                    info!("peer {} timed out", peer);
                    if events.send(ServerEvent::PeerDisconnected(peer)).is_err() {
                        return;
                    }
                }
            }
        });
    }
}

impl Transport for UdpTransport {
    fn send(&self, peer: PeerId, channel: u8, frame: &[u8]) {
        let addr = match self.peers.lock().unwrap().by_peer.get(&peer) {
            Some(addr) => *addr,
            None => {
                debug!("no address for peer {}, dropping frame", peer);
                return;
            }
        };
        let mut datagram = Vec::with_capacity(frame.len() + 1);
        datagram.push(channel);
        datagram.extend_from_slice(frame);
        match self.socket.try_send_to(&datagram, addr) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // peer is slow; dropping beats stalling the sender task
                debug!("socket busy, dropped frame for {}", peer);
            }
            Err(e) => warn!("failed to send to {}: {}", peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::framing::CHANNEL_GAME;
    use std::collections::HashMap as StdHashMap;

    fn chat() -> WireValue {
        let mut map = StdHashMap::new();
        map.insert("type".to_string(), WireValue::from("message"));
        WireValue::Mapping(map)
    }

    #[test]
    fn test_outbox_send_reaches_transport() {
        let transport = Arc::new(LoopbackTransport::new());
        let (outbox, rx) = Outbox::new();
        outbox.send_to(PeerId(5), &chat());
        outbox.shutdown();

        let handle = {
            let transport: Arc<dyn Transport> = transport.clone();
            tokio_test::block_on(async move {
                let handle = spawn_sender(transport, rx);
                handle.await
            })
        };
        assert!(handle.is_ok());

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        let (peer, channel, frame) = &sent[0];
        assert_eq!(*peer, PeerId(5));
        assert_eq!(*channel, CHANNEL_GAME);
        assert_eq!(framing::unpack(frame).expect("frame decodes"), chat());
    }

    #[test]
    fn test_outbox_fanout_hits_every_peer() {
        let transport = Arc::new(LoopbackTransport::new());
        let (outbox, rx) = Outbox::new();
        outbox.fanout(vec![PeerId(1), PeerId(2), PeerId(3)], &chat());
        outbox.shutdown();

        tokio_test::block_on(async {
            let transport: Arc<dyn Transport> = transport.clone();
            let _ = spawn_sender(transport, rx).await;
        });

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 3);
        let peers: Vec<PeerId> = sent.iter().map(|(p, _, _)| *p).collect();
        assert_eq!(peers, vec![PeerId(1), PeerId(2), PeerId(3)]);
    }

    #[test]
    fn test_peer_table_reuses_ids_per_address() {
        let mut table = PeerTable::default();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let (first, new_first) = table.peer_for(addr);
        let (second, new_second) = table.peer_for(addr);
        assert!(new_first);
        assert!(!new_second);
        assert_eq!(first, second);

        table.drop_peer(first);
        let (third, new_third) = table.peer_for(addr);
        assert!(new_third);
        assert_ne!(first, third);
    }
}
