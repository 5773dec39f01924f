use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use crate::config::EndPointConfig;
use crate::dispatcher::PayloadDispatcher;
use crate::engine::{new_engine, EngineStats, ReliabilityEngine};
use crate::packet::{Packet, PacketType};
use crate::sequence_number::SequenceNumber;
use crate::transport::DatagramTransport;

/// The reliable connection to a single peer
pub struct Connection {
    peer: SocketAddr,
    engine: Arc<dyn ReliabilityEngine>,
}

impl Connection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn engine(&self) -> &Arc<dyn ReliabilityEngine> {
        &self.engine
    }
}

#[derive(Default)]
struct Counters {
    datagrams_in: AtomicU64,
    datagrams_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    decode_errors: AtomicU64,
    send_errors: AtomicU64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct EndPointStats {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// received datagrams that were dropped because they did not decode
    pub decode_errors: u64,
    pub send_errors: u64,
    pub active_connections: usize,
}

impl Display for EndPointStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "datagrams in={} out={}, bytes in={} out={}, decode errors={}, send errors={}, connections={}",
               self.datagrams_in,
               self.datagrams_out,
               self.bytes_in,
               self.bytes_out,
               self.decode_errors,
               self.send_errors,
               self.active_connections,
        )
    }
}

/// Engine timestamps are taken from tokio's clock so they follow it when it is paused in tests
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// EndPoint is where the protocol meets the network: It receives datagrams on a transport,
///  decodes them and routes them to per-peer connections, sends ACK and handshake replies, and
///  periodically retransmits timed out packets.
///
/// A connection is created implicitly by the first packet from or to a peer. A SYN without
///  ACK flag starts a new connection, replacing an existing one for the same peer.
pub struct EndPoint {
    config: Arc<EndPointConfig>,
    transport: Arc<dyn DatagramTransport>,
    dispatcher: Arc<dyn PayloadDispatcher>,
    connections: RwLock<FxHashMap<SocketAddr, Arc<Connection>>>,
    counters: Counters,
    shutdown: watch::Sender<bool>,
}

impl EndPoint {
    pub async fn new(config: EndPointConfig, dispatcher: Arc<dyn PayloadDispatcher>) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;

        let socket = UdpSocket::bind(config.self_addr).await?;
        info!("bound socket to {:?}", socket.local_addr()?);
        Self::with_transport(config, Arc::new(socket), dispatcher)
    }

    pub fn with_transport(config: EndPointConfig, transport: Arc<dyn DatagramTransport>, dispatcher: Arc<dyn PayloadDispatcher>) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(EndPoint {
            config: Arc::new(config),
            transport,
            dispatcher,
            connections: Default::default(),
            counters: Default::default(),
            shutdown,
        }))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Starts a new connection to a peer, discarding any previous connection state for it
    pub async fn connect(&self, peer: SocketAddr) -> anyhow::Result<()> {
        info!("connecting to {:?}", peer);
        self.new_connection(peer).await?;
        self.send_packet(peer, &Packet::syn(SequenceNumber::ZERO)).await;
        Ok(())
    }

    /// Sends a payload as a single DATA packet. Fails without sending anything if the send
    ///  window is full, in which case the caller should retry after some time.
    pub async fn send(&self, peer: SocketAddr, payload: impl Into<Bytes>) -> anyhow::Result<SequenceNumber> {
        let payload = payload.into();
        if payload.len() > Packet::MAX_PAYLOAD_SIZE {
            bail!("payload of {} bytes exceeds the maximum of {} bytes", payload.len(), Packet::MAX_PAYLOAD_SIZE);
        }

        let connection = self.get_or_create_connection(peer).await?;
        let packet = connection.engine.send_data_at(payload, now())?;
        self.send_packet(peer, &packet).await;
        Ok(packet.sequence_number())
    }

    pub async fn close(&self, peer: SocketAddr) -> anyhow::Result<()> {
        let Some(connection) = self.connections.write().await.remove(&peer) else {
            bail!("no connection to {:?}", peer);
        };
        info!("closing connection to {:?}", peer);
        self.send_packet(peer, &Packet::fin(connection.engine.next_sequence_number())).await;
        Ok(())
    }

    pub async fn connection(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&peer).cloned()
    }

    pub async fn connection_stats(&self, peer: SocketAddr) -> Option<EngineStats> {
        self.connection(peer).await
            .map(|c| c.engine.stats())
    }

    pub async fn stats(&self) -> EndPointStats {
        EndPointStats {
            datagrams_in: self.counters.datagrams_in.load(Ordering::Acquire),
            datagrams_out: self.counters.datagrams_out.load(Ordering::Acquire),
            bytes_in: self.counters.bytes_in.load(Ordering::Acquire),
            bytes_out: self.counters.bytes_out.load(Ordering::Acquire),
            decode_errors: self.counters.decode_errors.load(Ordering::Acquire),
            send_errors: self.counters.send_errors.load(Ordering::Acquire),
            active_connections: self.connections.read().await.len(),
        }
    }

    /// Runs the receive, retransmission and statistics loops as tokio tasks until [EndPoint::shutdown]
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let recv = self.clone();
        let retransmit = self.clone();
        let stats = self.clone();
        vec![
            tokio::spawn(async move { recv.recv_loop().await }),
            tokio::spawn(async move { retransmit.retransmit_loop().await }),
            tokio::spawn(async move { stats.stats_loop().await }),
        ]
    }

    /// Signals all loops to terminate. They finish the iteration they are in, which takes at
    ///  most one interval.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.send_replace(true);
    }

    fn is_shut_down(shutdown: &watch::Receiver<bool>) -> bool {
        *shutdown.borrow()
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; self.config.receive_buffer_len];

        while !Self::is_shut_down(&shutdown) {
            let (num_read, from) = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.transport.recv_from(&mut buf) => match result {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                },
            };
            self.on_datagram(from, &buf[..num_read]).await;
        }
        info!("receive loop stopped");
    }

    pub async fn retransmit_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !Self::is_shut_down(&shutdown) {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            self.retransmit_timed_out().await;
        }
        debug!("retransmission loop stopped");
    }

    pub async fn stats_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.stats_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !Self::is_shut_down(&shutdown) {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            info!("end point: {}", self.stats().await);
            for connection in self.all_connections().await {
                info!("connection {:?}: {}", connection.peer, connection.engine.stats());
            }
        }
        debug!("statistics loop stopped");
    }

    async fn retransmit_timed_out(&self) {
        let now = now();
        for connection in self.all_connections().await {
            for packet in connection.engine.timed_out_packets(now) {
                debug!("retransmitting {} to {:?}", packet, connection.peer);
                self.send_packet(connection.peer, &packet).await;
            }
        }
    }

    async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
        self.counters.datagrams_in.fetch_add(1, Ordering::AcqRel);
        self.counters.bytes_in.fetch_add(buf.len() as u64, Ordering::AcqRel);

        let packet = match Packet::deser(buf) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, e);
                self.counters.decode_errors.fetch_add(1, Ordering::AcqRel);
                return;
            }
        };
        trace!("received {} from {:?}", packet, from);

        match packet.packet_type() {
            PacketType::Data => self.on_data(from, packet).await,
            PacketType::Ack => self.on_ack(from, packet).await,
            PacketType::Syn => self.on_syn(from, packet).await,
            PacketType::Fin => {
                if !packet.has_ack() {
                    self.send_packet(from, &Packet::fin_ack(SequenceNumber::ZERO, packet.sequence_number().next())).await;
                }
                if self.connections.write().await.remove(&from).is_some() {
                    info!("connection closed by {:?}", from);
                }
            }
            PacketType::Rst => {
                if self.connections.write().await.remove(&from).is_some() {
                    info!("connection reset by {:?}", from);
                }
            }
        }
    }

    async fn on_data(&self, from: SocketAddr, packet: Packet) {
        let connection = match self.get_or_create_connection(from).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("could not create connection for {:?}: {}", from, e);
                return;
            }
        };

        let ack = Packet::ack(packet.sequence_number().next());
        match connection.engine.receive(packet) {
            Ok(released) => {
                // duplicates are ACKed as well: the previous ACK may have been lost
                self.send_packet(from, &ack).await;
                self.dispatch(from, released).await;
            }
            Err(e) => debug!("packet from {:?} rejected and not acknowledged: {}", from, e),
        }
    }

    async fn on_ack(&self, from: SocketAddr, packet: Packet) {
        let Some(connection) = self.connection(from).await else {
            debug!("ACK from {:?} without connection - dropping", from);
            return;
        };
        if let Err(e) = connection.engine.handle_ack_at(&packet, now()) {
            warn!("invalid ACK from {:?}: {}", from, e);
        }
    }

    async fn on_syn(&self, from: SocketAddr, packet: Packet) {
        let connection = if packet.has_ack() {
            // reply to our own SYN
            self.get_or_create_connection(from).await
        }
        else {
            info!("new connection from {:?}", from);
            self.new_connection(from).await
        };
        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                error!("could not create connection for {:?}: {}", from, e);
                return;
            }
        };

        match connection.engine.receive(packet.clone()) {
            Ok(released) => self.dispatch(from, released).await,
            Err(e) => debug!("SYN from {:?} rejected: {}", from, e),
        }

        if !packet.has_ack() {
            self.send_packet(from, &Packet::syn_ack(SequenceNumber::ZERO, packet.sequence_number().next())).await;
        }
    }

    async fn dispatch(&self, from: SocketAddr, packets: Vec<Packet>) {
        for packet in packets {
            self.dispatcher.on_payload(from, packet.payload().clone()).await;
        }
    }

    async fn send_packet(&self, to: SocketAddr, packet: &Packet) {
        trace!("sending {} to {:?}", packet, to);
        let buf = packet.to_bytes();
        match self.transport.send_to(&buf, to).await {
            Ok(num_sent) => {
                self.counters.datagrams_out.fetch_add(1, Ordering::AcqRel);
                self.counters.bytes_out.fetch_add(num_sent as u64, Ordering::AcqRel);
            }
            Err(e) => {
                error!("error sending datagram to {:?}: {}", to, e);
                self.counters.send_errors.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    async fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await
            .values()
            .cloned()
            .collect()
    }

    fn create_connection(&self, peer: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        Ok(Arc::new(Connection {
            peer,
            engine: new_engine(self.config.engine_kind, self.config.reliability.clone())?,
        }))
    }

    async fn new_connection(&self, peer: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        let connection = self.create_connection(peer)?;
        self.connections.write().await.insert(peer, connection.clone());
        Ok(connection)
    }

    async fn get_or_create_connection(&self, peer: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        if let Some(connection) = self.connection(peer).await {
            return Ok(connection);
        }

        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get(&peer) {
            return Ok(connection.clone());
        }
        debug!("new connection for {:?}", peer);
        let connection = self.create_connection(peer)?;
        connections.insert(peer, connection.clone());
        Ok(connection)
    }
}
