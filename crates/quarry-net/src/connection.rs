//! Threaded packet connection with a replaceable primary handler.
//!
//! A [`Connection`] owns one socket. Once started, a dedicated thread runs a
//! cooperative loop: update handlers, read a bounded number of frames and
//! dispatch them, write a bounded number of queued packets, check the idle
//! timer, and finally tear down when an exit was requested. Other threads
//! talk to the loop through a cloneable [`ConnectionHandle`].

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use quarry_protocol::{Packet, PacketSide, ProtocolError};

use crate::cipher::CipherKey;
use crate::compression::CompressionConfig;
use crate::framing::{self, FrameConfig, FrameError, FramedReader, FramedWriter};

/// Exit reason used when the peer has been silent too long.
pub const TIMED_OUT: &str = "Timed out.";

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Silence after which the connection exits. Default: 30 s.
    pub idle_timeout: Duration,
    /// How long one read waits for a frame to start. Default: 5 ms.
    pub poll_timeout: Duration,
    /// Frames read per loop iteration. Default: 10.
    pub max_reads_per_tick: usize,
    /// Queued packets written per loop iteration. Default: 15.
    pub max_writes_per_tick: usize,
    /// Capacity of the outbound queue. Default: 4096.
    pub queue_capacity: usize,
    pub frame: FrameConfig,
    /// Compression used until negotiation changes it.
    pub compression: CompressionConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            poll_timeout: Duration::from_millis(5),
            max_reads_per_tick: 10,
            max_writes_per_tick: 15,
            queue_capacity: 4096,
            frame: FrameConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Build from the runtime configuration.
    pub fn from_config(config: &quarry_config::Config) -> Self {
        let net = &config.network;
        Self {
            idle_timeout: Duration::from_secs(net.idle_timeout_secs),
            poll_timeout: Duration::from_millis(net.poll_timeout_ms.max(1)),
            max_reads_per_tick: net.max_reads_per_tick,
            max_writes_per_tick: net.max_writes_per_tick,
            queue_capacity: net.queue_capacity,
            frame: FrameConfig {
                max_payload_size: net.max_payload_size,
                body_timeout: Duration::from_secs(net.body_timeout_secs.max(1)),
            },
            compression: CompressionConfig {
                threshold: config.compression.threshold,
                enabled: config.compression.enabled,
            },
        }
    }
}

/// Lifecycle of a connection. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connected = 1,
    Exiting = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Exiting,
            _ => ConnectionState::Closed,
        }
    }
}

/// Negotiated session parameters. Written during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub server_name: String,
    pub encryption_enabled: bool,
    /// Compression threshold, `None` when off.
    pub compression: Option<usize>,
    pub auth_enabled: bool,
}

/// Errors a handler reports to the connection loop. Any of them ends the
/// connection with the error text as exit reason.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A packet arrived that the current state does not accept.
    #[error("unexpected {packet} packet while {state}")]
    Unexpected {
        packet: &'static str,
        state: &'static str,
    },
    /// The peer refused the session.
    #[error("{0}")]
    Rejected(String),
    /// Identity or key agreement failed.
    #[error("identity check failed: {0}")]
    Identity(String),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cipher(#[from] crate::key_exchange::CipherError),
}

/// Errors returned when sending a packet.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The outbound queue is at capacity.
    #[error("outbound queue full")]
    QueueFull,
    /// The connection is exiting or closed.
    #[error("connection closed")]
    Closed,
    /// An instant write failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Session logic attached to a connection.
///
/// All methods run on the connection thread.
pub trait Handler<P: Packet>: Send {
    /// Called once per loop iteration before reading.
    fn update(&mut self, _ctx: &mut HandlerContext<'_, P>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called for every decoded inbound packet, in wire order.
    fn on_packet(&mut self, packet: &P, ctx: &mut HandlerContext<'_, P>) -> Result<(), HandlerError>;

    /// Called once when the connection tears down.
    fn on_exit(&mut self, _reason: &str) {}
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared<P> {
    name: String,
    local_side: PacketSide,
    state: AtomicU8,
    connected: AtomicBool,
    exit_reason: Mutex<Option<String>>,
    writer: Mutex<FramedWriter>,
    outbound: Sender<P>,
    session: Mutex<SessionInfo>,
}

impl<P: Packet> Shared<P> {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// First caller wins; later reasons are ignored.
    fn request_exit(&self, reason: &str) -> bool {
        let mut slot = lock(&self.exit_reason);
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason.to_owned());
        drop(slot);
        let _ = self.state.fetch_max(ConnectionState::Exiting as u8, Ordering::AcqRel);
        tracing::debug!(connection = %self.name, reason, "exit requested");
        true
    }

    fn fail(&self, err: &dyn std::fmt::Display) {
        self.connected.store(false, Ordering::Release);
        self.request_exit(&err.to_string());
    }

    fn is_running(&self) -> bool {
        self.state() < ConnectionState::Exiting
    }

    fn write_packet(&self, packet: &P) -> Result<(), FrameError> {
        let (id, body) = packet.encode();
        tracing::trace!(connection = %self.name, packet = packet.name(), len = body.len(), "write");
        lock(&self.writer).write_frame(id, &body, true)
    }

    fn queue(&self, packet: P) -> Result<(), SendError> {
        if !self.is_running() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Disconnected(_) => SendError::Closed,
        })
    }

    fn send_instant(&self, packet: &P) -> Result<(), SendError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.write_packet(packet).map_err(|e| {
            self.fail(&e);
            SendError::Frame(e)
        })
    }
}

// ---------------------------------------------------------------------------
// Handler context
// ---------------------------------------------------------------------------

/// What a handler may do to its connection.
pub struct HandlerContext<'a, P: Packet> {
    shared: &'a Shared<P>,
    reader: &'a mut FramedReader,
    replacement: &'a mut Option<Box<dyn Handler<P>>>,
}

impl<P: Packet> HandlerContext<'_, P> {
    /// Connection name, for logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Side this end of the connection plays.
    pub fn local_side(&self) -> PacketSide {
        self.shared.local_side
    }

    /// Queue a packet behind earlier queued traffic.
    pub fn send(&mut self, packet: impl Into<P>) -> Result<(), SendError> {
        self.shared.queue(packet.into())
    }

    /// Write a packet now, ahead of anything queued.
    pub fn send_instant(&mut self, packet: impl Into<P>) -> Result<(), SendError> {
        self.shared.send_instant(&packet.into())
    }

    /// Ask the connection to exit. The first reason wins.
    pub fn exit(&mut self, reason: impl AsRef<str>) {
        self.shared.request_exit(reason.as_ref());
    }

    /// Whether an exit has been requested.
    pub fn is_exiting(&self) -> bool {
        !self.shared.is_running()
    }

    /// Swap the primary handler once the current call returns.
    pub fn replace_primary(&mut self, handler: Box<dyn Handler<P>>) {
        *self.replacement = Some(handler);
    }

    /// Start the stream cipher in both directions.
    pub fn enable_encryption(&mut self, key: &CipherKey) {
        self.reader.enable_encryption(key);
        lock(&self.shared.writer).enable_encryption(key);
        lock(&self.shared.session).encryption_enabled = true;
        tracing::debug!(connection = %self.shared.name, "encryption enabled");
    }

    /// Apply a negotiated compression threshold; `None` disables it.
    pub fn set_compression(&mut self, threshold: Option<usize>) {
        lock(&self.shared.writer).set_compression(CompressionConfig::from_threshold(threshold));
        lock(&self.shared.session).compression = threshold;
    }

    /// Snapshot of the negotiated session.
    pub fn session(&self) -> SessionInfo {
        lock(&self.shared.session).clone()
    }

    /// Mutate the negotiated session.
    pub fn update_session(&mut self, f: impl FnOnce(&mut SessionInfo)) {
        f(&mut lock(&self.shared.session));
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cross-thread handle to a running connection.
pub struct ConnectionHandle<P: Packet> {
    shared: Arc<Shared<P>>,
    handlers: Sender<Box<dyn Handler<P>>>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<P: Packet> Clone for ConnectionHandle<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            handlers: self.handlers.clone(),
            thread: Arc::clone(&self.thread),
        }
    }
}

impl<P: Packet> ConnectionHandle<P> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether the socket is still believed usable.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Whether the loop has finished tearing down.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Reason the connection exited or is exiting.
    pub fn exit_reason(&self) -> Option<String> {
        lock(&self.shared.exit_reason).clone()
    }

    /// Ask the connection to exit. No-op if already exiting.
    pub fn exit(&self, reason: impl AsRef<str>) {
        self.shared.request_exit(reason.as_ref());
    }

    /// Queue a packet.
    pub fn send(&self, packet: impl Into<P>) -> Result<(), SendError> {
        self.shared.queue(packet.into())
    }

    /// Write a packet now.
    pub fn send_instant(&self, packet: impl Into<P>) -> Result<(), SendError> {
        self.shared.send_instant(&packet.into())
    }

    /// Attach a secondary handler. It sees packets from the next iteration on.
    pub fn add_handler(&self, handler: Box<dyn Handler<P>>) -> Result<(), SendError> {
        self.handlers.send(handler).map_err(|_| SendError::Closed)
    }

    pub fn session(&self) -> SessionInfo {
        lock(&self.shared.session).clone()
    }

    /// Block until the loop thread has finished.
    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(connection = %self.shared.name, "connection thread panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// An idle connection, not yet bound to a socket.
pub struct Connection<P: Packet> {
    name: String,
    local_side: PacketSide,
    config: ConnectionConfig,
    primary: Box<dyn Handler<P>>,
}

impl<P: Packet> Connection<P> {
    pub fn new(
        name: impl Into<String>,
        local_side: PacketSide,
        config: ConnectionConfig,
        primary: Box<dyn Handler<P>>,
    ) -> Self {
        Self {
            name: name.into(),
            local_side,
            config,
            primary,
        }
    }

    /// Open a socket to `addr` and start the loop.
    pub fn connect(self, addr: impl ToSocketAddrs) -> Result<ConnectionHandle<P>, FrameError> {
        let stream = TcpStream::connect(addr)?;
        self.start(stream)
    }

    /// Start the loop on an already connected socket.
    pub fn start(self, stream: TcpStream) -> Result<ConnectionHandle<P>, FrameError> {
        let (reader, writer) = framing::split(stream, self.config.frame.clone(), self.config.compression)?;
        let (outbound_tx, outbound_rx) = crossbeam_channel::bounded(self.config.queue_capacity);
        let (handler_tx, handler_rx) = crossbeam_channel::unbounded();

        let compression = self
            .config
            .compression
            .enabled
            .then_some(self.config.compression.threshold);
        let shared = Arc::new(Shared {
            name: self.name,
            local_side: self.local_side,
            state: AtomicU8::new(ConnectionState::Connected as u8),
            connected: AtomicBool::new(true),
            exit_reason: Mutex::new(None),
            writer: Mutex::new(writer),
            outbound: outbound_tx,
            session: Mutex::new(SessionInfo {
                compression,
                ..SessionInfo::default()
            }),
        });

        let event_loop = EventLoop {
            shared: Arc::clone(&shared),
            reader,
            primary: self.primary,
            secondary: Vec::new(),
            outbound: outbound_rx,
            new_handlers: handler_rx,
            config: self.config,
            last_packet: Instant::now(),
        };

        let thread = thread::Builder::new()
            .name(format!("conn-{}", shared.name))
            .spawn(move || event_loop.run())?;
        tracing::info!(connection = %shared.name, side = ?shared.local_side, "connected");

        Ok(ConnectionHandle {
            shared,
            handlers: handler_tx,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }
}

struct EventLoop<P: Packet> {
    shared: Arc<Shared<P>>,
    reader: FramedReader,
    primary: Box<dyn Handler<P>>,
    secondary: Vec<Box<dyn Handler<P>>>,
    outbound: Receiver<P>,
    new_handlers: Receiver<Box<dyn Handler<P>>>,
    config: ConnectionConfig,
    last_packet: Instant,
}

impl<P: Packet> EventLoop<P> {
    fn run(mut self) {
        loop {
            self.secondary.extend(self.new_handlers.try_iter());

            if self.shared.is_running() {
                self.update_handlers();
            }
            if self.shared.is_running() {
                self.read_frames();
            }
            if self.shared.is_running() {
                self.write_queued(self.config.max_writes_per_tick);
            }
            if self.shared.is_running() && self.last_packet.elapsed() > self.config.idle_timeout {
                tracing::warn!(connection = %self.shared.name, "no packets for {:?}", self.config.idle_timeout);
                self.shared.request_exit(TIMED_OUT);
            }
            if !self.shared.is_running() {
                self.teardown();
                return;
            }
        }
    }

    /// Run `f` against the primary handler, then every secondary handler.
    /// Every handler runs even if an earlier one failed; the first failure
    /// becomes the exit reason.
    fn each_handler(
        &mut self,
        mut f: impl FnMut(&mut Box<dyn Handler<P>>, &mut HandlerContext<'_, P>) -> Result<(), HandlerError>,
    ) {
        let mut replacement = None;
        let shared = &*self.shared;
        let handlers = std::iter::once(&mut self.primary).chain(self.secondary.iter_mut());
        for handler in handlers {
            let mut ctx = HandlerContext {
                shared,
                reader: &mut self.reader,
                replacement: &mut replacement,
            };
            if let Err(e) = f(handler, &mut ctx) {
                tracing::error!(connection = %shared.name, error = %e, "handler failed");
                shared.request_exit(&e.to_string());
            }
        }
        if let Some(next) = replacement {
            tracing::debug!(connection = %shared.name, "primary handler replaced");
            self.primary = next;
        }
    }

    fn update_handlers(&mut self) {
        self.each_handler(|h, ctx| h.update(ctx));
    }

    fn read_frames(&mut self) {
        for _ in 0..self.config.max_reads_per_tick {
            let frame = match self.reader.read_frame(self.config.poll_timeout) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(connection = %self.shared.name, error = %e, "read failed");
                    self.shared.fail(&e);
                    return;
                }
            };
            self.last_packet = Instant::now();

            let packet = match P::decode_inbound(frame.type_id, &frame.payload, self.shared.local_side) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::error!(
                        connection = %self.shared.name,
                        type_id = frame.type_id,
                        len = frame.payload.len(),
                        error = %e,
                        "protocol error"
                    );
                    self.shared.request_exit(&e.to_string());
                    return;
                }
            };
            tracing::trace!(connection = %self.shared.name, packet = packet.name(), "read");

            self.each_handler(|h, ctx| h.on_packet(&packet, ctx));
            if !self.shared.is_running() {
                return;
            }
        }
    }

    fn write_queued(&mut self, limit: usize) {
        for _ in 0..limit {
            let packet = match self.outbound.try_recv() {
                Ok(packet) => packet,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            };
            if let Err(e) = self.shared.write_packet(&packet) {
                tracing::warn!(connection = %self.shared.name, error = %e, "write failed");
                self.shared.fail(&e);
                return;
            }
        }
    }

    fn teardown(mut self) {
        let reason = lock(&self.shared.exit_reason).clone().unwrap_or_default();
        self.primary.on_exit(&reason);
        for handler in &mut self.secondary {
            handler.on_exit(&reason);
        }

        if self.shared.connected.load(Ordering::Acquire) {
            self.write_queued(usize::MAX);
        }
        lock(&self.shared.writer).shutdown();
        self.shared.connected.store(false, Ordering::Release);
        self.shared
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        tracing::info!(connection = %self.shared.name, reason = %reason, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    use quarry_protocol::game::{ChatMessage, Disconnect, GamePacket, KeepAlive, LoginRequest};

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").unwrap()
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            poll_timeout: Duration::from_millis(2),
            ..ConnectionConfig::default()
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Records every packet it sees.
    struct Recorder {
        seen: Arc<Mutex<Vec<GamePacket>>>,
    }

    impl Handler<GamePacket> for Recorder {
        fn on_packet(&mut self, packet: &GamePacket, _ctx: &mut HandlerContext<'_, GamePacket>) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(packet.clone());
            Ok(())
        }
    }

    /// Answers each keep-alive with the same ID.
    struct Echo;

    impl Handler<GamePacket> for Echo {
        fn on_packet(&mut self, packet: &GamePacket, ctx: &mut HandlerContext<'_, GamePacket>) -> Result<(), HandlerError> {
            if let GamePacket::KeepAlive(k) = packet {
                ctx.send(k.clone())?;
            }
            Ok(())
        }
    }

    fn start(
        side: PacketSide,
        stream: TcpStream,
        handler: Box<dyn Handler<GamePacket>>,
        config: ConnectionConfig,
    ) -> ConnectionHandle<GamePacket> {
        Connection::new(format!("{side:?}"), side, config, handler)
            .start(stream)
            .unwrap()
    }

    fn connected_pair(
        server_handler: Box<dyn Handler<GamePacket>>,
        client_handler: Box<dyn Handler<GamePacket>>,
    ) -> (ConnectionHandle<GamePacket>, ConnectionHandle<GamePacket>) {
        let listener = listener();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            start(PacketSide::Server, server, server_handler, fast_config()),
            start(PacketSide::Client, client, client_handler, fast_config()),
        )
    }

    #[test]
    fn test_queued_packets_dispatch_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (server, client) = connected_pair(
            Box::new(Echo),
            Box::new(Recorder {
                seen: Arc::clone(&seen),
            }),
        );

        for id in 0..40 {
            server.send(KeepAlive { id }).unwrap();
        }
        assert!(wait_until(|| seen.lock().unwrap().len() == 40));
        let ids: Vec<i64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|p| match p {
                GamePacket::KeepAlive(k) => k.id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, (0..40).collect::<Vec<_>>());

        client.exit("done");
        server.exit("done");
        client.join();
        server.join();
    }

    #[test]
    fn test_exit_is_idempotent_first_reason_wins() {
        let (server, client) = connected_pair(Box::new(Echo), Box::new(Echo));
        client.exit("first");
        client.exit("second");
        client.join();
        assert_eq!(client.exit_reason().as_deref(), Some("first"));
        assert!(client.is_closed());
        assert!(!client.is_connected());
        assert!(matches!(client.send(KeepAlive { id: 1 }), Err(SendError::Closed)));

        // The peer notices the close.
        server.join();
        assert!(server.is_closed());
    }

    #[test]
    fn test_idle_timeout() {
        let listener = listener();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();
        let config = ConnectionConfig {
            idle_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let handle = start(PacketSide::Client, client, Box::new(Echo), config);
        handle.join();
        assert_eq!(handle.exit_reason().as_deref(), Some(TIMED_OUT));
    }

    #[test]
    fn test_wrong_side_packet_is_fatal() {
        let listener = listener();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let handle = start(PacketSide::Client, client, Box::new(Echo), fast_config());

        // A client must never receive a LoginRequest.
        let (_, mut writer) = framing::split(server, FrameConfig::default(), CompressionConfig::default()).unwrap();
        let (id, body) = GamePacket::from(LoginRequest {
            username: "u".into(),
            group: "g".into(),
            password: "p".into(),
        })
        .encode();
        writer.write_frame(id, &body, false).unwrap();

        handle.join();
        assert!(handle.exit_reason().unwrap().contains("may not be sent"));
    }

    #[test]
    fn test_unknown_packet_id_is_fatal() {
        let listener = listener();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let handle = start(PacketSide::Client, client, Box::new(Echo), fast_config());

        let (_, mut writer) = framing::split(server, FrameConfig::default(), CompressionConfig::default()).unwrap();
        writer.write_frame(0x7F, &[], false).unwrap();

        handle.join();
        assert!(handle.exit_reason().unwrap().contains("unknown game packet id"));
    }

    /// Fails on the first chat message.
    struct Faulty;

    impl Handler<GamePacket> for Faulty {
        fn on_packet(&mut self, packet: &GamePacket, _ctx: &mut HandlerContext<'_, GamePacket>) -> Result<(), HandlerError> {
            match packet {
                GamePacket::ChatMessage(_) => Err(HandlerError::Rejected("bad chat".into())),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_handler_error_exits_after_all_handlers_ran() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (server, client) = connected_pair(Box::new(Echo), Box::new(Faulty));
        client
            .add_handler(Box::new(Recorder {
                seen: Arc::clone(&seen),
            }))
            .unwrap();
        // Give the loop an iteration to pick up the secondary handler.
        thread::sleep(Duration::from_millis(50));

        server.send(ChatMessage { message: "hi".into() }).unwrap();
        client.join();
        assert_eq!(client.exit_reason().as_deref(), Some("bad chat"));
        assert_eq!(seen.lock().unwrap().len(), 1);
        server.exit("done");
        server.join();
    }

    /// Swaps itself for a recorder after the first packet.
    struct Swapper {
        seen: Arc<Mutex<Vec<GamePacket>>>,
        swaps: Arc<AtomicUsize>,
    }

    impl Handler<GamePacket> for Swapper {
        fn on_packet(&mut self, _packet: &GamePacket, ctx: &mut HandlerContext<'_, GamePacket>) -> Result<(), HandlerError> {
            self.swaps.fetch_add(1, Ordering::SeqCst);
            ctx.replace_primary(Box::new(Recorder {
                seen: Arc::clone(&self.seen),
            }));
            Ok(())
        }
    }

    #[test]
    fn test_replace_primary() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let swaps = Arc::new(AtomicUsize::new(0));
        let (server, client) = connected_pair(
            Box::new(Echo),
            Box::new(Swapper {
                seen: Arc::clone(&seen),
                swaps: Arc::clone(&swaps),
            }),
        );
        for id in 0..3 {
            server.send(KeepAlive { id }).unwrap();
        }
        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        assert_eq!(swaps.load(Ordering::SeqCst), 1);
        client.exit("done");
        server.exit("done");
        client.join();
        server.join();
    }

    #[test]
    fn test_instant_send_and_teardown_flush() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (server, client) = connected_pair(
            Box::new(Recorder {
                seen: Arc::clone(&seen),
            }),
            Box::new(Echo),
        );
        client
            .send_instant(Disconnect {
                reason: "bye".into(),
            })
            .unwrap();
        client.send(KeepAlive { id: 9 }).unwrap();
        client.exit("leaving");
        client.join();

        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        assert!(matches!(seen.lock().unwrap()[0], GamePacket::Disconnect(_)));
        server.join();
    }
}
