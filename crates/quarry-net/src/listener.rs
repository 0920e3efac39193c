//! Accept loop that turns incoming sockets into server-side connections.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use quarry_protocol::{Packet, PacketSide};

use crate::connection::{Connection, ConnectionConfig, ConnectionHandle, Handler};

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum live connections. Default: 64.
    pub max_connections: usize,
    /// Settings for each accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections: 64,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Builds the primary handler for each accepted connection.
pub type HandlerFactory<P> = dyn Fn(ConnectionId, SocketAddr) -> Box<dyn Handler<P>> + Send + Sync;

type ConnectionMap<P> = Arc<Mutex<HashMap<ConnectionId, ConnectionHandle<P>>>>;

/// A bound listening socket with its accept thread.
pub struct Listener<P: Packet> {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    connections: ConnectionMap<P>,
    thread: Option<JoinHandle<()>>,
}

impl<P: Packet> Listener<P> {
    /// Bind and start accepting.
    pub fn bind(config: ListenerConfig, factory: Arc<HandlerFactory<P>>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        tracing::info!("operator server listening on {local_addr}");

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections: ConnectionMap<P> = Arc::new(Mutex::new(HashMap::new()));

        let accept = AcceptLoop {
            listener,
            config,
            factory,
            ids: IdGenerator::new(),
            shutdown: Arc::clone(&shutdown),
            connections: Arc::clone(&connections),
        };
        let thread = thread::Builder::new()
            .name("listener".into())
            .spawn(move || accept.run())?;

        Ok(Self {
            local_addr,
            shutdown,
            connections,
            thread: Some(thread),
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections not yet closed.
    pub fn live_connections(&self) -> usize {
        let mut map = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, c| !c.is_closed());
        map.len()
    }

    /// Stop accepting and exit every live connection.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let handles: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, c)| c)
            .collect();
        for handle in &handles {
            handle.exit("Server shutting down.");
        }
        for handle in &handles {
            handle.join();
        }
        tracing::info!("operator server stopped");
    }
}

impl<P: Packet> Drop for Listener<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct AcceptLoop<P: Packet> {
    listener: TcpListener,
    config: ListenerConfig,
    factory: Arc<HandlerFactory<P>>,
    ids: IdGenerator,
    shutdown: Arc<AtomicBool>,
    connections: ConnectionMap<P>,
}

impl<P: Packet> AcceptLoop<P> {
    fn run(self) {
        for incoming in self.listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let peer = match stream.peer_addr() {
                Ok(peer) => peer,
                Err(_) => continue,
            };

            let mut map = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, c| !c.is_closed());
            if map.len() >= self.config.max_connections {
                tracing::warn!("connection limit reached, rejecting {peer}");
                continue;
            }

            let id = self.ids.next_id();
            let handler = (self.factory)(id, peer);
            let connection = Connection::new(
                format!("op-{}", id.0),
                PacketSide::Server,
                self.config.connection.clone(),
                handler,
            );
            match connection.start(stream) {
                Ok(handle) => {
                    tracing::info!("accepted connection {id:?} from {peer}");
                    map.insert(id, handle);
                }
                Err(e) => tracing::warn!(error = %e, "failed to start connection from {peer}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use quarry_protocol::game::{GamePacket, KeepAlive};

    use crate::connection::{HandlerContext, HandlerError};
    use crate::framing::{self, FrameConfig};
    use crate::compression::CompressionConfig;

    struct Echo;

    impl Handler<GamePacket> for Echo {
        fn on_packet(&mut self, packet: &GamePacket, ctx: &mut HandlerContext<'_, GamePacket>) -> Result<(), HandlerError> {
            ctx.send(packet.clone())?;
            Ok(())
        }
    }

    #[test]
    fn test_id_generator_is_monotonic() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), ConnectionId(1));
        assert_eq!(ids.next_id(), ConnectionId(2));
    }

    #[test]
    fn test_accepts_and_echoes() {
        let factory: Arc<HandlerFactory<GamePacket>> =
            Arc::new(|_: ConnectionId, _: SocketAddr| -> Box<dyn Handler<GamePacket>> { Box::new(Echo) });
        let mut listener = Listener::bind(ListenerConfig::default(), factory).unwrap();

        let stream = TcpStream::connect(listener.local_addr()).unwrap();
        let (mut reader, mut writer) =
            framing::split(stream, FrameConfig::default(), CompressionConfig::default()).unwrap();
        let (id, body) = GamePacket::from(KeepAlive { id: 42 }).encode();
        writer.write_frame(id, &body, false).unwrap();

        let frame = reader.read_frame(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(GamePacket::decode(frame.type_id, &frame.payload).unwrap(), KeepAlive { id: 42 }.into());
        assert_eq!(listener.live_connections(), 1);

        listener.shutdown();
        let deadline = Instant::now() + Duration::from_secs(5);
        let closed = loop {
            match reader.read_frame(Duration::from_millis(50)) {
                Err(_) => break true,
                Ok(_) if Instant::now() > deadline => break false,
                Ok(_) => {}
            }
        };
        assert!(closed);
    }
}
