//! Application handler of a logged-in account connection.

use quarry_net::{ConnectionHandle, Handler, HandlerContext, HandlerError, SendError};
use quarry_protocol::game::KeepAlive;
use quarry_protocol::{Dimension, GamePacket};
use quarry_query::{AccountId, AccountLink, LinkError};
use quarry_task::{Command, RuntimeHandle};

use crate::login::HandleSlot;

/// Packets held while the connection handle is not yet published.
const MAX_BACKLOG: usize = 256;

/// [`AccountLink`] over a running game connection.
pub struct ConnectionLink(pub ConnectionHandle<GamePacket>);

impl AccountLink for ConnectionLink {
    fn send(&self, packet: GamePacket) -> Result<(), LinkError> {
        self.0.send(packet).map_err(|e| match e {
            SendError::QueueFull => LinkError::Full,
            SendError::Closed | SendError::Frame(_) => LinkError::Closed,
        })
    }

    fn is_online(&self) -> bool {
        self.0.is_connected()
    }

    fn disconnect(&self, reason: &str) {
        self.0.exit(reason);
    }
}

/// Answers keep-alives and forwards everything else to the runtime.
pub struct AccountHandler {
    name: String,
    dimension: Dimension,
    runtime: RuntimeHandle,
    connection: HandleSlot,
    account: Option<AccountId>,
    backlog: Vec<GamePacket>,
}

impl AccountHandler {
    pub fn new(
        name: String,
        dimension: Dimension,
        runtime: RuntimeHandle,
        connection: HandleSlot,
    ) -> Self {
        Self {
            name,
            dimension,
            runtime,
            connection,
            account: None,
            backlog: Vec::new(),
        }
    }

    /// Register with the runtime once the connection handle is known.
    fn ensure_registered(
        &mut self,
        ctx: &mut HandlerContext<'_, GamePacket>,
    ) -> Option<AccountId> {
        if self.account.is_none() {
            let handle = self.connection.get()?.clone();
            self.account = self.runtime.register_account(
                self.name.clone(),
                self.dimension,
                Box::new(ConnectionLink(handle)),
            );
            if self.account.is_none() {
                ctx.exit("Runtime stopped.");
            }
        }
        self.account
    }

    /// Hand a packet to the runtime, replaying anything held back first.
    fn forward(
        &mut self,
        account: AccountId,
        packet: Option<GamePacket>,
        ctx: &mut HandlerContext<'_, GamePacket>,
    ) {
        let backlog = std::mem::take(&mut self.backlog);
        for packet in backlog.into_iter().chain(packet) {
            if !self.runtime.forward(account, packet) {
                ctx.exit("Runtime stopped.");
                return;
            }
        }
    }
}

impl Handler<GamePacket> for AccountHandler {
    fn update(&mut self, ctx: &mut HandlerContext<'_, GamePacket>) -> Result<(), HandlerError> {
        if let Some(account) = self.ensure_registered(ctx) {
            if !self.backlog.is_empty() {
                self.forward(account, None, ctx);
            }
        }
        Ok(())
    }

    fn on_packet(
        &mut self,
        packet: &GamePacket,
        ctx: &mut HandlerContext<'_, GamePacket>,
    ) -> Result<(), HandlerError> {
        match packet {
            GamePacket::KeepAlive(keep_alive) => {
                ctx.send(KeepAlive { id: keep_alive.id })?;
            }
            GamePacket::Disconnect(disconnect) => {
                tracing::info!(account = %self.name, reason = %disconnect.reason, "kicked");
                ctx.exit(&disconnect.reason);
            }
            other => match self.ensure_registered(ctx) {
                Some(account) => self.forward(account, Some(other.clone()), ctx),
                None if self.backlog.len() < MAX_BACKLOG => self.backlog.push(other.clone()),
                None => tracing::warn!(account = %self.name, "backlog full, dropping packet"),
            },
        }
        Ok(())
    }

    fn on_exit(&mut self, reason: &str) {
        tracing::info!(account = %self.name, reason, "account disconnected");
        if let Some(id) = self.account.take() {
            self.runtime.submit(Command::RemoveAccount { id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, OnceLock};
    use std::time::{Duration, Instant};

    use quarry_net::{Connection, ConnectionConfig, CompressionConfig, FrameConfig, framing};
    use quarry_protocol::game::ChatMessage;
    use quarry_protocol::{Packet, PacketSide};
    use quarry_task::{MemoryRecordSink, Runtime, RuntimeEvent, TaskRegistry};

    #[test]
    fn test_keep_alive_echo_and_forwarding() {
        let sink = Arc::new(MemoryRecordSink::new());
        let (mut runtime, handle) =
            Runtime::new(Default::default(), TaskRegistry::standard(), sink);
        let (events_tx, events) = crossbeam_channel::unbounded();
        runtime.handle_command(Command::Attach(events_tx), Instant::now());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let slot: HandleSlot = Arc::new(OnceLock::new());
        let handler = AccountHandler::new(
            "alice".into(),
            Dimension::End,
            handle,
            Arc::clone(&slot),
        );
        let connection = Connection::new(
            "account-alice",
            PacketSide::Client,
            ConnectionConfig::default(),
            Box::new(handler),
        )
        .connect(addr)
        .unwrap();
        assert!(slot.set(connection.clone()).is_ok());

        let (stream, _) = listener.accept().unwrap();
        let (mut reader, mut writer) =
            framing::split(stream, FrameConfig::default(), CompressionConfig::default()).unwrap();
        for packet in [
            GamePacket::from(KeepAlive { id: 9 }),
            ChatMessage {
                message: "hi".into(),
            }
            .into(),
        ] {
            let (id, body) = packet.encode();
            writer.write_frame(id, &body, false).unwrap();
        }

        let frame = reader.read_frame(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(
            GamePacket::decode(frame.type_id, &frame.payload).unwrap(),
            KeepAlive { id: 9 }.into()
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut chat = None;
        while chat.is_none() && Instant::now() < deadline {
            runtime.drain(Instant::now());
            chat = events.try_iter().find_map(|e| match e {
                RuntimeEvent::Chat {
                    account, message, ..
                } => Some((account, message)),
                _ => None,
            });
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(chat, Some(("alice".to_owned(), "hi".to_owned())));
        assert_eq!(runtime.scheduler().accounts().len(), 1);

        connection.exit("done");
        connection.join();
        runtime.drain(Instant::now());
        assert!(runtime.scheduler().accounts().is_empty());
    }

    #[test]
    fn test_packets_before_registration_are_replayed() {
        let sink = Arc::new(MemoryRecordSink::new());
        let (mut runtime, handle) =
            Runtime::new(Default::default(), TaskRegistry::standard(), sink);
        let (events_tx, events) = crossbeam_channel::unbounded();
        runtime.handle_command(Command::Attach(events_tx), Instant::now());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let slot: HandleSlot = Arc::new(OnceLock::new());
        let handler = AccountHandler::new(
            "bob".into(),
            Dimension::Overworld,
            handle,
            Arc::clone(&slot),
        );
        let connection = Connection::new(
            "account-bob",
            PacketSide::Client,
            ConnectionConfig::default(),
            Box::new(handler),
        )
        .connect(addr)
        .unwrap();

        let (stream, _) = listener.accept().unwrap();
        let (_reader, mut writer) =
            framing::split(stream, FrameConfig::default(), CompressionConfig::default()).unwrap();
        for message in ["first", "second"] {
            let (id, body) = GamePacket::from(ChatMessage {
                message: message.into(),
            })
            .encode();
            writer.write_frame(id, &body, false).unwrap();
        }
        std::thread::sleep(Duration::from_millis(200));
        assert!(runtime.scheduler().accounts().is_empty());
        assert!(slot.set(connection.clone()).is_ok());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut chat = Vec::new();
        while chat.len() < 2 && Instant::now() < deadline {
            runtime.drain(Instant::now());
            chat.extend(events.try_iter().filter_map(|e| match e {
                RuntimeEvent::Chat { message, .. } => Some(message),
                _ => None,
            }));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(chat, ["first", "second"]);

        connection.exit("done");
        connection.join();
    }
}
