//! Operator-protocol client: the running instance reporting to a console.
//!
//! States advance `Uninitialized → Initializing → Initialized → Synced`.
//! While initializing the server may answer with an encrypted nonce first;
//! decrypting it proves this instance holds the announced identity. After
//! acceptance the client pushes a full snapshot once, then streams runtime
//! events every loop iteration through three priority queues.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use quarry_config::{Config, OperatorRole};
use quarry_net::{Connection, ConnectionConfig, ConnectionHandle, FrameError, Handler, HandlerContext, HandlerError};
use quarry_protocol::operator::{
    ActionResponse, ChatBroadcast, ChatLine, ChunkState, ChunkStates, ClientType, ConfigAction,
    DataExchange, DataExchangeOp, ExtendedResponse, InitRequest, InitResponse, OnlinePlayer,
    OnlinePlayersAction, PlayerAction, TaskAction,
};
use quarry_protocol::{OperatorPacket, Packet, PacketSide};
use quarry_task::{Command, RecordSink, RuntimeEvent, RuntimeHandle, Snapshot};

use crate::convert;
use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Uninitialized,
    Initializing,
    Initialized,
    Synced,
}

impl OperatorState {
    pub fn name(self) -> &'static str {
        match self {
            OperatorState::Uninitialized => "uninitialized",
            OperatorState::Initializing => "initializing",
            OperatorState::Initialized => "initialized",
            OperatorState::Synced => "synced",
        }
    }
}

pub fn client_type(role: OperatorRole) -> ClientType {
    match role {
        OperatorRole::Listening => ClientType::Listening,
        OperatorRole::Reporting => ClientType::Reporting,
        OperatorRole::Archiving => ClientType::Archiving,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    High,
    Medium,
    Low,
}

/// Sender side of the client's priority queues. Cloneable and usable from
/// any thread.
#[derive(Clone)]
pub struct OperatorOutbox {
    high: Sender<OperatorPacket>,
    medium: Sender<OperatorPacket>,
    low: Sender<OperatorPacket>,
}

impl OperatorOutbox {
    /// Returns `false` once the client is gone.
    pub fn push(&self, urgency: Urgency, packet: impl Into<OperatorPacket>) -> bool {
        let queue = match urgency {
            Urgency::High => &self.high,
            Urgency::Medium => &self.medium,
            Urgency::Low => &self.low,
        };
        queue.send(packet.into()).is_ok()
    }
}

struct Queues {
    high: Receiver<OperatorPacket>,
    medium: Receiver<OperatorPacket>,
    low: Receiver<OperatorPacket>,
}

fn queues() -> (OperatorOutbox, Queues) {
    let (high_tx, high) = crossbeam_channel::unbounded();
    let (medium_tx, medium) = crossbeam_channel::unbounded();
    let (low_tx, low) = crossbeam_channel::unbounded();
    (
        OperatorOutbox {
            high: high_tx,
            medium: medium_tx,
            low: low_tx,
        },
        Queues { high, medium, low },
    )
}

/// What the client announces about itself.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_type: ClientType,
    pub handler_name: String,
    /// Game server the accounts play on.
    pub host: String,
    pub port: i32,
}

impl ClientInfo {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_type: client_type(config.operator.role),
            handler_name: config.operator.handler_name.clone(),
            host: config.game.host.clone(),
            port: i32::from(config.game.port),
        }
    }
}

/// Primary handler of the operator connection.
pub struct OperatorClient {
    info: ClientInfo,
    identity: Option<Arc<Identity>>,
    state: OperatorState,
    handler_id: Option<i32>,
    runtime: RuntimeHandle,
    sink: Arc<dyn RecordSink>,
    outbox: OperatorOutbox,
    queues: Queues,
    snapshot: Option<Receiver<Snapshot>>,
    events: Option<Receiver<RuntimeEvent>>,
    chat: Vec<ChatLine>,
    chunk_states: Vec<ChunkState>,
    online_added: Vec<OnlinePlayer>,
    online_removed: Vec<u128>,
}

impl OperatorClient {
    pub fn new(
        info: ClientInfo,
        identity: Option<Arc<Identity>>,
        runtime: RuntimeHandle,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let (outbox, queues) = queues();
        Self {
            info,
            identity,
            state: OperatorState::Uninitialized,
            handler_id: None,
            runtime,
            sink,
            outbox,
            queues,
            snapshot: None,
            events: None,
            chat: Vec::new(),
            chunk_states: Vec::new(),
            online_added: Vec::new(),
            online_removed: Vec::new(),
        }
    }

    pub fn outbox(&self) -> OperatorOutbox {
        self.outbox.clone()
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn handler_id(&self) -> Option<i32> {
        self.handler_id
    }

    fn init(&mut self, ctx: &mut HandlerContext<'_, OperatorPacket>) -> Result<(), HandlerError> {
        let (identity_hash, public_key) = match (&self.identity, self.info.client_type.requires_proof()) {
            (Some(identity), true) => (identity.hash().to_vec(), identity.public_der().to_vec()),
            (None, true) => {
                return Err(HandlerError::Identity(format!(
                    "{:?} clients need an identity key",
                    self.info.client_type
                )));
            }
            (_, false) => (Vec::new(), Vec::new()),
        };
        ctx.send_instant(InitRequest {
            client_type: self.info.client_type,
            identity_hash,
            public_key,
            handler_name: self.info.handler_name.clone(),
            host: self.info.host.clone(),
            port: self.info.port,
        })?;
        self.state = OperatorState::Initializing;
        tracing::debug!(connection = %ctx.name(), client_type = ?self.info.client_type, "init sent");
        Ok(())
    }

    fn on_init_response(
        &mut self,
        response: &InitResponse,
        ctx: &mut HandlerContext<'_, OperatorPacket>,
    ) -> Result<(), HandlerError> {
        match response {
            InitResponse::Extended { ciphertext } => {
                let identity = self.identity.as_ref().ok_or_else(|| {
                    HandlerError::Identity("server sent a challenge but no identity is loaded".into())
                })?;
                let nonce = identity.decrypt(ciphertext).map_err(|e| {
                    tracing::error!(connection = %ctx.name(), error = %e, "challenge decryption failed");
                    HandlerError::Identity(e.to_string())
                })?;
                ctx.send_instant(ExtendedResponse { nonce })?;
            }
            InitResponse::Final { rejected: true, message, .. } => {
                tracing::warn!(connection = %ctx.name(), reason = %message, "init rejected");
                return Err(HandlerError::Rejected(message.clone()));
            }
            InitResponse::Final { handler_id, .. } => {
                tracing::info!(connection = %ctx.name(), handler_id, "init accepted");
                self.handler_id = Some(*handler_id);
                self.state = OperatorState::Initialized;
            }
        }
        Ok(())
    }

    /// Ask the runtime for a snapshot, then send it as one burst.
    fn sync(&mut self, ctx: &mut HandlerContext<'_, OperatorPacket>) -> Result<(), HandlerError> {
        let Some(snapshot) = &self.snapshot else {
            let (snapshot_tx, snapshot_rx) = crossbeam_channel::bounded(1);
            let (events_tx, events_rx) = crossbeam_channel::unbounded();
            if !self.runtime.submit(Command::Snapshot(snapshot_tx))
                || !self.runtime.submit(Command::Attach(events_tx))
            {
                ctx.exit("Runtime stopped.");
                return Ok(());
            }
            self.snapshot = Some(snapshot_rx);
            self.events = Some(events_rx);
            return Ok(());
        };
        let snapshot = match snapshot.try_recv() {
            Ok(snapshot) => snapshot,
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => {
                ctx.exit("Runtime stopped.");
                return Ok(());
            }
        };

        let mut sent = 0usize;
        for rule in snapshot.rules.iter().filter(|r| r.gettable) {
            ctx.send(ConfigAction::Sync {
                rule: convert::rule_desc(rule),
                value: convert::rule_value(&rule.value),
            })?;
            sent += 1;
        }
        for descriptor in snapshot.registered {
            ctx.send(TaskAction::Register { descriptor })?;
            sent += 1;
        }
        for task in &snapshot.tasks {
            for action in convert::task_sync(task) {
                ctx.send(action)?;
                sent += 1;
            }
        }
        for account in snapshot.accounts {
            ctx.send(PlayerAction::Add {
                name: account.name.clone(),
                uuid: account.uuid,
                display_name: account.name.clone(),
            })?;
            ctx.send(PlayerAction::UpdateDimension {
                name: account.name,
                dimension: account.dimension,
            })?;
            sent += 2;
        }
        ctx.send(OnlinePlayersAction {
            added: snapshot
                .online_players
                .into_iter()
                .map(convert::online_player)
                .collect(),
            removed: Vec::new(),
        })?;
        sent += 1;

        self.snapshot = None;
        self.state = OperatorState::Synced;
        tracing::info!(connection = %ctx.name(), packets = sent, "synced");
        Ok(())
    }

    /// Sort pending runtime events into queues and batches.
    fn collect_events(&mut self) {
        let Some(events) = &self.events else {
            return;
        };
        for event in events.try_iter() {
            match event {
                RuntimeEvent::Task(event) => {
                    self.outbox.push(Urgency::Medium, convert::task_action(event));
                }
                RuntimeEvent::Stats {
                    stats,
                    accounts_online,
                } => {
                    self.outbox
                        .push(Urgency::Low, convert::info_update(&stats, accounts_online));
                }
                RuntimeEvent::Chat {
                    account,
                    message,
                    timestamp,
                } => self.chat.push(convert::chat_line(account, message, timestamp)),
                RuntimeEvent::ChunkStates(observations) => self
                    .chunk_states
                    .extend(observations.iter().map(convert::chunk_state)),
                RuntimeEvent::OnlinePlayers { added, removed } => {
                    self.online_added
                        .extend(added.into_iter().map(convert::online_player));
                    self.online_removed.extend(removed);
                }
                RuntimeEvent::AccountJoined(account) => {
                    self.outbox.push(
                        Urgency::Medium,
                        PlayerAction::Add {
                            name: account.name.clone(),
                            uuid: account.uuid,
                            display_name: account.name.clone(),
                        },
                    );
                    self.outbox.push(
                        Urgency::Medium,
                        PlayerAction::UpdateDimension {
                            name: account.name,
                            dimension: account.dimension,
                        },
                    );
                }
                RuntimeEvent::AccountLeft { name } => {
                    self.outbox
                        .push(Urgency::Medium, PlayerAction::Remove { name });
                }
                RuntimeEvent::ActionResult {
                    action_id,
                    success,
                    message,
                } => {
                    self.outbox.push(
                        Urgency::High,
                        ActionResponse {
                            action_id,
                            success,
                            message,
                        },
                    );
                }
                RuntimeEvent::ConfigValue {
                    action_id,
                    name,
                    value,
                } => {
                    if let Some(action_id) = action_id {
                        self.outbox.push(
                            Urgency::High,
                            ActionResponse {
                                action_id,
                                success: true,
                                message: value.to_string(),
                            },
                        );
                    }
                    self.outbox.push(
                        Urgency::Medium,
                        ConfigAction::Value {
                            name,
                            value: convert::rule_value(&value),
                        },
                    );
                }
            }
        }
    }

    /// Drain every queue high to low, then the batched broadcasts.
    fn flush(&mut self, ctx: &mut HandlerContext<'_, OperatorPacket>) -> Result<(), HandlerError> {
        for queue in [&self.queues.high, &self.queues.medium, &self.queues.low] {
            for packet in queue.try_iter() {
                ctx.send(packet)?;
            }
        }
        if !self.chat.is_empty() {
            ctx.send(ChatBroadcast {
                lines: std::mem::take(&mut self.chat),
            })?;
        }
        if !self.chunk_states.is_empty() {
            ctx.send(ChunkStates {
                states: std::mem::take(&mut self.chunk_states),
            })?;
        }
        if !self.online_added.is_empty() || !self.online_removed.is_empty() {
            ctx.send(OnlinePlayersAction {
                added: std::mem::take(&mut self.online_added),
                removed: std::mem::take(&mut self.online_removed),
            })?;
        }
        Ok(())
    }

    fn on_data_exchange(&self, request: &DataExchange) {
        let reply = match request.op {
            DataExchangeOp::Download => DataExchange {
                records: self.sink.load(request.kind, request.start, request.end),
                ..request.clone()
            },
            DataExchangeOp::GetBounds => {
                let (start, end) = self.sink.bounds(request.kind).unwrap_or((-1, -1));
                DataExchange {
                    start,
                    end,
                    records: Vec::new(),
                    ..request.clone()
                }
            }
            DataExchangeOp::Upload => {
                let count = request.records.len();
                for record in &request.records {
                    self.sink.store(request.kind, request.start, record.clone());
                }
                tracing::debug!(kind = ?request.kind, count, "records uploaded");
                DataExchange {
                    records: Vec::new(),
                    ..request.clone()
                }
            }
            DataExchangeOp::SetBounds => {
                tracing::debug!(kind = ?request.kind, "archive bounds are fixed, ignoring");
                let (start, end) = self.sink.bounds(request.kind).unwrap_or((-1, -1));
                DataExchange {
                    start,
                    end,
                    records: Vec::new(),
                    ..request.clone()
                }
            }
        };
        self.outbox.push(Urgency::Medium, reply);
    }

    fn submit(&self, command: Command, ctx: &mut HandlerContext<'_, OperatorPacket>) {
        if !self.runtime.submit(command) {
            ctx.exit("Runtime stopped.");
        }
    }

    fn on_request(
        &mut self,
        packet: &OperatorPacket,
        ctx: &mut HandlerContext<'_, OperatorPacket>,
    ) -> Result<(), HandlerError> {
        match packet {
            OperatorPacket::TaskAction(TaskAction::Start {
                action_id,
                name,
                params,
            }) => self.submit(
                Command::StartTask {
                    action_id: *action_id,
                    name: name.clone(),
                    params: params.clone(),
                },
                ctx,
            ),
            OperatorPacket::TaskAction(TaskAction::Stop { action_id, task_id }) => self.submit(
                Command::StopTask {
                    action_id: *action_id,
                    task_id: *task_id,
                },
                ctx,
            ),
            OperatorPacket::ConfigAction(ConfigAction::Get { action_id, name }) => self.submit(
                Command::GetConfig {
                    action_id: *action_id,
                    name: name.clone(),
                },
                ctx,
            ),
            OperatorPacket::ConfigAction(ConfigAction::Set {
                action_id,
                name,
                value,
            }) => match convert::to_rule_value(value) {
                Some(value) => self.submit(
                    Command::SetConfig {
                        action_id: *action_id,
                        name: name.clone(),
                        value,
                    },
                    ctx,
                ),
                None => {
                    self.outbox.push(
                        Urgency::High,
                        ActionResponse {
                            action_id: *action_id,
                            success: false,
                            message: format!("{name} cannot hold a {:?} value", value.data_type()),
                        },
                    );
                }
            },
            OperatorPacket::ActionRequest(request) => {
                self.submit(Command::Action(request.clone()), ctx)
            }
            OperatorPacket::DataExchange(request) => self.on_data_exchange(request),
            other => {
                return Err(HandlerError::Unexpected {
                    packet: other.name(),
                    state: self.state.name(),
                });
            }
        }
        Ok(())
    }
}

impl Handler<OperatorPacket> for OperatorClient {
    fn update(&mut self, ctx: &mut HandlerContext<'_, OperatorPacket>) -> Result<(), HandlerError> {
        match self.state {
            OperatorState::Uninitialized => self.init(ctx),
            OperatorState::Initializing => Ok(()),
            OperatorState::Initialized => self.sync(ctx),
            OperatorState::Synced => {
                self.collect_events();
                self.flush(ctx)
            }
        }
    }

    fn on_packet(
        &mut self,
        packet: &OperatorPacket,
        ctx: &mut HandlerContext<'_, OperatorPacket>,
    ) -> Result<(), HandlerError> {
        match (self.state, packet) {
            (OperatorState::Initializing, OperatorPacket::InitResponse(response)) => {
                self.on_init_response(response, ctx)
            }
            (OperatorState::Initialized | OperatorState::Synced, OperatorPacket::InitResponse(_))
            | (OperatorState::Uninitialized | OperatorState::Initializing, _) => {
                Err(HandlerError::Unexpected {
                    packet: packet.name(),
                    state: self.state.name(),
                })
            }
            (OperatorState::Initialized | OperatorState::Synced, _) => self.on_request(packet, ctx),
        }
    }

    fn on_exit(&mut self, reason: &str) {
        tracing::info!(handler_id = ?self.handler_id, reason, "operator session closed");
        if self.events.take().is_some() {
            let _ = self.runtime.submit(Command::Detach);
        }
    }
}

/// Connect to the configured operator server.
pub fn connect_operator(
    config: &Config,
    identity: Option<Arc<Identity>>,
    runtime: RuntimeHandle,
    sink: Arc<dyn RecordSink>,
) -> Result<ConnectionHandle<OperatorPacket>, FrameError> {
    let client = OperatorClient::new(ClientInfo::from_config(config), identity, runtime, sink);
    Connection::new(
        "operator",
        PacketSide::Client,
        ConnectionConfig::from_config(config),
        Box::new(client),
    )
    .connect((config.operator.host.as_str(), config.operator.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    use quarry_net::{CompressionConfig, FrameConfig, FramedReader, FramedWriter, framing};
    use quarry_protocol::operator::{ActionKind, ActionRequest, RecordKind};
    use quarry_task::{MemoryRecordSink, Runtime, TaskRegistry};

    use crate::identity::tests::test_identity;

    struct Peer {
        reader: FramedReader,
        writer: FramedWriter,
    }

    impl Peer {
        fn send(&mut self, packet: impl Into<OperatorPacket>) {
            let (id, body) = packet.into().encode();
            self.writer.write_frame(id, &body, false).unwrap();
        }

        fn recv(&mut self) -> OperatorPacket {
            let frame = self
                .reader
                .read_frame(Duration::from_secs(5))
                .unwrap()
                .expect("no packet within 5 s");
            OperatorPacket::decode(frame.type_id, &frame.payload).unwrap()
        }

        /// Skip packets until one matches.
        fn recv_until(&mut self, mut f: impl FnMut(&OperatorPacket) -> bool) -> OperatorPacket {
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                let packet = self.recv();
                if f(&packet) {
                    return packet;
                }
            }
            panic!("expected packet never arrived");
        }
    }

    fn info(client_type: ClientType) -> ClientInfo {
        ClientInfo {
            client_type,
            handler_name: "north".into(),
            host: "play.example".into(),
            port: 25565,
        }
    }

    fn start(
        client_type: ClientType,
        identity: Option<Arc<Identity>>,
    ) -> (ConnectionHandle<OperatorPacket>, Peer, RuntimeHandle, Arc<MemoryRecordSink>) {
        let sink = Arc::new(MemoryRecordSink::new());
        let (runtime, handle) =
            Runtime::new(Config::default(), TaskRegistry::standard(), sink.clone());
        runtime.spawn().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = OperatorClient::new(info(client_type), identity, handle.clone(), sink.clone());
        let connection = Connection::new(
            "operator",
            PacketSide::Client,
            ConnectionConfig::default(),
            Box::new(client),
        )
        .connect(listener.local_addr().unwrap())
        .unwrap();
        let (stream, _) = listener.accept().unwrap();
        let (reader, writer) =
            framing::split(stream, FrameConfig::default(), CompressionConfig::default()).unwrap();
        (connection, Peer { reader, writer }, handle, sink)
    }

    #[test]
    fn test_listening_client_needs_no_proof() {
        let (connection, mut peer, runtime, _sink) = start(ClientType::Listening, None);
        match peer.recv() {
            OperatorPacket::InitRequest(request) => {
                assert_eq!(request.client_type, ClientType::Listening);
                assert!(request.identity_hash.is_empty());
                assert_eq!(request.handler_name, "north");
                assert_eq!(request.port, 25565);
            }
            other => panic!("unexpected {other:?}"),
        }
        peer.send(InitResponse::accepted(4));
        peer.recv_until(|p| matches!(p, OperatorPacket::ConfigAction(ConfigAction::Sync { .. })));
        peer.recv_until(|p| matches!(p, OperatorPacket::OnlinePlayersAction(_)));

        connection.exit("done");
        connection.join();
        runtime.shutdown();
    }

    #[test]
    fn test_reporting_client_without_identity_exits() {
        let (connection, _peer, runtime, _sink) = start(ClientType::Reporting, None);
        connection.join();
        assert!(connection.exit_reason().unwrap().contains("identity"));
        runtime.shutdown();
    }

    #[test]
    fn test_answers_challenge() {
        let identity = test_identity(0);
        let (connection, mut peer, runtime, _sink) =
            start(ClientType::Reporting, Some(Arc::clone(&identity)));
        let OperatorPacket::InitRequest(request) = peer.recv() else {
            panic!("expected init request");
        };
        assert_eq!(request.identity_hash, identity.hash());

        let mut store = crate::identity::TrustStore::new();
        store.add_der(&request.public_key).unwrap();
        let key = store.verify(&request.identity_hash, &request.public_key).unwrap();
        let (nonce, ciphertext) = crate::identity::challenge(key).unwrap();
        peer.send(InitResponse::Extended { ciphertext });
        match peer.recv() {
            OperatorPacket::ExtendedResponse(response) => assert_eq!(response.nonce, nonce),
            other => panic!("unexpected {other:?}"),
        }

        connection.exit("done");
        connection.join();
        runtime.shutdown();
    }

    #[test]
    fn test_rejection_closes_with_message() {
        let (connection, mut peer, runtime, _sink) = start(ClientType::Listening, None);
        peer.recv();
        peer.send(InitResponse::rejected("Go away."));
        connection.join();
        assert_eq!(connection.exit_reason().as_deref(), Some("Go away."));
        runtime.shutdown();
    }

    #[test]
    fn test_second_init_response_is_fatal() {
        let (connection, mut peer, runtime, _sink) = start(ClientType::Listening, None);
        peer.recv();
        peer.send(InitResponse::accepted(1));
        peer.send(InitResponse::accepted(2));
        connection.join();
        assert!(connection.exit_reason().unwrap().contains("InitResponse"));
        runtime.shutdown();
    }

    #[test]
    fn test_requests_reach_runtime() {
        let (connection, mut peer, runtime, sink) = start(ClientType::Listening, None);
        peer.recv();
        peer.send(InitResponse::accepted(0));
        peer.recv_until(|p| matches!(p, OperatorPacket::OnlinePlayersAction(_)));

        peer.send(ActionRequest {
            action_id: 11,
            action: ActionKind::UntrackPlayer,
            target: "bob".into(),
            argument: String::new(),
        });
        let response = peer.recv_until(|p| matches!(p, OperatorPacket::ActionResponse(_)));
        assert!(matches!(
            response,
            OperatorPacket::ActionResponse(ActionResponse { action_id: 11, success: false, .. })
        ));

        peer.send(ConfigAction::Get {
            action_id: 12,
            name: "tick_interval_ms".into(),
        });
        let response = peer.recv_until(|p| matches!(p, OperatorPacket::ActionResponse(_)));
        assert_eq!(
            response,
            OperatorPacket::from(ActionResponse {
                action_id: 12,
                success: true,
                message: "50".into()
            })
        );

        sink.store(RecordKind::Chat, 100, "alice: hi".into());
        sink.store(RecordKind::Chat, 200, "alice: bye".into());
        peer.send(DataExchange {
            request_id: 5,
            op: DataExchangeOp::Download,
            kind: RecordKind::Chat,
            start: 0,
            end: 150,
            records: Vec::new(),
        });
        let reply = peer.recv_until(|p| matches!(p, OperatorPacket::DataExchange(_)));
        let OperatorPacket::DataExchange(reply) = reply else {
            unreachable!()
        };
        assert_eq!(reply.request_id, 5);
        assert_eq!(reply.records, ["alice: hi"]);

        connection.exit("done");
        connection.join();
        runtime.shutdown();
    }
}
