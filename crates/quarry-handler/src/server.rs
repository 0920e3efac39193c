//! Operator-protocol server: where running instances report to.
//!
//! Each accepted connection gets a [`ServerHandler`]. Listening clients are
//! accepted outright; reporting and archiving clients must announce a
//! trusted key and decrypt a nonce encrypted to it. Accepted handlers get
//! the smallest free handler ID, and everything they report is folded into
//! a [`ReportedHandler`] that consoles can read through [`ServerState`].

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender};
use quarry_config::Config;
use quarry_net::{
    ConnectionConfig, ConnectionId, Handler, HandlerContext, HandlerError, HandlerFactory, Listener,
    ListenerConfig,
};
use quarry_protocol::operator::{
    ActionResponse, ChatLine, ChunkState, ClientType, ConfigAction, DataExchange, InfoUpdate,
    InitRequest, InitResponse, PlayerAction, TaskAction, TrackedPlayer, TrackerAction,
};
use quarry_protocol::{
    Angle, ChunkPos, ConfigRuleDesc, Dimension, OperatorPacket, Packet, Parameter, Position,
    TaskDescriptor, Value,
};

use crate::identity::{self, IdentityError, TrustStore};

/// Rejection sent to clients whose key is not trusted.
pub const UNTRUSTED: &str = "Untrusted handler.";
/// Rejection sent when the nonce comes back wrong.
pub const PROOF_FAILED: &str = "Identity proof failed.";

#[derive(Debug, Clone, PartialEq)]
pub struct ReportedTask {
    pub name: String,
    pub params: Vec<Parameter>,
    /// Negative when unknown.
    pub progress: f32,
    pub elapsed_ms: i64,
    pub position: Option<ChunkPos>,
    pub results: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportedPlayer {
    pub uuid: u128,
    pub display_name: String,
    pub dimension: Option<Dimension>,
    pub position: Option<(Position, Angle)>,
    pub health: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportedTracker {
    pub players: Vec<u128>,
    pub position: Option<(ChunkPos, Dimension)>,
}

/// Everything one handler has reported since it was accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedHandler {
    pub client_type: ClientType,
    pub handler_name: String,
    pub host: String,
    pub port: i32,
    pub rules: BTreeMap<String, (ConfigRuleDesc, Value)>,
    pub descriptors: Vec<TaskDescriptor>,
    pub tasks: BTreeMap<i32, ReportedTask>,
    pub players: BTreeMap<String, ReportedPlayer>,
    pub online: BTreeMap<u128, String>,
    pub trackers: BTreeMap<i64, ReportedTracker>,
    pub chat: Vec<ChatLine>,
    pub chunk_states: Vec<ChunkState>,
    pub tracked: Vec<TrackedPlayer>,
    pub info: Option<InfoUpdate>,
    pub responses: Vec<ActionResponse>,
    pub data: Vec<DataExchange>,
}

impl ReportedHandler {
    fn new(request: &InitRequest) -> Self {
        Self {
            client_type: request.client_type,
            handler_name: request.handler_name.clone(),
            host: request.host.clone(),
            port: request.port,
            rules: BTreeMap::new(),
            descriptors: Vec::new(),
            tasks: BTreeMap::new(),
            players: BTreeMap::new(),
            online: BTreeMap::new(),
            trackers: BTreeMap::new(),
            chat: Vec::new(),
            chunk_states: Vec::new(),
            tracked: Vec::new(),
            info: None,
            responses: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Fold one reported packet into the state. Returns `false` for packets
    /// that carry no report.
    pub fn apply(&mut self, packet: &OperatorPacket) -> bool {
        match packet {
            OperatorPacket::ConfigAction(action) => self.apply_config(action),
            OperatorPacket::TaskAction(action) => self.apply_task(action),
            OperatorPacket::PlayerAction(action) => self.apply_player(action),
            OperatorPacket::TrackerAction(action) => self.apply_tracker(action),
            OperatorPacket::DataExchange(exchange) => self.data.push(exchange.clone()),
            OperatorPacket::OnlinePlayersAction(action) => {
                for uuid in &action.removed {
                    self.online.remove(uuid);
                }
                for player in &action.added {
                    self.online.insert(player.uuid, player.name.clone());
                }
            }
            OperatorPacket::ActionResponse(response) => self.responses.push(response.clone()),
            OperatorPacket::InfoUpdate(info) => self.info = Some(info.clone()),
            OperatorPacket::ChatBroadcast(broadcast) => {
                self.chat.extend(broadcast.lines.iter().cloned())
            }
            OperatorPacket::ChunkStates(states) => {
                self.chunk_states.extend(states.states.iter().cloned())
            }
            OperatorPacket::TrackedPlayers(tracked) => self.tracked = tracked.players.clone(),
            OperatorPacket::InitRequest(_)
            | OperatorPacket::InitResponse(_)
            | OperatorPacket::ExtendedResponse(_)
            | OperatorPacket::ActionRequest(_) => return false,
        }
        true
    }

    fn apply_config(&mut self, action: &ConfigAction) {
        match action {
            ConfigAction::Sync { rule, value } => {
                self.rules
                    .insert(rule.name.clone(), (rule.clone(), value.clone()));
            }
            ConfigAction::Value { name, value } => match self.rules.get_mut(name) {
                Some((_, current)) => *current = value.clone(),
                None => tracing::debug!(rule = %name, "value for unsynced rule"),
            },
            ConfigAction::Get { .. } | ConfigAction::Set { .. } => {}
        }
    }

    fn apply_task(&mut self, action: &TaskAction) {
        match action {
            TaskAction::Register { descriptor } => {
                self.descriptors.retain(|d| d.name != descriptor.name);
                self.descriptors.push(descriptor.clone());
            }
            TaskAction::Add {
                task_id,
                name,
                params,
            } => {
                self.tasks.insert(
                    *task_id,
                    ReportedTask {
                        name: name.clone(),
                        params: params.clone(),
                        progress: -1.0,
                        elapsed_ms: 0,
                        position: None,
                        results: Vec::new(),
                    },
                );
            }
            TaskAction::Remove { task_id } => {
                self.tasks.remove(task_id);
            }
            TaskAction::Update {
                task_id,
                progress,
                elapsed_ms,
                position,
            } => {
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.progress = *progress;
                    task.elapsed_ms = *elapsed_ms;
                    task.position = *position;
                }
            }
            TaskAction::Result { task_id, result } => {
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.results.push(result.clone());
                }
            }
            TaskAction::Start { .. } | TaskAction::Stop { .. } => {}
        }
    }

    fn apply_player(&mut self, action: &PlayerAction) {
        if let PlayerAction::Add {
            name,
            uuid,
            display_name,
        } = action
        {
            self.players.insert(
                name.clone(),
                ReportedPlayer {
                    uuid: *uuid,
                    display_name: display_name.clone(),
                    dimension: None,
                    position: None,
                    health: None,
                },
            );
            return;
        }
        if let PlayerAction::Remove { name } = action {
            self.players.remove(name);
            return;
        }
        let Some(player) = self.players.get_mut(action.name()) else {
            tracing::debug!(player = %action.name(), "update for unknown player");
            return;
        };
        match action {
            PlayerAction::UpdatePosition {
                position, angle, ..
            } => player.position = Some((*position, *angle)),
            PlayerAction::UpdateDimension { dimension, .. } => player.dimension = Some(*dimension),
            PlayerAction::UpdateHealth { health, .. } => player.health = Some(*health),
            PlayerAction::Add { .. } | PlayerAction::Remove { .. } => {}
        }
    }

    fn apply_tracker(&mut self, action: &TrackerAction) {
        match action {
            TrackerAction::Add {
                tracker_id,
                players,
            } => {
                self.trackers.insert(
                    *tracker_id,
                    ReportedTracker {
                        players: players.clone(),
                        position: None,
                    },
                );
            }
            TrackerAction::Remove { tracker_id } | TrackerAction::Untrack { tracker_id } => {
                self.trackers.remove(tracker_id);
            }
            TrackerAction::Update {
                tracker_id,
                position,
                dimension,
            } => {
                self.trackers.entry(*tracker_id).or_default().position =
                    Some((*position, *dimension));
            }
        }
    }
}

struct HandlerEntry {
    reported: ReportedHandler,
    requests: Sender<OperatorPacket>,
}

/// Shared view of every accepted handler.
pub struct ServerState {
    trust: TrustStore,
    handlers: Mutex<BTreeMap<i32, HandlerEntry>>,
}

impl ServerState {
    pub fn new(trust: TrustStore) -> Self {
        Self {
            trust,
            handlers: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, HandlerEntry>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    /// Accept a handler under the smallest free ID.
    fn register(&self, request: &InitRequest) -> (i32, Receiver<OperatorPacket>) {
        let (requests, rx) = crossbeam_channel::unbounded();
        let mut handlers = self.lock();
        let id = (0..)
            .find(|id| !handlers.contains_key(id))
            .unwrap_or(i32::MAX);
        handlers.insert(
            id,
            HandlerEntry {
                reported: ReportedHandler::new(request),
                requests,
            },
        );
        (id, rx)
    }

    fn release(&self, id: i32) {
        self.lock().remove(&id);
    }

    fn apply(&self, id: i32, packet: &OperatorPacket) -> bool {
        self.lock()
            .get_mut(&id)
            .is_some_and(|entry| entry.reported.apply(packet))
    }

    /// Queue a request for handler `id`. Returns `false` if it is gone.
    pub fn send(&self, id: i32, packet: impl Into<OperatorPacket>) -> bool {
        self.lock()
            .get(&id)
            .is_some_and(|entry| entry.requests.send(packet.into()).is_ok())
    }

    /// Copy of what handler `id` has reported.
    pub fn reported(&self, id: i32) -> Option<ReportedHandler> {
        self.lock().get(&id).map(|entry| entry.reported.clone())
    }

    pub fn handler_ids(&self) -> Vec<i32> {
        self.lock().keys().copied().collect()
    }

    /// Handler factory for a [`Listener`].
    pub fn factory(self: &Arc<Self>) -> Arc<HandlerFactory<OperatorPacket>> {
        let state = Arc::clone(self);
        Arc::new(
            move |id: ConnectionId, peer: SocketAddr| -> Box<dyn Handler<OperatorPacket>> {
                tracing::debug!(connection = id.0, %peer, "operator client connected");
                Box::new(ServerHandler::new(Arc::clone(&state)))
            },
        )
    }
}

enum Phase {
    AwaitInit,
    AwaitProof {
        request: InitRequest,
        nonce: Vec<u8>,
    },
    Active {
        id: i32,
        requests: Receiver<OperatorPacket>,
    },
    Closed,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::AwaitInit => "awaiting init",
            Phase::AwaitProof { .. } => "awaiting proof",
            Phase::Active { .. } => "active",
            Phase::Closed => "closed",
        }
    }
}

/// Server side of one operator connection.
pub struct ServerHandler {
    state: Arc<ServerState>,
    phase: Phase,
}

impl ServerHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            phase: Phase::AwaitInit,
        }
    }

    fn reject(&mut self, ctx: &mut HandlerContext<'_, OperatorPacket>, message: &str) -> Result<(), HandlerError> {
        tracing::warn!(connection = %ctx.name(), reason = message, "rejecting operator client");
        self.phase = Phase::Closed;
        ctx.send_instant(InitResponse::rejected(message))?;
        ctx.exit(message);
        Ok(())
    }

    fn accept(&mut self, request: &InitRequest, ctx: &mut HandlerContext<'_, OperatorPacket>) -> Result<(), HandlerError> {
        let (id, requests) = self.state.register(request);
        self.phase = Phase::Active { id, requests };
        tracing::info!(
            connection = %ctx.name(),
            handler_id = id,
            name = %request.handler_name,
            client_type = ?request.client_type,
            "operator client accepted"
        );
        ctx.send_instant(InitResponse::accepted(id))?;
        Ok(())
    }

    fn on_init(&mut self, request: &InitRequest, ctx: &mut HandlerContext<'_, OperatorPacket>) -> Result<(), HandlerError> {
        if !request.client_type.requires_proof() {
            return self.accept(request, ctx);
        }
        let Some(key) = self.state.trust.verify(&request.identity_hash, &request.public_key) else {
            tracing::debug!(hash = %identity::hex(&request.identity_hash), "unknown identity");
            return self.reject(ctx, UNTRUSTED);
        };
        let (nonce, ciphertext) =
            identity::challenge(key).map_err(|e| HandlerError::Identity(e.to_string()))?;
        ctx.send_instant(InitResponse::Extended { ciphertext })?;
        self.phase = Phase::AwaitProof {
            request: request.clone(),
            nonce,
        };
        Ok(())
    }
}

impl Handler<OperatorPacket> for ServerHandler {
    fn update(&mut self, ctx: &mut HandlerContext<'_, OperatorPacket>) -> Result<(), HandlerError> {
        if let Phase::Active { requests, .. } = &self.phase {
            for packet in requests.try_iter() {
                ctx.send(packet)?;
            }
        }
        Ok(())
    }

    fn on_packet(
        &mut self,
        packet: &OperatorPacket,
        ctx: &mut HandlerContext<'_, OperatorPacket>,
    ) -> Result<(), HandlerError> {
        match (&self.phase, packet) {
            (Phase::AwaitInit, OperatorPacket::InitRequest(request)) => self.on_init(request, ctx),
            (Phase::AwaitProof { request, nonce }, OperatorPacket::ExtendedResponse(response)) => {
                let proven = response.nonce == *nonce;
                let request = request.clone();
                if proven {
                    self.accept(&request, ctx)
                } else {
                    self.reject(ctx, PROOF_FAILED)
                }
            }
            (Phase::Active { id, .. }, packet) if self.state.apply(*id, packet) => Ok(()),
            (Phase::Closed, _) => Ok(()),
            (phase, packet) => Err(HandlerError::Unexpected {
                packet: packet.name(),
                state: phase.name(),
            }),
        }
    }

    fn on_exit(&mut self, reason: &str) {
        if let Phase::Active { id, .. } = std::mem::replace(&mut self.phase, Phase::Closed) {
            tracing::info!(handler_id = id, reason, "operator client left");
            self.state.release(id);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address '{0}'")]
    Address(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("failed to bind: {0}")]
    Io(#[from] io::Error),
}

/// A bound operator server.
pub struct OperatorServer {
    state: Arc<ServerState>,
    listener: Listener<OperatorPacket>,
}

impl OperatorServer {
    pub fn bind(config: ListenerConfig, trust: TrustStore) -> io::Result<Self> {
        let state = Arc::new(ServerState::new(trust));
        let listener = Listener::bind(config, state.factory())?;
        Ok(Self { state, listener })
    }

    /// Bind `operator.listen_addr`, trusting the keys in
    /// `operator.trusted_keys`.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let addr = &config.operator.listen_addr;
        let bind_addr = addr
            .parse()
            .map_err(|_| ServerError::Address(addr.clone()))?;
        let trust = TrustStore::load(&config.operator.trusted_keys)?;
        let listener = ListenerConfig {
            bind_addr,
            connection: ConnectionConfig::from_config(config),
            ..ListenerConfig::default()
        };
        Ok(Self::bind(listener, trust)?)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn shutdown(&mut self) {
        self.listener.shutdown();
    }
}
