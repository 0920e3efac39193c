//! Operator-protocol packets exchanged between a running instance and the
//! consoles watching it.
//!
//! The running instance is the *client* of this protocol: it connects out to
//! an operator server, proves its identity, pushes a state snapshot, and then
//! streams updates while answering requests.

use crate::codec::{CodecError, PacketReader, PacketWriter, Wire};
use crate::types::{
    Angle, ChunkPos, ConfigRuleDesc, Dimension, Parameter, Position, TaskDescriptor, Value,
};
use crate::{packet_registry, wire_enum, wire_struct};

wire_enum! {
    /// Role a client announces in its [`InitRequest`].
    pub enum ClientType {
        /// Read-only observer, no identity proof.
        Listening,
        /// Reports live state.
        Reporting,
        /// Uploads archived records.
        Archiving,
    }
}

impl ClientType {
    /// Whether the server must verify this client's identity.
    pub fn requires_proof(self) -> bool {
        !matches!(self, ClientType::Listening)
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

wire_struct! {
    pub struct InitRequest {
        pub client_type: ClientType,
        /// SHA-256 of `public_key`.
        pub identity_hash: Vec<u8>,
        /// DER-encoded RSA public key.
        pub public_key: Vec<u8>,
        pub handler_name: String,
        pub host: String,
        pub port: i32,
    }
}

/// Server reply to [`InitRequest`] or [`ExtendedResponse`].
#[derive(Debug, Clone, PartialEq)]
pub enum InitResponse {
    /// Identity challenge: a nonce encrypted to the client's public key.
    Extended { ciphertext: Vec<u8> },
    /// Final outcome of the handshake.
    Final {
        rejected: bool,
        handler_id: i32,
        message: String,
    },
}

impl InitResponse {
    /// Accepting reply carrying the assigned ID.
    pub fn accepted(handler_id: i32) -> Self {
        InitResponse::Final {
            rejected: false,
            handler_id,
            message: String::new(),
        }
    }

    /// Rejecting reply with a reason.
    pub fn rejected(message: impl Into<String>) -> Self {
        InitResponse::Final {
            rejected: true,
            handler_id: -1,
            message: message.into(),
        }
    }
}

impl Wire for InitResponse {
    fn write(&self, w: &mut PacketWriter) {
        match self {
            InitResponse::Extended { ciphertext } => {
                w.write_bool(true);
                w.write_bytes(ciphertext);
            }
            InitResponse::Final {
                rejected,
                handler_id,
                message,
            } => {
                w.write_bool(false);
                w.write_bool(*rejected);
                w.write_i32(*handler_id);
                w.write_string(message);
            }
        }
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        if r.read_bool()? {
            Ok(InitResponse::Extended {
                ciphertext: r.read_bytes()?,
            })
        } else {
            Ok(InitResponse::Final {
                rejected: r.read_bool()?,
                handler_id: r.read_i32()?,
                message: r.read_string()?,
            })
        }
    }
}

wire_struct! {
    /// The decrypted nonce.
    pub struct ExtendedResponse {
        pub nonce: Vec<u8>,
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Config rule sync and remote get/set.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// One rule of the sync burst.
    Sync { rule: ConfigRuleDesc, value: Value },
    /// Read request.
    Get { action_id: i64, name: String },
    /// Write request.
    Set {
        action_id: i64,
        name: String,
        value: Value,
    },
    /// Current value after a get or set.
    Value { name: String, value: Value },
}

impl Wire for ConfigAction {
    fn write(&self, w: &mut PacketWriter) {
        match self {
            ConfigAction::Sync { rule, value } => {
                w.write_u8(0);
                rule.write(w);
                value.write(w);
            }
            ConfigAction::Get { action_id, name } => {
                w.write_u8(1);
                w.write_i64(*action_id);
                w.write_string(name);
            }
            ConfigAction::Set {
                action_id,
                name,
                value,
            } => {
                w.write_u8(2);
                w.write_i64(*action_id);
                w.write_string(name);
                value.write(w);
            }
            ConfigAction::Value { name, value } => {
                w.write_u8(3);
                w.write_string(name);
                value.write(w);
            }
        }
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(match r.read_u8()? {
            0 => ConfigAction::Sync {
                rule: ConfigRuleDesc::read(r)?,
                value: Value::read(r)?,
            },
            1 => ConfigAction::Get {
                action_id: r.read_i64()?,
                name: r.read_string()?,
            },
            2 => ConfigAction::Set {
                action_id: r.read_i64()?,
                name: r.read_string()?,
                value: Value::read(r)?,
            },
            3 => ConfigAction::Value {
                name: r.read_string()?,
                value: Value::read(r)?,
            },
            other => return Err(invalid("ConfigAction", other)),
        })
    }
}

fn invalid(name: &'static str, ordinal: u8) -> CodecError {
    CodecError::InvalidOrdinal {
        name,
        ordinal: u32::from(ordinal),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Task lifecycle traffic in both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskAction {
    /// A startable task, sent during sync.
    Register { descriptor: TaskDescriptor },
    /// Operator asks to start a task.
    Start {
        action_id: i64,
        name: String,
        params: Vec<Parameter>,
    },
    /// Operator asks to stop a task.
    Stop { action_id: i64, task_id: i32 },
    /// A task became active.
    Add {
        task_id: i32,
        name: String,
        params: Vec<Parameter>,
    },
    /// A task ended.
    Remove { task_id: i32 },
    /// Progress report. `progress` is negative when the task has none.
    Update {
        task_id: i32,
        progress: f32,
        elapsed_ms: i64,
        position: Option<ChunkPos>,
    },
    /// One new result line.
    Result { task_id: i32, result: String },
}

impl Wire for TaskAction {
    fn write(&self, w: &mut PacketWriter) {
        match self {
            TaskAction::Register { descriptor } => {
                w.write_u8(0);
                descriptor.write(w);
            }
            TaskAction::Start {
                action_id,
                name,
                params,
            } => {
                w.write_u8(1);
                w.write_i64(*action_id);
                w.write_string(name);
                w.write_list(params);
            }
            TaskAction::Stop { action_id, task_id } => {
                w.write_u8(2);
                w.write_i64(*action_id);
                w.write_i32(*task_id);
            }
            TaskAction::Add {
                task_id,
                name,
                params,
            } => {
                w.write_u8(3);
                w.write_i32(*task_id);
                w.write_string(name);
                w.write_list(params);
            }
            TaskAction::Remove { task_id } => {
                w.write_u8(4);
                w.write_i32(*task_id);
            }
            TaskAction::Update {
                task_id,
                progress,
                elapsed_ms,
                position,
            } => {
                w.write_u8(5);
                w.write_i32(*task_id);
                w.write_f32(*progress);
                w.write_i64(*elapsed_ms);
                w.write_option(position.as_ref());
            }
            TaskAction::Result { task_id, result } => {
                w.write_u8(6);
                w.write_i32(*task_id);
                w.write_string(result);
            }
        }
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(match r.read_u8()? {
            0 => TaskAction::Register {
                descriptor: TaskDescriptor::read(r)?,
            },
            1 => TaskAction::Start {
                action_id: r.read_i64()?,
                name: r.read_string()?,
                params: r.read_list()?,
            },
            2 => TaskAction::Stop {
                action_id: r.read_i64()?,
                task_id: r.read_i32()?,
            },
            3 => TaskAction::Add {
                task_id: r.read_i32()?,
                name: r.read_string()?,
                params: r.read_list()?,
            },
            4 => TaskAction::Remove {
                task_id: r.read_i32()?,
            },
            5 => TaskAction::Update {
                task_id: r.read_i32()?,
                progress: r.read_f32()?,
                elapsed_ms: r.read_i64()?,
                position: r.read_option()?,
            },
            6 => TaskAction::Result {
                task_id: r.read_i32()?,
                result: r.read_string()?,
            },
            other => return Err(invalid("TaskAction", other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Accounts and players
// ---------------------------------------------------------------------------

/// Changes to the set of connected accounts.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerAction {
    Add {
        name: String,
        uuid: u128,
        display_name: String,
    },
    Remove { name: String },
    UpdatePosition {
        name: String,
        position: Position,
        angle: Angle,
    },
    UpdateDimension { name: String, dimension: Dimension },
    UpdateHealth {
        name: String,
        health: f32,
        food: i32,
        saturation: f32,
    },
}

impl PlayerAction {
    /// Account the action concerns.
    pub fn name(&self) -> &str {
        match self {
            PlayerAction::Add { name, .. }
            | PlayerAction::Remove { name }
            | PlayerAction::UpdatePosition { name, .. }
            | PlayerAction::UpdateDimension { name, .. }
            | PlayerAction::UpdateHealth { name, .. } => name,
        }
    }
}

impl Wire for PlayerAction {
    fn write(&self, w: &mut PacketWriter) {
        match self {
            PlayerAction::Add {
                name,
                uuid,
                display_name,
            } => {
                w.write_u8(0);
                w.write_string(name);
                w.write_u128(*uuid);
                w.write_string(display_name);
            }
            PlayerAction::Remove { name } => {
                w.write_u8(1);
                w.write_string(name);
            }
            PlayerAction::UpdatePosition {
                name,
                position,
                angle,
            } => {
                w.write_u8(2);
                w.write_string(name);
                position.write(w);
                angle.write(w);
            }
            PlayerAction::UpdateDimension { name, dimension } => {
                w.write_u8(3);
                w.write_string(name);
                dimension.write(w);
            }
            PlayerAction::UpdateHealth {
                name,
                health,
                food,
                saturation,
            } => {
                w.write_u8(4);
                w.write_string(name);
                w.write_f32(*health);
                w.write_i32(*food);
                w.write_f32(*saturation);
            }
        }
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(match r.read_u8()? {
            0 => PlayerAction::Add {
                name: r.read_string()?,
                uuid: r.read_u128()?,
                display_name: r.read_string()?,
            },
            1 => PlayerAction::Remove {
                name: r.read_string()?,
            },
            2 => PlayerAction::UpdatePosition {
                name: r.read_string()?,
                position: Position::read(r)?,
                angle: Angle::read(r)?,
            },
            3 => PlayerAction::UpdateDimension {
                name: r.read_string()?,
                dimension: Dimension::read(r)?,
            },
            4 => PlayerAction::UpdateHealth {
                name: r.read_string()?,
                health: r.read_f32()?,
                food: r.read_i32()?,
                saturation: r.read_f32()?,
            },
            other => return Err(invalid("PlayerAction", other)),
        })
    }
}

/// Changes to the set of player trackers.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerAction {
    Add { tracker_id: i64, players: Vec<u128> },
    Remove { tracker_id: i64 },
    Update {
        tracker_id: i64,
        position: ChunkPos,
        dimension: Dimension,
    },
    Untrack { tracker_id: i64 },
}

impl Wire for TrackerAction {
    fn write(&self, w: &mut PacketWriter) {
        match self {
            TrackerAction::Add {
                tracker_id,
                players,
            } => {
                w.write_u8(0);
                w.write_i64(*tracker_id);
                w.write_list(players);
            }
            TrackerAction::Remove { tracker_id } => {
                w.write_u8(1);
                w.write_i64(*tracker_id);
            }
            TrackerAction::Update {
                tracker_id,
                position,
                dimension,
            } => {
                w.write_u8(2);
                w.write_i64(*tracker_id);
                position.write(w);
                dimension.write(w);
            }
            TrackerAction::Untrack { tracker_id } => {
                w.write_u8(3);
                w.write_i64(*tracker_id);
            }
        }
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(match r.read_u8()? {
            0 => TrackerAction::Add {
                tracker_id: r.read_i64()?,
                players: r.read_list()?,
            },
            1 => TrackerAction::Remove {
                tracker_id: r.read_i64()?,
            },
            2 => TrackerAction::Update {
                tracker_id: r.read_i64()?,
                position: ChunkPos::read(r)?,
                dimension: Dimension::read(r)?,
            },
            3 => TrackerAction::Untrack {
                tracker_id: r.read_i64()?,
            },
            other => return Err(invalid("TrackerAction", other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Data exchange
// ---------------------------------------------------------------------------

wire_enum! {
    pub enum DataExchangeOp {
        Download,
        Upload,
        GetBounds,
        SetBounds,
    }
}

wire_enum! {
    /// Kind of archived record.
    pub enum RecordKind {
        TickData,
        PingData,
        TslpData,
        OnlinePlayer,
        Logs,
        Chat,
        ChunkState,
        RenderDistance,
        TrackedPlayer,
        TrackingData,
    }
}

wire_struct! {
    /// Bulk record transfer. `start`/`end` are millisecond timestamps; for
    /// bounds operations they carry the bounds themselves.
    pub struct DataExchange {
        pub request_id: i64,
        pub op: DataExchangeOp,
        pub kind: RecordKind,
        pub start: i64,
        pub end: i64,
        pub records: Vec<String>,
    }
}

// ---------------------------------------------------------------------------
// Requests and broadcasts
// ---------------------------------------------------------------------------

wire_struct! {
    #[derive(Eq)]
    pub struct OnlinePlayer {
        pub uuid: u128,
        pub name: String,
    }
}

wire_struct! {
    /// Join/leave deltas for the server's online player list.
    pub struct OnlinePlayersAction {
        pub added: Vec<OnlinePlayer>,
        pub removed: Vec<u128>,
    }
}

wire_enum! {
    pub enum ActionKind {
        SendChatMessage,
        ToggleLogin,
        UntrackPlayer,
    }
}

wire_struct! {
    /// Fire-and-forget request from an operator. Always answered with
    /// exactly one [`ActionResponse`].
    pub struct ActionRequest {
        pub action_id: i64,
        pub action: ActionKind,
        pub target: String,
        pub argument: String,
    }
}

wire_struct! {
    pub struct ActionResponse {
        pub action_id: i64,
        pub success: bool,
        pub message: String,
    }
}

wire_struct! {
    /// Throughput of one query class in one dimension.
    pub struct Utilisation {
        pub class: String,
        pub dimension: Dimension,
        pub rate: f32,
        pub max_throughput: f32,
    }
}

wire_struct! {
    /// Periodic scheduler and connection metrics.
    pub struct InfoUpdate {
        pub waiting: i32,
        pub ticking: i32,
        pub processed_per_second: f32,
        pub rescheduled_per_second: f32,
        pub dropped: i64,
        pub utilisation: Vec<Utilisation>,
        pub accounts_online: i32,
    }
}

wire_struct! {
    pub struct ChatLine {
        pub account: String,
        pub message: String,
        pub timestamp: i64,
    }
}

wire_struct! {
    pub struct ChatBroadcast {
        pub lines: Vec<ChatLine>,
    }
}

wire_struct! {
    pub struct ChunkState {
        pub pos: ChunkPos,
        pub dimension: Dimension,
        pub loaded: bool,
        pub timestamp: i64,
    }
}

wire_struct! {
    pub struct ChunkStates {
        pub states: Vec<ChunkState>,
    }
}

wire_struct! {
    pub struct TrackedPlayer {
        pub uuid: u128,
        pub position: ChunkPos,
        pub dimension: Dimension,
    }
}

wire_struct! {
    pub struct TrackedPlayers {
        pub players: Vec<TrackedPlayer>,
    }
}

packet_registry! {
    /// Every operator-protocol packet.
    pub enum OperatorPacket in "operator" {
        0x00 => InitRequest(InitRequest): Client,
        0x01 => InitResponse(InitResponse): Server,
        0x02 => ExtendedResponse(ExtendedResponse): Client,
        0x03 => ConfigAction(ConfigAction): Both,
        0x04 => TaskAction(TaskAction): Both,
        0x05 => PlayerAction(PlayerAction): Client,
        0x06 => TrackerAction(TrackerAction): Client,
        0x07 => DataExchange(DataExchange): Both,
        0x08 => OnlinePlayersAction(OnlinePlayersAction): Client,
        0x09 => ActionRequest(ActionRequest): Server,
        0x0A => ActionResponse(ActionResponse): Client,
        0x0B => InfoUpdate(InfoUpdate): Client,
        0x0C => ChatBroadcast(ChatBroadcast): Client,
        0x0D => ChunkStates(ChunkStates): Client,
        0x0E => TrackedPlayers(TrackedPlayers): Client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Packet;
    use crate::types::DataType;

    #[test]
    fn test_init_response_variants() {
        for response in [
            InitResponse::Extended {
                ciphertext: vec![1, 2, 3],
            },
            InitResponse::accepted(4),
            InitResponse::rejected("Untrusted handler."),
        ] {
            let packet = OperatorPacket::from(response);
            let (id, body) = packet.encode();
            assert_eq!(OperatorPacket::decode(id, &body).unwrap(), packet);
        }
    }

    #[test]
    fn test_config_set_carries_typed_value() {
        let packet = OperatorPacket::from(ConfigAction::Set {
            action_id: 11,
            name: "compression_threshold".into(),
            value: Value::Integer(512),
        });
        let (id, body) = packet.encode();
        match OperatorPacket::decode(id, &body).unwrap() {
            OperatorPacket::ConfigAction(ConfigAction::Set { value, .. }) => {
                assert_eq!(value.data_type(), DataType::Integer);
                assert_eq!(value.as_integer(), Some(512));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_task_action_tag() {
        let err = OperatorPacket::decode(0x04, &[9]).unwrap_err();
        assert!(err.to_string().contains("TaskAction"));
    }

    #[test]
    fn test_info_update_with_utilisation() {
        let packet = OperatorPacket::from(InfoUpdate {
            waiting: 5,
            ticking: 2,
            processed_per_second: 3.5,
            rescheduled_per_second: 0.0,
            dropped: 1,
            utilisation: vec![Utilisation {
                class: "digging".into(),
                dimension: Dimension::Nether,
                rate: 3.5,
                max_throughput: 20.0,
            }],
            accounts_online: 2,
        });
        let (id, body) = packet.encode();
        assert_eq!(OperatorPacket::decode(id, &body).unwrap(), packet);
    }
}
