//! Game-protocol packets spoken by account connections.

use crate::types::BlockPos;
use crate::{packet_registry, wire_enum, wire_struct};

/// `ServerInfo::features` bit: the server requires a login.
pub const FEATURE_AUTH: u32 = 1 << 0;

/// Protocol version this crate speaks.
pub const PROTOCOL_VERSION: i32 = 3;

wire_enum! {
    /// Stream cipher negotiated in [`ServerInfo`].
    pub enum EncryptionType {
        None,
        Aes128Cfb8,
    }
}

wire_struct! {
    /// First packet of every game connection.
    pub struct ServerInfo {
        pub name: String,
        pub protocol_version: i32,
        pub encryption: EncryptionType,
        /// Negative disables compression.
        pub compression_threshold: i32,
        pub features: u32,
    }
}

impl ServerInfo {
    /// Whether the server asked for a login.
    pub fn auth_enabled(&self) -> bool {
        self.features & FEATURE_AUTH != 0
    }

    /// Compression threshold, or `None` when compression is off.
    pub fn compression(&self) -> Option<usize> {
        usize::try_from(self.compression_threshold).ok()
    }
}

wire_struct! {
    /// Diffie-Hellman parameters and the server's public value, all
    /// big-endian magnitudes.
    pub struct EncryptionRequest {
        pub public_key: Vec<u8>,
        pub key_size: i32,
        pub g: Vec<u8>,
        pub p: Vec<u8>,
    }
}

wire_struct! {
    /// The client's Diffie-Hellman public value.
    pub struct EncryptionResponse {
        pub public_key: Vec<u8>,
    }
}

wire_struct! {
    pub struct LoginRequest {
        pub username: String,
        pub group: String,
        pub password: String,
    }
}

wire_struct! {
    /// Account record returned on a successful login.
    pub struct UserRecord {
        pub username: String,
        pub group: String,
        pub permission_level: i32,
    }
}

wire_struct! {
    pub struct LoginResponse {
        pub success: bool,
        pub message: String,
        pub user: Option<UserRecord>,
    }
}

wire_struct! {
    pub struct KeepAlive {
        pub id: i64,
    }
}

wire_struct! {
    pub struct Disconnect {
        pub reason: String,
    }
}

wire_enum! {
    pub enum DiggingStatus {
        Started,
        Cancelled,
        Finished,
    }
}

wire_struct! {
    /// Dig action sent by an account; the server answers with a
    /// [`BlockChange`] for loaded chunks.
    pub struct PlayerDigging {
        pub status: DiggingStatus,
        pub pos: BlockPos,
        pub face: u8,
    }
}

wire_struct! {
    pub struct BlockChange {
        pub pos: BlockPos,
        pub block_state: i32,
    }
}

wire_struct! {
    pub struct ChatMessage {
        pub message: String,
    }
}

wire_enum! {
    pub enum PlayerListAction {
        Add,
        Remove,
    }
}

wire_struct! {
    pub struct PlayerListItem {
        pub action: PlayerListAction,
        pub uuid: u128,
        pub name: String,
    }
}

packet_registry! {
    /// Every game-protocol packet.
    pub enum GamePacket in "game" {
        0x00 => ServerInfo(ServerInfo): Server,
        0x01 => EncryptionRequest(EncryptionRequest): Server,
        0x02 => EncryptionResponse(EncryptionResponse): Client,
        0x03 => LoginRequest(LoginRequest): Client,
        0x04 => LoginResponse(LoginResponse): Server,
        0x05 => KeepAlive(KeepAlive): Both,
        0x06 => Disconnect(Disconnect): Both,
        0x07 => PlayerDigging(PlayerDigging): Client,
        0x08 => BlockChange(BlockChange): Server,
        0x09 => ChatMessage(ChatMessage): Both,
        0x0A => PlayerListItem(PlayerListItem): Server,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Packet, PacketSide};

    #[test]
    fn test_login_response_with_user() {
        let packet = GamePacket::from(LoginResponse {
            success: true,
            message: "welcome".into(),
            user: Some(UserRecord {
                username: "alice".into(),
                group: "ops".into(),
                permission_level: 2,
            }),
        });
        let (id, body) = packet.encode();
        assert_eq!(id, 0x04);
        assert_eq!(GamePacket::decode(id, &body).unwrap(), packet);
    }

    #[test]
    fn test_server_info_negotiation_fields() {
        let info = ServerInfo {
            name: "hub".into(),
            protocol_version: PROTOCOL_VERSION,
            encryption: EncryptionType::Aes128Cfb8,
            compression_threshold: -1,
            features: FEATURE_AUTH,
        };
        assert!(info.auth_enabled());
        assert_eq!(info.compression(), None);
        let with_threshold = ServerInfo {
            compression_threshold: 256,
            ..info
        };
        assert_eq!(with_threshold.compression(), Some(256));
    }

    #[test]
    fn test_client_cannot_receive_login_request() {
        let (id, body) = GamePacket::from(LoginRequest {
            username: "a".into(),
            group: "b".into(),
            password: "c".into(),
        })
        .encode();
        assert!(GamePacket::decode_inbound(id, &body, PacketSide::Client).is_err());
        assert!(GamePacket::decode_inbound(id, &body, PacketSide::Server).is_ok());
    }
}
