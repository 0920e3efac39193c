//! Game-protocol login: server info, optional key agreement, credentials.
//!
//! Once the server accepts the login, the [`LoginHandler`] replaces itself
//! with an [`AccountHandler`] that feeds the runtime.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use quarry_config::Config;
use quarry_net::{Connection, ConnectionConfig, ConnectionHandle, DhGroup, FrameError, Handler, HandlerContext, HandlerError};
use quarry_protocol::game::{
    EncryptionRequest, EncryptionResponse, EncryptionType, KeepAlive, LoginRequest, PROTOCOL_VERSION,
    ServerInfo,
};
use quarry_protocol::{Dimension, GamePacket, Packet, PacketSide};
use quarry_task::RuntimeHandle;

use crate::account::AccountHandler;

/// Login details for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub group: String,
    pub password: String,
    /// Dimension the account plays in once logged in.
    pub dimension: Dimension,
}

/// External store the core asks for account credentials.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self, account: &str) -> Option<Credentials>;
}

/// Credentials held in memory.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    accounts: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, credentials: Credentials) {
        self.accounts.insert(credentials.username.clone(), credentials);
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self, account: &str) -> Option<Credentials> {
        self.accounts.get(account).cloned()
    }
}

/// Slot filled with the connection's own handle once `connect` returns.
pub type HandleSlot = Arc<OnceLock<ConnectionHandle<GamePacket>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginState {
    AwaitInfo,
    AwaitEncryption,
    AwaitLogin,
}

impl LoginState {
    fn name(self) -> &'static str {
        match self {
            LoginState::AwaitInfo => "awaiting server info",
            LoginState::AwaitEncryption => "awaiting encryption",
            LoginState::AwaitLogin => "awaiting login",
        }
    }
}

/// Primary handler of an account connection until login completes.
pub struct LoginHandler {
    credentials: Credentials,
    state: LoginState,
    runtime: RuntimeHandle,
    connection: HandleSlot,
}

impl LoginHandler {
    pub fn new(credentials: Credentials, runtime: RuntimeHandle, connection: HandleSlot) -> Self {
        Self {
            credentials,
            state: LoginState::AwaitInfo,
            runtime,
            connection,
        }
    }

    fn on_server_info(
        &mut self,
        info: &ServerInfo,
        ctx: &mut HandlerContext<'_, GamePacket>,
    ) -> Result<(), HandlerError> {
        if info.protocol_version != PROTOCOL_VERSION {
            return Err(HandlerError::Rejected(format!(
                "Unsupported protocol version {}.",
                info.protocol_version
            )));
        }
        tracing::debug!(
            connection = %ctx.name(),
            server = %info.name,
            encryption = ?info.encryption,
            compression = ?info.compression(),
            "server info"
        );
        ctx.update_session(|s| {
            s.server_name = info.name.clone();
            s.auth_enabled = info.auth_enabled();
        });
        ctx.set_compression(info.compression());

        match info.encryption {
            EncryptionType::Aes128Cfb8 => self.state = LoginState::AwaitEncryption,
            EncryptionType::None => self.login(ctx)?,
        }
        Ok(())
    }

    fn on_encryption_request(
        &mut self,
        request: &EncryptionRequest,
        ctx: &mut HandlerContext<'_, GamePacket>,
    ) -> Result<(), HandlerError> {
        let group = DhGroup::from_bytes(&request.p, &request.g)?;
        let pair = group.generate();
        let key = pair.agree(&request.public_key)?;
        ctx.send_instant(EncryptionResponse {
            public_key: pair.public_bytes(),
        })?;
        ctx.enable_encryption(&key);
        self.login(ctx)
    }

    /// Send credentials, or go straight to the account stage when the server
    /// does not authenticate.
    fn login(&mut self, ctx: &mut HandlerContext<'_, GamePacket>) -> Result<(), HandlerError> {
        if ctx.session().auth_enabled {
            ctx.send_instant(LoginRequest {
                username: self.credentials.username.clone(),
                group: self.credentials.group.clone(),
                password: self.credentials.password.clone(),
            })?;
            self.state = LoginState::AwaitLogin;
        } else {
            self.become_account(ctx);
        }
        Ok(())
    }

    fn become_account(&mut self, ctx: &mut HandlerContext<'_, GamePacket>) {
        tracing::info!(account = %self.credentials.username, "logged in");
        ctx.replace_primary(Box::new(AccountHandler::new(
            self.credentials.username.clone(),
            self.credentials.dimension,
            self.runtime.clone(),
            Arc::clone(&self.connection),
        )));
    }
}

impl Handler<GamePacket> for LoginHandler {
    fn on_packet(
        &mut self,
        packet: &GamePacket,
        ctx: &mut HandlerContext<'_, GamePacket>,
    ) -> Result<(), HandlerError> {
        match (self.state, packet) {
            (LoginState::AwaitInfo, GamePacket::ServerInfo(info)) => self.on_server_info(info, ctx),
            (LoginState::AwaitEncryption, GamePacket::EncryptionRequest(request)) => {
                self.on_encryption_request(request, ctx)
            }
            (LoginState::AwaitLogin, GamePacket::LoginResponse(response)) => {
                if !response.success {
                    return Err(HandlerError::Rejected(response.message.clone()));
                }
                self.become_account(ctx);
                Ok(())
            }
            (_, GamePacket::KeepAlive(keep_alive)) => {
                ctx.send(KeepAlive { id: keep_alive.id })?;
                Ok(())
            }
            (_, GamePacket::Disconnect(disconnect)) => {
                ctx.exit(&disconnect.reason);
                Ok(())
            }
            (state, other) => Err(HandlerError::Unexpected {
                packet: other.name(),
                state: state.name(),
            }),
        }
    }

    fn on_exit(&mut self, reason: &str) {
        tracing::warn!(account = %self.credentials.username, reason, "login did not complete");
    }
}

/// Open an account connection to the configured game server and log in.
pub fn connect_account(
    config: &Config,
    credentials: Credentials,
    runtime: RuntimeHandle,
) -> Result<ConnectionHandle<GamePacket>, FrameError> {
    let slot: HandleSlot = Arc::new(OnceLock::new());
    let name = format!("account-{}", credentials.username);
    let handler = LoginHandler::new(credentials, runtime, Arc::clone(&slot));
    let handle = Connection::new(
        name,
        PacketSide::Client,
        ConnectionConfig::from_config(config),
        Box::new(handler),
    )
    .connect((config.game.host.as_str(), config.game.port))?;
    // Only this function fills the slot.
    let _ = slot.set(handle.clone());
    Ok(handle)
}

/// Connect every named account the source knows. Unknown names are skipped.
pub fn connect_accounts(
    config: &Config,
    source: &dyn CredentialSource,
    names: &[String],
    runtime: &RuntimeHandle,
) -> Vec<ConnectionHandle<GamePacket>> {
    let mut handles = Vec::new();
    for name in names {
        let Some(credentials) = source.credentials(name) else {
            tracing::warn!(account = %name, "no credentials, skipping");
            continue;
        };
        match connect_account(config, credentials, runtime.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::error!(account = %name, error = %e, "failed to connect"),
        }
    }
    handles
}
