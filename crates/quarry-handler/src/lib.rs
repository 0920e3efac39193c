//! Handler chains: game-protocol login and account handling, and both ends
//! of the operator protocol.

pub mod account;
pub mod client;
pub mod convert;
pub mod identity;
pub mod login;
pub mod server;

pub use account::{AccountHandler, ConnectionLink};
pub use client::{
    ClientInfo, OperatorClient, OperatorOutbox, OperatorState, Urgency, client_type,
    connect_operator,
};
pub use identity::{Identity, IdentityError, TrustStore};
pub use login::{
    CredentialSource, Credentials, HandleSlot, LoginHandler, StaticCredentials, connect_account,
    connect_accounts,
};
pub use server::{
    OperatorServer, PROOF_FAILED, ReportedHandler, ReportedPlayer, ReportedTask, ReportedTracker,
    ServerError, ServerHandler, ServerState, UNTRUSTED,
};
