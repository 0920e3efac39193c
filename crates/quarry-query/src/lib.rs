//! Query scheduling: correlated probes against the game server, the pool of
//! accounts they are sent through, and the weighted scheduler that admits
//! and advances them once per tick.

pub mod account;
pub mod digging;
pub mod listener;
pub mod query;
pub mod rate;
pub mod scheduler;

pub use account::{AccountId, AccountLease, AccountLink, AccountPool, LinkError};
pub use digging::{DIGGING_CLASS, DigOutcome, DiggingQuery};
pub use listener::{ListenerId, ListenerRegistry, PacketListener};
pub use query::{HandleResult, Query, QueryContext, QueryHandle, QueryState, TickResult};
pub use rate::RateSampler;
pub use scheduler::{ClassUtilisation, Scheduler, SchedulerSettings, SchedulerStats};
