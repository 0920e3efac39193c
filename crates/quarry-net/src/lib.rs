//! Connection substrate: framing, compression, stream cipher, key agreement,
//! the threaded connection loop, and the accept loop.

pub mod cipher;
pub mod compression;
pub mod connection;
pub mod framing;
pub mod key_exchange;
pub mod listener;

pub use cipher::CipherKey;
pub use compression::{CompressionConfig, CompressionError};
pub use connection::{
    Connection, ConnectionConfig, ConnectionHandle, ConnectionState, Handler, HandlerContext,
    HandlerError, SendError, SessionInfo, TIMED_OUT,
};
pub use framing::{Frame, FrameConfig, FrameError, FramedReader, FramedWriter};
pub use key_exchange::{CipherError, DhGroup, DhKeyPair};
pub use listener::{ConnectionId, HandlerFactory, IdGenerator, Listener, ListenerConfig};
