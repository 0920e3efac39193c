//! Wire protocol: primitive codec, typed values, and the two packet registries
//! (game protocol and operator protocol) that share one framing layer.

pub mod codec;
pub mod game;
pub mod operator;
pub mod registry;
pub mod types;

pub use codec::{CodecError, PacketReader, PacketWriter, Wire, WireEnum};
pub use game::GamePacket;
pub use operator::OperatorPacket;
pub use registry::{Packet, PacketSide, ProtocolError};
pub use types::{
    Angle, BlockPos, ChunkPos, ConfigRuleDesc, DataType, Dimension, NamedEnum, ParamDescription,
    ParamValue, Parameter, Position, Priority, TaskDescriptor, Value,
};
