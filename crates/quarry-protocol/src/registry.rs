//! Packet registries.
//!
//! A registry is a closed enum over every packet of one protocol. The
//! [`packet_registry!`](crate::packet_registry) macro generates the enum, the
//! ID and side tables, and a `match`-based decoder, so adding a packet is one
//! line and an unknown ID can never reach application code.

use crate::codec::{CodecError, PacketReader, PacketWriter};

/// Which peer may legally send a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketSide {
    /// Only the connecting peer sends it.
    Client,
    /// Only the accepting peer sends it.
    Server,
    /// Either peer may send it.
    Both,
}

impl PacketSide {
    /// The peer at the other end of a connection.
    pub fn opposite(self) -> Self {
        match self {
            PacketSide::Client => PacketSide::Server,
            PacketSide::Server => PacketSide::Client,
            PacketSide::Both => PacketSide::Both,
        }
    }

    /// Whether a peer on side `sender` may send a packet tagged `self`.
    pub fn allows(self, sender: PacketSide) -> bool {
        self == PacketSide::Both || self == sender
    }
}

/// Errors raised while mapping between packets and frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The peer used an ID this registry does not know.
    #[error("unknown {registry} packet id 0x{id:02X}")]
    UnknownPacketId {
        /// Registry the lookup ran against.
        registry: &'static str,
        /// Offending ID.
        id: u16,
    },
    /// A packet arrived from a peer not allowed to send it.
    #[error("{registry} packet 0x{id:02X} may not be sent by the {sender:?} side")]
    WrongSide {
        /// Registry the packet belongs to.
        registry: &'static str,
        /// Packet ID.
        id: u16,
        /// Side that sent it.
        sender: PacketSide,
    },
    /// The body decoded but bytes were left over.
    #[error("{registry} packet 0x{id:02X} has {remaining} trailing bytes")]
    TrailingBytes {
        /// Registry the packet belongs to.
        registry: &'static str,
        /// Packet ID.
        id: u16,
        /// Bytes left unread.
        remaining: usize,
    },
    /// The body was malformed.
    #[error("malformed packet body: {0}")]
    Codec(#[from] CodecError),
}

/// A closed set of packets sharing one numeric ID space.
pub trait Packet: Sized + Send + std::fmt::Debug + 'static {
    /// Registry name used in diagnostics.
    const REGISTRY: &'static str;

    /// Numeric ID of this packet.
    fn id(&self) -> u16;

    /// Variant name, for logs.
    fn name(&self) -> &'static str;

    /// Side restriction of this packet.
    fn side(&self) -> PacketSide {
        // Every constructed packet has a registered ID.
        Self::side_of(self.id()).unwrap_or(PacketSide::Both)
    }

    /// Side restriction for a raw ID, if registered.
    fn side_of(id: u16) -> Option<PacketSide>;

    /// Append the body encoding.
    fn encode_body(&self, w: &mut PacketWriter);

    /// Decode a body received under `id`, rejecting trailing bytes.
    fn decode(id: u16, body: &[u8]) -> Result<Self, ProtocolError>;

    /// Encode into `(type_id, body)`.
    fn encode(&self) -> (u16, Vec<u8>) {
        let mut w = PacketWriter::new();
        self.encode_body(&mut w);
        (self.id(), w.into_inner())
    }

    /// Decode a packet received by a peer on side `local`.
    ///
    /// The remote end is `local.opposite()`; a packet it may not send is a
    /// protocol error.
    fn decode_inbound(id: u16, body: &[u8], local: PacketSide) -> Result<Self, ProtocolError> {
        let side = Self::side_of(id).ok_or(ProtocolError::UnknownPacketId {
            registry: Self::REGISTRY,
            id,
        })?;
        let sender = local.opposite();
        if !side.allows(sender) {
            return Err(ProtocolError::WrongSide {
                registry: Self::REGISTRY,
                id,
                sender,
            });
        }
        Self::decode(id, body)
    }
}

/// Finish decoding a body: every byte must have been consumed.
pub fn finish_decode(
    registry: &'static str,
    id: u16,
    reader: &PacketReader<'_>,
) -> Result<(), ProtocolError> {
    if reader.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::TrailingBytes {
            registry,
            id,
            remaining: reader.remaining(),
        })
    }
}

/// Declare a packet registry enum.
///
/// ```ignore
/// packet_registry! {
///     pub enum GamePacket in "game" {
///         0x00 => ServerInfo(ServerInfo): Server,
///     }
/// }
/// ```
#[macro_export]
macro_rules! packet_registry {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident in $registry:literal {
            $( $id:literal => $variant:ident($ty:ty) : $side:ident ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis enum $name {
            $( $variant($ty), )*
        }

        impl $crate::registry::Packet for $name {
            const REGISTRY: &'static str = $registry;

            fn id(&self) -> u16 {
                match self {
                    $( $name::$variant(_) => $id, )*
                }
            }

            fn name(&self) -> &'static str {
                match self {
                    $( $name::$variant(_) => stringify!($variant), )*
                }
            }

            fn side_of(id: u16) -> Option<$crate::registry::PacketSide> {
                match id {
                    $( $id => Some($crate::registry::PacketSide::$side), )*
                    _ => None,
                }
            }

            fn encode_body(&self, w: &mut $crate::codec::PacketWriter) {
                match self {
                    $( $name::$variant(p) => $crate::codec::Wire::write(p, w), )*
                }
            }

            fn decode(id: u16, body: &[u8]) -> Result<Self, $crate::registry::ProtocolError> {
                let mut r = $crate::codec::PacketReader::new(body);
                let packet = match id {
                    $( $id => $name::$variant(<$ty as $crate::codec::Wire>::read(&mut r)?), )*
                    _ => {
                        return Err($crate::registry::ProtocolError::UnknownPacketId {
                            registry: $registry,
                            id,
                        });
                    }
                };
                $crate::registry::finish_decode($registry, id, &r)?;
                Ok(packet)
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(p: $ty) -> Self {
                    $name::$variant(p)
                }
            }
        )*
    };
}
