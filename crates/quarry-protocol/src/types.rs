//! Typed values shared by packets, config rules and task parameters.

use std::fmt;

use crate::codec::{CodecError, PacketReader, PacketWriter, Wire};
use crate::{wire_enum, wire_struct};

// ---------------------------------------------------------------------------
// Coordinates
// ---------------------------------------------------------------------------

wire_struct! {
    /// Integer block coordinates.
    #[derive(Copy, Eq, Hash, Default)]
    pub struct BlockPos {
        pub x: i32,
        pub y: i32,
        pub z: i32,
    }
}

wire_struct! {
    /// Chunk coordinates (block coordinates divided by 16).
    #[derive(Copy, Eq, Hash, Default)]
    pub struct ChunkPos {
        pub x: i32,
        pub z: i32,
    }
}

wire_struct! {
    /// Continuous world position.
    #[derive(Copy, Default)]
    pub struct Position {
        pub x: f64,
        pub y: f64,
        pub z: f64,
    }
}

wire_struct! {
    /// View angle in degrees.
    #[derive(Copy, Default)]
    pub struct Angle {
        pub yaw: f32,
        pub pitch: f32,
    }
}

impl BlockPos {
    /// Construct a block position.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chunk containing this block.
    pub fn chunk(self) -> ChunkPos {
        ChunkPos::new(self.x >> 4, self.z >> 4)
    }
}

impl ChunkPos {
    /// Construct a chunk position.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Block at the given offset inside this chunk.
    pub fn block(self, dx: i32, y: i32, dz: i32) -> BlockPos {
        BlockPos::new((self.x << 4) + dx, y, (self.z << 4) + dz)
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// Classifiers
// ---------------------------------------------------------------------------

wire_enum! {
    /// World a query or account operates in. Used as the throughput
    /// accounting channel by the scheduler.
    pub enum Dimension {
        Nether,
        Overworld,
        End,
    }
}

wire_enum! {
    /// Scheduling priority. Later variants are served first.
    #[derive(PartialOrd, Ord)]
    pub enum Priority {
        Low,
        Medium,
        High,
        User,
    }
}

/// Upper-case names used for enum-typed values on the wire.
pub trait NamedEnum: Sized + Copy + 'static {
    /// Every variant paired with its name.
    const NAMES: &'static [(Self, &'static str)];

    /// Wire name of this variant.
    fn as_name(self) -> &'static str
    where
        Self: PartialEq,
    {
        Self::NAMES
            .iter()
            .find(|(v, _)| *v == self)
            .map(|(_, n)| *n)
            .unwrap_or("")
    }

    /// Variant for a name, case-insensitively.
    fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(v, _)| *v)
    }

    /// Every name, in declaration order.
    fn names() -> Vec<String> {
        Self::NAMES.iter().map(|(_, n)| (*n).to_owned()).collect()
    }
}

impl NamedEnum for Dimension {
    const NAMES: &'static [(Self, &'static str)] = &[
        (Dimension::Nether, "NETHER"),
        (Dimension::Overworld, "OVERWORLD"),
        (Dimension::End, "END"),
    ];
}

impl NamedEnum for Priority {
    const NAMES: &'static [(Self, &'static str)] = &[
        (Priority::Low, "LOW"),
        (Priority::Medium, "MEDIUM"),
        (Priority::High, "HIGH"),
        (Priority::User, "USER"),
    ];
}

// ---------------------------------------------------------------------------
// Typed values
// ---------------------------------------------------------------------------

wire_enum! {
    /// Declared type of a config rule or task parameter.
    pub enum DataType {
        Position,
        Angle,
        ChunkPosition,
        String,
        Integer,
        Float,
        Boolean,
        Enum,
    }
}

/// A value of one [`DataType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Position(Position),
    Angle(Angle),
    ChunkPosition(ChunkPos),
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Enum constant by name.
    Enum(String),
}

impl Value {
    /// Type tag of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Position(_) => DataType::Position,
            Value::Angle(_) => DataType::Angle,
            Value::ChunkPosition(_) => DataType::ChunkPosition,
            Value::String(_) => DataType::String,
            Value::Integer(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::Boolean(_) => DataType::Boolean,
            Value::Enum(_) => DataType::Enum,
        }
    }

    /// Write the value without a type tag.
    pub fn write_body(&self, w: &mut PacketWriter) {
        match self {
            Value::Position(p) => p.write(w),
            Value::Angle(a) => a.write(w),
            Value::ChunkPosition(c) => c.write(w),
            Value::String(s) | Value::Enum(s) => w.write_string(s),
            Value::Integer(i) => w.write_varlong(*i),
            Value::Float(f) => w.write_f64(*f),
            Value::Boolean(b) => w.write_bool(*b),
        }
    }

    /// Read an untagged value whose type is known from context.
    pub fn read_body(data_type: DataType, r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(match data_type {
            DataType::Position => Value::Position(Position::read(r)?),
            DataType::Angle => Value::Angle(Angle::read(r)?),
            DataType::ChunkPosition => Value::ChunkPosition(ChunkPos::read(r)?),
            DataType::String => Value::String(r.read_string()?),
            DataType::Integer => Value::Integer(r.read_varlong()?),
            DataType::Float => Value::Float(r.read_f64()?),
            DataType::Boolean => Value::Boolean(r.read_bool()?),
            DataType::Enum => Value::Enum(r.read_string()?),
        })
    }

    /// Integer content, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Float content; integers widen.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Boolean content.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// String or enum name content.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// Chunk position content.
    pub fn as_chunk(&self) -> Option<ChunkPos> {
        match self {
            Value::ChunkPosition(c) => Some(*c),
            _ => None,
        }
    }

    /// Decode an enum-typed value into `E`.
    pub fn as_enum<E: NamedEnum>(&self) -> Option<E> {
        match self {
            Value::Enum(s) => E::from_name(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Position(p) => write!(f, "({:.1}, {:.1}, {:.1})", p.x, p.y, p.z),
            Value::Angle(a) => write!(f, "({:.1}, {:.1})", a.yaw, a.pitch),
            Value::ChunkPosition(c) => write!(f, "{c}"),
            Value::String(s) | Value::Enum(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Tagged encoding: type ordinal followed by the body.
impl Wire for Value {
    fn write(&self, w: &mut PacketWriter) {
        self.data_type().write(w);
        self.write_body(w);
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let data_type = DataType::read(r)?;
        Value::read_body(data_type, r)
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

wire_struct! {
    /// Declared shape of one task parameter.
    pub struct ParamDescription {
        pub name: String,
        pub data_type: DataType,
        /// `false` when the parameter takes an array of values.
        pub singular: bool,
        /// Allowed names for [`DataType::Enum`] parameters.
        pub enum_values: Vec<String>,
    }
}

impl ParamDescription {
    /// A single-valued parameter.
    pub fn single(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_owned(),
            data_type,
            singular: true,
            enum_values: Vec::new(),
        }
    }

    /// A single-valued enum parameter.
    pub fn enumeration<E: NamedEnum>(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            data_type: DataType::Enum,
            singular: true,
            enum_values: E::names(),
        }
    }

    /// An array-valued parameter.
    pub fn array(name: &str, data_type: DataType) -> Self {
        Self {
            singular: false,
            ..Self::single(name, data_type)
        }
    }

    /// Whether `value` fits this description.
    pub fn accepts(&self, value: &ParamValue) -> bool {
        let type_ok = |v: &Value| {
            v.data_type() == self.data_type
                && (self.data_type != DataType::Enum
                    || self.enum_values.is_empty()
                    || v.as_str()
                        .is_some_and(|s| self.enum_values.iter().any(|e| e.eq_ignore_ascii_case(s))))
        };
        match value {
            ParamValue::Single(v) => self.singular && type_ok(v),
            ParamValue::Array(vs) => !self.singular && vs.iter().all(type_ok),
        }
    }
}

/// One or many values for a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Single(Value),
    Array(Vec<Value>),
}

/// A parameter value paired with its description.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub description: ParamDescription,
    pub value: ParamValue,
}

impl Parameter {
    /// A single-valued parameter, described from the value's own type.
    pub fn single(name: &str, value: Value) -> Self {
        Self {
            description: ParamDescription::single(name, value.data_type()),
            value: ParamValue::Single(value),
        }
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.description.name
    }

    /// The value when single.
    pub fn single_value(&self) -> Option<&Value> {
        match &self.value {
            ParamValue::Single(v) => Some(v),
            ParamValue::Array(_) => None,
        }
    }
}

/// Description first, then the value(s) untagged.
impl Wire for Parameter {
    fn write(&self, w: &mut PacketWriter) {
        self.description.write(w);
        match &self.value {
            ParamValue::Single(v) => v.write_body(w),
            ParamValue::Array(vs) => {
                w.write_len(vs.len());
                for v in vs {
                    v.write_body(w);
                }
            }
        }
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let description = ParamDescription::read(r)?;
        let value = if description.singular {
            ParamValue::Single(Value::read_body(description.data_type, r)?)
        } else {
            let len = r.read_len(r.remaining())?;
            let mut values = Vec::with_capacity(len);
            for _ in 0..len {
                values.push(Value::read_body(description.data_type, r)?);
            }
            ParamValue::Array(values)
        };
        Ok(Self { description, value })
    }
}

wire_struct! {
    /// Static descriptor of a startable task.
    pub struct TaskDescriptor {
        pub name: String,
        pub description: String,
        pub params: Vec<ParamDescription>,
    }
}

wire_struct! {
    /// Remote view of one config rule.
    pub struct ConfigRuleDesc {
        pub name: String,
        pub data_type: DataType,
        pub enum_values: Vec<String>,
        pub gettable: bool,
        pub settable: bool,
    }
}
