//! Primitive codec used by packet bodies, typed values, and task parameters.
//!
//! All fixed-width integers and floats are big-endian. Variable-length
//! integers use 7-bit groups, least significant group first, with the high
//! bit marking continuation (LEB128 without zigzag). Strings and byte arrays
//! are prefixed with their length as a varint.

/// Longest string accepted on the wire, in bytes.
pub const MAX_STRING_LEN: usize = 1 << 20;

/// Errors raised while decoding a packet body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Fewer bytes remain than the next field needs.
    #[error("unexpected end of packet: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the body.
        remaining: usize,
    },
    /// A varint ran past its maximum encoded width.
    #[error("varint exceeds {0} bytes")]
    VarIntTooLong(usize),
    /// A length prefix was negative or larger than allowed.
    #[error("invalid length prefix {0}")]
    InvalidLength(i64),
    /// String bytes were not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// An enum ordinal did not name a known variant.
    #[error("invalid ordinal {ordinal} for {name}")]
    InvalidOrdinal {
        /// Enum being decoded.
        name: &'static str,
        /// Offending ordinal.
        ordinal: u32,
    },
}

/// A type with a binary encoding against a [`PacketReader`] / [`PacketWriter`].
pub trait Wire: Sized {
    /// Append the encoding of `self`.
    fn write(&self, w: &mut PacketWriter);
    /// Decode one value from the cursor.
    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError>;
}

/// A fieldless enum encoded by ordinal.
pub trait WireEnum: Sized + Copy {
    /// Name used in error messages.
    const NAME: &'static str;
    /// Ordinal written on the wire.
    fn ordinal(self) -> u32;
    /// Variant for an ordinal, if any.
    fn from_ordinal(ordinal: u32) -> Option<Self>;
}

/// Declare a fieldless enum encoded on the wire by ordinal.
///
/// Variants are numbered in declaration order starting at zero.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant, )*
        }

        impl $name {
            /// Every variant in ordinal order.
            pub const ALL: &'static [$name] = &[$($name::$variant),*];
        }

        impl $crate::codec::WireEnum for $name {
            const NAME: &'static str = stringify!($name);

            fn ordinal(self) -> u32 {
                self as u32
            }

            fn from_ordinal(ordinal: u32) -> Option<Self> {
                $name::ALL.get(ordinal as usize).copied()
            }
        }

        impl $crate::codec::Wire for $name {
            fn write(&self, w: &mut $crate::codec::PacketWriter) {
                w.write_enum(*self);
            }

            fn read(r: &mut $crate::codec::PacketReader<'_>) -> Result<Self, $crate::codec::CodecError> {
                r.read_enum()
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over a decoded frame payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_be {
    { $($fn_name:ident => $t:ty),* $(,)? } => {
        $(
            #[doc = concat!("Read a big-endian `", stringify!($t), "`.")]
            pub fn $fn_name(&mut self) -> Result<$t, CodecError> {
                let bytes = self.take(core::mem::size_of::<$t>())?;
                let mut raw = [0u8; core::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                Ok(<$t>::from_be_bytes(raw))
            }
        )*
    };
}

impl<'a> PacketReader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    read_be! {
        read_u16 => u16,
        read_i16 => i16,
        read_u32 => u32,
        read_i32 => i32,
        read_u64 => u64,
        read_i64 => i64,
        read_u128 => u128,
        read_f32 => f32,
        read_f64 => f64,
    }

    /// Read one unsigned byte.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read one signed byte.
    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a boolean; any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_var(&mut self, max_bytes: usize) -> Result<u64, CodecError> {
        let mut value = 0u64;
        for i in 0..max_bytes {
            let b = self.read_u8()?;
            value |= u64::from(b & 0x7F) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarIntTooLong(max_bytes))
    }

    /// Read a variable-length `i32` (at most 5 bytes).
    pub fn read_varint(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_var(5)? as u32 as i32)
    }

    /// Read a variable-length `i64` (at most 10 bytes).
    pub fn read_varlong(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_var(10)? as i64)
    }

    /// Read a non-negative varint length prefix no larger than `max`.
    pub fn read_len(&mut self, max: usize) -> Result<usize, CodecError> {
        let len = self.read_varint()?;
        if len < 0 || len as usize > max {
            return Err(CodecError::InvalidLength(i64::from(len)));
        }
        Ok(len as usize)
    }

    /// Read a length-prefixed byte array.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_len(self.remaining())?;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_len(MAX_STRING_LEN.min(self.remaining()))?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read an enum by its varint ordinal.
    pub fn read_enum<E: WireEnum>(&mut self) -> Result<E, CodecError> {
        let ordinal = self.read_varint()? as u32;
        E::from_ordinal(ordinal).ok_or(CodecError::InvalidOrdinal {
            name: E::NAME,
            ordinal,
        })
    }

    /// Read a varint count followed by that many values.
    pub fn read_list<T: Wire>(&mut self) -> Result<Vec<T>, CodecError> {
        // Every element takes at least one byte, which bounds the count.
        let len = self.read_len(self.remaining())?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::read(self)?);
        }
        Ok(items)
    }

    /// Read a presence flag and, when set, the value.
    pub fn read_option<T: Wire>(&mut self) -> Result<Option<T>, CodecError> {
        if self.read_bool()? {
            Ok(Some(T::read(self)?))
        } else {
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Growable buffer a packet body is encoded into.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

macro_rules! write_be {
    { $($fn_name:ident => $t:ty),* $(,)? } => {
        $(
            #[doc = concat!("Write a big-endian `", stringify!($t), "`.")]
            pub fn $fn_name(&mut self, value: $t) {
                self.buf.extend_from_slice(&value.to_be_bytes());
            }
        )*
    };
}

impl PacketWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the writer and return the encoded bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    write_be! {
        write_u16 => u16,
        write_i16 => i16,
        write_u32 => u32,
        write_i32 => i32,
        write_u64 => u64,
        write_i64 => i64,
        write_u128 => u128,
        write_f32 => f32,
        write_f64 => f64,
    }

    /// Write one unsigned byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write one signed byte.
    pub fn write_i8(&mut self, value: i8) {
        self.buf.push(value as u8);
    }

    /// Write a boolean as `0` or `1`.
    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    fn write_var(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Write a variable-length `i32`.
    pub fn write_varint(&mut self, value: i32) {
        self.write_var(u64::from(value as u32));
    }

    /// Write a variable-length `i64`.
    pub fn write_varlong(&mut self, value: i64) {
        self.write_var(value as u64);
    }

    /// Write a length prefix.
    pub fn write_len(&mut self, len: usize) {
        self.write_varint(len as i32);
    }

    /// Write a length-prefixed byte array.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Write an enum as its varint ordinal.
    pub fn write_enum<E: WireEnum>(&mut self, value: E) {
        self.write_varint(value.ordinal() as i32);
    }

    /// Write a varint count followed by each value.
    pub fn write_list<T: Wire>(&mut self, items: &[T]) {
        self.write_len(items.len());
        for item in items {
            item.write(self);
        }
    }

    /// Write a presence flag and, when present, the value.
    pub fn write_option<T: Wire>(&mut self, value: Option<&T>) {
        self.write_bool(value.is_some());
        if let Some(value) = value {
            value.write(self);
        }
    }
}

// ---------------------------------------------------------------------------
// Wire impls for primitives
// ---------------------------------------------------------------------------

macro_rules! wire_primitive {
    { $($t:ty => $write:ident / $read:ident),* $(,)? } => {
        $(
            impl Wire for $t {
                fn write(&self, w: &mut PacketWriter) {
                    w.$write(*self);
                }

                fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
                    r.$read()
                }
            }
        )*
    };
}

wire_primitive! {
    bool => write_bool / read_bool,
    u8 => write_u8 / read_u8,
    i8 => write_i8 / read_i8,
    u16 => write_u16 / read_u16,
    i16 => write_i16 / read_i16,
    u32 => write_u32 / read_u32,
    i32 => write_i32 / read_i32,
    u64 => write_u64 / read_u64,
    i64 => write_i64 / read_i64,
    u128 => write_u128 / read_u128,
    f32 => write_f32 / read_f32,
    f64 => write_f64 / read_f64,
}

impl Wire for String {
    fn write(&self, w: &mut PacketWriter) {
        w.write_string(self);
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        r.read_string()
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn write(&self, w: &mut PacketWriter) {
        w.write_list(self);
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        r.read_list()
    }
}

impl<T: Wire> Wire for Option<T> {
    fn write(&self, w: &mut PacketWriter) {
        w.write_option(self.as_ref());
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        r.read_option()
    }
}

/// Declare a struct whose encoding is its fields in declaration order.
#[macro_export]
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ty, )*
        }

        impl $crate::codec::Wire for $name {
            #[allow(unused_variables)]
            fn write(&self, w: &mut $crate::codec::PacketWriter) {
                $( $crate::codec::Wire::write(&self.$field, w); )*
            }

            #[allow(unused_variables)]
            fn read(r: &mut $crate::codec::PacketReader<'_>) -> Result<Self, $crate::codec::CodecError> {
                Ok(Self {
                    $( $field: <$ty as $crate::codec::Wire>::read(r)?, )*
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    wire_enum! {
        enum Colour {
            Red,
            Green,
            Blue,
        }
    }

    #[test]
    fn test_fixed_width_is_big_endian() {
        let mut w = PacketWriter::new();
        w.write_u16(0x0102);
        w.write_i32(-2);
        assert_eq!(w.into_inner(), vec![0x01, 0x02, 0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_varint_encodings() {
        let cases: [(i32, &[u8]); 5] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (300, &[0xAC, 0x02]),
            (-1, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        ];
        for (value, expected) in cases {
            let mut w = PacketWriter::new();
            w.write_varint(value);
            let bytes = w.into_inner();
            assert_eq!(bytes, expected, "encoding of {value}");
            assert_eq!(PacketReader::new(&bytes).read_varint().unwrap(), value);
        }
    }

    #[test]
    fn test_varlong_negative_uses_ten_bytes() {
        let mut w = PacketWriter::new();
        w.write_varlong(i64::MIN);
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 10);
        assert_eq!(PacketReader::new(&bytes).read_varlong().unwrap(), i64::MIN);
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let bytes = [0x80u8; 6];
        let result = PacketReader::new(&bytes).read_varint();
        assert_eq!(result, Err(CodecError::VarIntTooLong(5)));
    }

    #[test]
    fn test_truncated_field_reports_eof() {
        let bytes = [0x00u8, 0x01];
        let result = PacketReader::new(&bytes).read_i32();
        assert_eq!(
            result,
            Err(CodecError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_string_length_beyond_body_rejected() {
        let mut w = PacketWriter::new();
        w.write_varint(50);
        w.write_u8(b'a');
        let bytes = w.into_inner();
        let result = PacketReader::new(&bytes).read_string();
        assert_eq!(result, Err(CodecError::InvalidLength(50)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut w = PacketWriter::new();
        w.write_bytes(&[0xC3, 0x28]);
        let bytes = w.into_inner();
        assert_eq!(
            PacketReader::new(&bytes).read_string(),
            Err(CodecError::InvalidUtf8)
        );
    }

    #[test]
    fn test_enum_by_ordinal() {
        let mut w = PacketWriter::new();
        Colour::Blue.write(&mut w);
        w.write_varint(7);
        let bytes = w.into_inner();

        let mut r = PacketReader::new(&bytes);
        assert_eq!(Colour::read(&mut r).unwrap(), Colour::Blue);
        assert_eq!(
            Colour::read(&mut r),
            Err(CodecError::InvalidOrdinal {
                name: "Colour",
                ordinal: 7
            })
        );
    }

    #[test]
    fn test_list_and_option() {
        let mut w = PacketWriter::new();
        w.write_list(&[String::from("a"), String::from("bc")]);
        w.write_option(Some(&5i64));
        w.write_option::<i64>(None);
        let bytes = w.into_inner();

        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.read_list::<String>().unwrap(), vec!["a", "bc"]);
        assert_eq!(r.read_option::<i64>().unwrap(), Some(5));
        assert_eq!(r.read_option::<i64>().unwrap(), None);
        assert!(r.is_empty());
    }
}
