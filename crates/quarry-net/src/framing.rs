//! Length-prefixed framing over a blocking TCP stream.
//!
//! Every packet on the wire is one frame:
//!
//! ```text
//! +-------------------+-----------+-------------------+-------------------+
//! | length (4 bytes)  | flags (1) | type id (2 bytes) | payload           |
//! | u32 big-endian    | bit0=zlib | u16 big-endian    | (length bytes)    |
//! +-------------------+-----------+-------------------+-------------------+
//! ```
//!
//! `length` counts the payload as sent, after optional compression. When a
//! stream cipher is active every byte, header included, passes through it.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::cipher::{CipherKey, StreamDecryptor, StreamEncryptor};
use crate::compression::{self, CompressionConfig, CompressionError, FLAG_COMPRESSED};

/// Bytes in a frame header.
pub const HEADER_LEN: usize = 7;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes, before and after inflation. Default: 2 MB.
    pub max_payload_size: u32,
    /// Deadline for the rest of a frame once its first byte has arrived.
    pub body_timeout: Duration,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 2 * 1024 * 1024,
            body_timeout: Duration::from_secs(10),
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame started arriving and then stalled past the body deadline.
    #[error("peer stalled mid-frame after {read} of {expected} bytes")]
    Stalled {
        /// Bytes received for the current part.
        read: usize,
        /// Bytes expected for the current part.
        expected: usize,
    },

    /// A compressed payload could not be inflated.
    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One received frame, already inflated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_id: u16,
    pub payload: Vec<u8>,
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reading half of a framed stream.
pub struct FramedReader {
    stream: TcpStream,
    decryptor: Option<StreamDecryptor>,
    config: FrameConfig,
}

impl FramedReader {
    pub fn new(stream: TcpStream, config: FrameConfig) -> Self {
        Self {
            stream,
            decryptor: None,
            config,
        }
    }

    /// Decrypt everything read from now on.
    pub fn enable_encryption(&mut self, key: &CipherKey) {
        self.decryptor = Some(StreamDecryptor::new(key));
    }

    /// Whether a cipher is active.
    pub fn is_encrypted(&self) -> bool {
        self.decryptor.is_some()
    }

    /// Fill `buf` completely. Returns `Ok(false)` only if `idle_ok` and the
    /// first read timed out with nothing received.
    fn fill(&mut self, buf: &mut [u8], first_timeout: Duration, idle_ok: bool) -> Result<bool, FrameError> {
        let mut filled = 0;
        self.stream.set_read_timeout(Some(first_timeout))?;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    if let Some(dec) = self.decryptor.as_mut() {
                        dec.apply(&mut buf[filled..filled + n]);
                    }
                    if filled == 0 && idle_ok {
                        self.stream.set_read_timeout(Some(self.config.body_timeout))?;
                    }
                    filled += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) => {
                    if filled == 0 && idle_ok {
                        return Ok(false);
                    }
                    return Err(FrameError::Stalled {
                        read: filled,
                        expected: buf.len(),
                    });
                }
                Err(e) => return Err(FrameError::Io(e)),
            }
        }
        Ok(true)
    }

    /// Read one frame, waiting at most `timeout` for it to start.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Once any byte of a
    /// frame has been received, the rest must arrive within the body timeout.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        if !self.fill(&mut header, timeout, true)? {
            return Ok(None);
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let flags = header[4];
        let type_id = u16::from_be_bytes([header[5], header[6]]);

        if length > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: length,
                max: self.config.max_payload_size,
            });
        }

        let mut payload = vec![0u8; length as usize];
        if length > 0 {
            self.fill(&mut payload, self.config.body_timeout, false)?;
        }

        if flags & FLAG_COMPRESSED != 0 {
            payload = compression::decompress(&payload, self.config.max_payload_size as usize)?;
        }

        Ok(Some(Frame { type_id, payload }))
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writing half of a framed stream.
pub struct FramedWriter {
    stream: TcpStream,
    encryptor: Option<StreamEncryptor>,
    compression: CompressionConfig,
    config: FrameConfig,
}

impl FramedWriter {
    pub fn new(stream: TcpStream, config: FrameConfig, compression: CompressionConfig) -> Self {
        Self {
            stream,
            encryptor: None,
            compression,
            config,
        }
    }

    /// Encrypt everything written from now on.
    pub fn enable_encryption(&mut self, key: &CipherKey) {
        self.encryptor = Some(StreamEncryptor::new(key));
    }

    /// Replace the compression policy.
    pub fn set_compression(&mut self, compression: CompressionConfig) {
        self.compression = compression;
    }

    /// Current compression policy.
    pub fn compression(&self) -> CompressionConfig {
        self.compression
    }

    /// Write one frame, compressing when allowed and above threshold.
    pub fn write_frame(
        &mut self,
        type_id: u16,
        payload: &[u8],
        allow_compression: bool,
    ) -> Result<(), FrameError> {
        let (flags, body) = compression::encode_payload(payload, &self.compression, allow_compression);
        let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
        if len > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.config.max_payload_size,
            });
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(flags);
        buf.extend_from_slice(&type_id.to_be_bytes());
        buf.extend_from_slice(&body);

        if let Some(enc) = self.encryptor.as_mut() {
            enc.apply(&mut buf);
        }
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Close both directions of the socket.
    pub fn shutdown(&mut self) {
        let _ = self.stream.flush();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Split a connected stream into framed halves.
pub fn split(
    stream: TcpStream,
    config: FrameConfig,
    compression: CompressionConfig,
) -> io::Result<(FramedReader, FramedWriter)> {
    stream.set_nodelay(true)?;
    let read_half = stream.try_clone()?;
    Ok((
        FramedReader::new(read_half, config.clone()),
        FramedWriter::new(stream, config, compression),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const POLL: Duration = Duration::from_millis(50);

    fn pair(compression: CompressionConfig) -> (FramedReader, FramedWriter, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let raw = server.try_clone().unwrap();
        let (_, writer) = split(client, FrameConfig::default(), compression).unwrap();
        let reader = FramedReader::new(server, FrameConfig::default());
        (reader, writer, raw)
    }

    #[test]
    fn test_roundtrip_various_sizes() {
        let (mut reader, mut writer, _raw) = pair(CompressionConfig::default());
        for size in [0usize, 1, 255, 4096, 65_535] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            writer.write_frame(9, &payload, true).unwrap();
            let frame = reader.read_frame(Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(frame.type_id, 9);
            assert_eq!(frame.payload, payload, "size {size}");
        }
    }

    #[test]
    fn test_roundtrip_compressed() {
        let config = CompressionConfig {
            threshold: 16,
            enabled: true,
        };
        let (mut reader, mut writer, _raw) = pair(config);
        for size in [0usize, 16, 17, 65_535] {
            let payload = vec![3u8; size];
            writer.write_frame(1, &payload, true).unwrap();
            let frame = reader.read_frame(Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(frame.payload, payload, "size {size}");
        }
    }

    #[test]
    fn test_header_is_big_endian_with_flag() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        let config = CompressionConfig {
            threshold: 4,
            enabled: true,
        };
        let mut writer = FramedWriter::new(client, FrameConfig::default(), config);

        writer.write_frame(0x0102, &[7, 7, 7, 7], true).unwrap();
        let mut header = [0u8; HEADER_LEN + 4];
        server.read_exact(&mut header).unwrap();
        assert_eq!(header, [0, 0, 0, 4, 0, 0x01, 0x02, 7, 7, 7, 7]);

        writer.write_frame(0x0003, &[7, 7, 7, 7, 7], true).unwrap();
        let mut header = [0u8; HEADER_LEN];
        server.read_exact(&mut header).unwrap();
        assert_eq!(header[4], FLAG_COMPRESSED);
        assert_eq!(&header[5..], &[0x00, 0x03]);
    }

    #[test]
    fn test_timeout_with_nothing_read_is_none() {
        let (mut reader, _writer, _raw) = pair(CompressionConfig::default());
        assert!(reader.read_frame(POLL).unwrap().is_none());
    }

    #[test]
    fn test_close_mid_header_is_closed() {
        let (mut reader, writer, _raw) = pair(CompressionConfig::default());
        let mut stream = writer.stream;
        stream.write_all(&[0, 0, 0]).unwrap();
        stream.shutdown(std::net::Shutdown::Both).unwrap();
        drop(stream);
        let result = reader.read_frame(Duration::from_secs(1));
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[test]
    fn test_close_mid_body_is_closed() {
        let (mut reader, writer, _raw) = pair(CompressionConfig::default());
        let mut stream = writer.stream;
        stream.write_all(&[0, 0, 0, 10, 0, 0, 1, 1, 2]).unwrap();
        stream.shutdown(std::net::Shutdown::Both).unwrap();
        drop(stream);
        let result = reader.read_frame(Duration::from_secs(1));
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let (mut reader, writer, _raw) = pair(CompressionConfig::default());
        let mut stream = writer.stream;
        stream.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0]).unwrap();
        let result = reader.read_frame(Duration::from_secs(1));
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let (mut reader, mut writer, _raw) = pair(CompressionConfig::default());
        let key = CipherKey::from_digest(&[9u8; 32]);
        writer.enable_encryption(&key);
        reader.enable_encryption(&key);
        for payload in [&b"first"[..], &b""[..], &[0u8; 3000][..]] {
            writer.write_frame(4, payload, true).unwrap();
            let frame = reader.read_frame(Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(frame.payload, payload);
        }
        assert!(reader.is_encrypted());
    }
}
