//! AES-128 in CFB8 mode as a byte-granular stream cipher.
//!
//! CFB8 processes one byte per block operation, so any split of the stream
//! into writes produces the same ciphertext and there is never a partial
//! block to buffer.

use aes::Aes128;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes128Cfb8Enc = cfb8::Encryptor<Aes128>;
type Aes128Cfb8Dec = cfb8::Decryptor<Aes128>;

/// Shared key material for one connection.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl CipherKey {
    /// Split a 32-byte digest: first half key, second half IV.
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        iv.copy_from_slice(&digest[16..]);
        Self { key, iv }
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Encrypting half of a cipher stream.
pub struct StreamEncryptor {
    inner: Aes128Cfb8Enc,
}

impl StreamEncryptor {
    pub fn new(key: &CipherKey) -> Self {
        Self {
            inner: Aes128Cfb8Enc::new(&key.key.into(), &key.iv.into()),
        }
    }

    /// Encrypt `buf` in place, continuing the stream.
    pub fn apply(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(1) {
            self.inner.encrypt_block_mut(chunk.into());
        }
    }
}

/// Decrypting half of a cipher stream.
pub struct StreamDecryptor {
    inner: Aes128Cfb8Dec,
}

impl StreamDecryptor {
    pub fn new(key: &CipherKey) -> Self {
        Self {
            inner: Aes128Cfb8Dec::new(&key.key.into(), &key.iv.into()),
        }
    }

    /// Decrypt `buf` in place, continuing the stream.
    pub fn apply(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(1) {
            self.inner.decrypt_block_mut(chunk.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CipherKey {
        let digest: [u8; 32] = std::array::from_fn(|i| i as u8 * 7);
        CipherKey::from_digest(&digest)
    }

    #[test]
    fn test_byte_by_byte_matches_bulk() {
        let plain: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let mut bulk = plain.clone();
        StreamEncryptor::new(&key()).apply(&mut bulk);

        let mut single = plain.clone();
        let mut enc = StreamEncryptor::new(&key());
        for byte in single.chunks_mut(1) {
            enc.apply(byte);
        }

        assert_eq!(bulk, single);
        assert_ne!(bulk, plain);
    }

    #[test]
    fn test_uneven_splits_decrypt() {
        let plain = b"frames do not align with cipher blocks".to_vec();
        let mut data = plain.clone();
        StreamEncryptor::new(&key()).apply(&mut data);

        let mut dec = StreamDecryptor::new(&key());
        let (a, rest) = data.split_at_mut(3);
        let (b, c) = rest.split_at_mut(17);
        dec.apply(a);
        dec.apply(b);
        dec.apply(c);
        assert_eq!(data, plain);
    }

    #[test]
    fn test_digest_split() {
        let k = key();
        assert_eq!(k.key[1], 7);
        assert_eq!(k.iv[0], 16 * 7);
    }
}
