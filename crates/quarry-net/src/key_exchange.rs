//! Finite-field Diffie-Hellman agreement for the game-protocol handshake.
//!
//! The server announces `p`, `g` and its public value; the client answers
//! with its own public value. Both sides hash the shared secret with
//! SHA-256 and split the digest into an AES-128 key and IV.

use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::cipher::CipherKey;

/// 1024-bit MODP prime from RFC 2409, group 2.
const RFC2409_GROUP2_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF",
);

/// Errors raised while agreeing on a key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    /// The group parameters are unusable.
    #[error("invalid group parameters: {0}")]
    InvalidGroup(&'static str),
    /// The peer's public value is outside `(1, p - 1)`.
    #[error("peer public value out of range")]
    InvalidPublicValue,
}

/// A Diffie-Hellman group `(p, g)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    p: BigUint,
    g: BigUint,
}

impl DhGroup {
    /// RFC 2409 group 2 with generator 2.
    pub fn rfc2409_group2() -> Self {
        // The constant is valid hex; parsing cannot fail.
        let p = BigUint::parse_bytes(RFC2409_GROUP2_PRIME.as_bytes(), 16)
            .expect("static prime is valid hex");
        Self {
            p,
            g: BigUint::from(2u32),
        }
    }

    /// Group from big-endian magnitudes as received on the wire.
    pub fn from_bytes(p: &[u8], g: &[u8]) -> Result<Self, CipherError> {
        let p = BigUint::from_bytes_be(p);
        let g = BigUint::from_bytes_be(g);
        if p.bits() < 64 {
            return Err(CipherError::InvalidGroup("modulus too small"));
        }
        if g < BigUint::from(2u32) || g >= p {
            return Err(CipherError::InvalidGroup("generator out of range"));
        }
        Ok(Self { p, g })
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> u64 {
        self.p.bits()
    }

    /// `p` as big-endian bytes.
    pub fn p_bytes(&self) -> Vec<u8> {
        self.p.to_bytes_be()
    }

    /// `g` as big-endian bytes.
    pub fn g_bytes(&self) -> Vec<u8> {
        self.g.to_bytes_be()
    }

    /// Draw a fresh private exponent and compute the public value.
    pub fn generate(&self) -> DhKeyPair {
        let mut bytes = vec![0u8; (self.p.bits() as usize).div_ceil(8)];
        rand::thread_rng().fill_bytes(&mut bytes);
        // Exponent in [2, p - 2].
        let two = BigUint::from(2u32);
        let private = BigUint::from_bytes_be(&bytes) % (&self.p - 3u32) + &two;
        let public = self.g.modpow(&private, &self.p);
        DhKeyPair {
            group: self.clone(),
            private,
            public,
        }
    }
}

/// One side's ephemeral key pair.
pub struct DhKeyPair {
    group: DhGroup,
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Public value as big-endian bytes.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Group this pair was generated in.
    pub fn group(&self) -> &DhGroup {
        &self.group
    }

    /// Combine with the peer's public value into cipher key material.
    pub fn agree(&self, peer_public: &[u8]) -> Result<CipherKey, CipherError> {
        let peer = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);
        if peer <= one || peer >= &self.group.p - &one {
            return Err(CipherError::InvalidPublicValue);
        }
        let shared = peer.modpow(&self.private, &self.group.p);
        let digest: [u8; 32] = Sha256::digest(shared.to_bytes_be()).into();
        Ok(CipherKey::from_digest(&digest))
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("bits", &self.group.bits())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group2_is_1024_bits() {
        assert_eq!(DhGroup::rfc2409_group2().bits(), 1024);
    }

    #[test]
    fn test_both_sides_agree() {
        let group = DhGroup::rfc2409_group2();
        let server = group.generate();

        // Client rebuilds the group from the wire encoding.
        let client_group = DhGroup::from_bytes(&group.p_bytes(), &group.g_bytes()).unwrap();
        let client = client_group.generate();

        let k1 = server.agree(&client.public_bytes()).unwrap();
        let k2 = client.agree(&server.public_bytes()).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_degenerate_public_rejected() {
        let pair = DhGroup::rfc2409_group2().generate();
        assert_eq!(pair.agree(&[1]), Err(CipherError::InvalidPublicValue));
        assert_eq!(pair.agree(&[]), Err(CipherError::InvalidPublicValue));
        let p_minus_one = (&pair.group().p - 1u32).to_bytes_be();
        assert_eq!(pair.agree(&p_minus_one), Err(CipherError::InvalidPublicValue));
    }

    #[test]
    fn test_small_group_rejected() {
        assert!(DhGroup::from_bytes(&[23], &[5]).is_err());
    }
}
