//! RSA identities and the nonce challenge that proves them.
//!
//! An identity is an RSA key pair. Its hash is the SHA-256 of the
//! DER-encoded public key. A server trusts a client when the announced hash
//! and key match an entry in its [`TrustStore`] *and* the client can decrypt
//! a fresh nonce encrypted to that key (RSA-OAEP with SHA-256).

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use quarry_config::Config;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read key {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed key: {0}")]
    Malformed(String),
    #[error(transparent)]
    Rsa(#[from] rsa::Error),
}

/// SHA-256 of a DER-encoded public key.
pub fn identity_hash(public_der: &[u8]) -> Vec<u8> {
    Sha256::digest(public_der).to_vec()
}

fn read(path: &Path) -> Result<Vec<u8>, IdentityError> {
    std::fs::read(path).map_err(|source| IdentityError::Read {
        path: path.to_owned(),
        source,
    })
}

/// This instance's key pair.
pub struct Identity {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
    hash: Vec<u8>,
}

impl Identity {
    /// Generate a fresh key pair.
    pub fn generate(bits: usize) -> Result<Self, IdentityError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        Self::from_private(private)
    }

    /// Parse a PKCS#8 DER private key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, IdentityError> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        Self::from_private(private)
    }

    /// Load a PKCS#8 DER private key file.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let identity = Self::from_pkcs8_der(&read(path)?)?;
        tracing::info!(path = %path.display(), "loaded identity key");
        Ok(identity)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, IdentityError> {
        let public_der = private
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| IdentityError::Malformed(e.to_string()))?
            .as_bytes()
            .to_vec();
        let hash = identity_hash(&public_der);
        Ok(Self {
            private,
            public_der,
            hash,
        })
    }

    /// PKCS#8 DER encoding of the private key, for persisting.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, IdentityError> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// The key named by `operator.identity_key`, if one is set.
    pub fn from_config(config: &Config) -> Result<Option<Self>, IdentityError> {
        config
            .operator
            .identity_key
            .as_deref()
            .map(Self::load)
            .transpose()
    }

    /// Decrypt a challenge addressed to this identity.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, IdentityError> {
        Ok(self.private.decrypt(Oaep::new::<Sha256>(), ciphertext)?)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("hash", &hex(&self.hash))
            .finish_non_exhaustive()
    }
}

/// Short lower-case hex for logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Encrypt a fresh random nonce to `key`. Returns `(nonce, ciphertext)`.
pub fn challenge(key: &RsaPublicKey) -> Result<(Vec<u8>, Vec<u8>), IdentityError> {
    let mut rng = rand::thread_rng();
    let mut nonce = vec![0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let ciphertext = key.encrypt(&mut rng, Oaep::new::<Sha256>(), &nonce)?;
    Ok((nonce, ciphertext))
}

#[derive(Debug)]
struct TrustedKey {
    der: Vec<u8>,
    key: RsaPublicKey,
}

/// Public keys of clients allowed to report to this server, by hash.
#[derive(Default, Debug)]
pub struct TrustStore {
    keys: HashMap<Vec<u8>, TrustedKey>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every DER public key file listed.
    pub fn load(paths: &[PathBuf]) -> Result<Self, IdentityError> {
        let mut store = Self::new();
        for path in paths {
            let hash = store.add_der(&read(path)?)?;
            tracing::info!(path = %path.display(), hash = %hex(&hash), "trusted key loaded");
        }
        Ok(store)
    }

    /// Trust a DER-encoded public key. Returns its hash.
    pub fn add_der(&mut self, der: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        let hash = identity_hash(der);
        self.keys.insert(
            hash.clone(),
            TrustedKey {
                der: der.to_vec(),
                key,
            },
        );
        Ok(hash)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, hash: &[u8]) -> bool {
        self.keys.contains_key(hash)
    }

    /// The trusted key for an announced hash and key, if both match.
    pub fn verify(&self, hash: &[u8], public_der: &[u8]) -> Option<&RsaPublicKey> {
        let trusted = self.keys.get(hash)?;
        (trusted.der == public_der).then_some(&trusted.key)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, OnceLock};

    /// Key generation is slow; tests share two keys.
    pub(crate) fn test_identity(which: usize) -> Arc<Identity> {
        static KEYS: OnceLock<[Arc<Identity>; 2]> = OnceLock::new();
        let keys = KEYS.get_or_init(|| {
            [
                Arc::new(Identity::generate(1024).unwrap()),
                Arc::new(Identity::generate(1024).unwrap()),
            ]
        });
        Arc::clone(&keys[which])
    }

    #[test]
    fn test_hash_is_sha256_of_public_key() {
        let identity = test_identity(0);
        assert_eq!(identity.hash().len(), 32);
        assert_eq!(identity.hash(), identity_hash(identity.public_der()).as_slice());
    }

    #[test]
    fn test_challenge_roundtrip() {
        let identity = test_identity(0);
        let mut store = TrustStore::new();
        let hash = store.add_der(identity.public_der()).unwrap();
        let key = store.verify(&hash, identity.public_der()).unwrap();

        let (nonce, ciphertext) = challenge(key).unwrap();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert_ne!(ciphertext, nonce);
        assert_eq!(identity.decrypt(&ciphertext).unwrap(), nonce);
    }

    #[test]
    fn test_wrong_identity_cannot_decrypt() {
        let mut store = TrustStore::new();
        let hash = store.add_der(test_identity(0).public_der()).unwrap();
        let key = store.verify(&hash, test_identity(0).public_der()).unwrap();
        let (_, ciphertext) = challenge(key).unwrap();
        assert!(test_identity(1).decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_verify_requires_matching_key() {
        let mut store = TrustStore::new();
        let hash = store.add_der(test_identity(0).public_der()).unwrap();
        assert!(store.contains(&hash));
        assert!(store.verify(&hash, test_identity(1).public_der()).is_none());
        assert!(
            store
                .verify(test_identity(1).hash(), test_identity(1).public_der())
                .is_none()
        );
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let identity = test_identity(1);
        let private_path = dir.path().join("id.der");
        let public_path = dir.path().join("id.pub.der");
        std::fs::write(&private_path, identity.to_pkcs8_der().unwrap()).unwrap();
        std::fs::write(&public_path, identity.public_der()).unwrap();

        let loaded = Identity::load(&private_path).unwrap();
        assert_eq!(loaded.hash(), identity.hash());

        let mut config = Config::default();
        assert!(Identity::from_config(&config).unwrap().is_none());
        config.operator.identity_key = Some(private_path.clone());
        let configured = Identity::from_config(&config).unwrap().unwrap();
        assert_eq!(configured.hash(), identity.hash());

        let store = TrustStore::load(&[public_path]).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains(identity.hash()));
    }

    #[test]
    fn test_missing_and_malformed_keys() {
        let err = TrustStore::load(&[PathBuf::from("/nonexistent/key.der")]).unwrap_err();
        assert!(matches!(err, IdentityError::Read { .. }));
        assert!(matches!(
            Identity::from_pkcs8_der(&[1, 2, 3]),
            Err(IdentityError::Malformed(_))
        ));
    }
}
