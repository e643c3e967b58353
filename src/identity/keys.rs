//! Per-node cryptographic identity
//!
//! Each node has one Ed25519 signing keypair. The 32-byte seed lives in
//! `node_id.seed` (owner read/write only) and the 32-byte public key in
//! `node_id.pub`, both raw bytes, inside the configured keys directory.
//! Trust between nodes is TOFU: a peer's key is whatever it first presents.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use super::IdentityError;

pub struct NodeIdentity {
    signing_key: SigningKey,
    keys_dir: Option<PathBuf>,
}

impl NodeIdentity {
    pub const SEED_FILE: &'static str = "node_id.seed";
    pub const PUB_FILE: &'static str = "node_id.pub";

    /// Generate an in-memory identity that is never written to disk.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            keys_dir: None,
        }
    }

    /// Load the identity from `keys_dir`, generating and persisting one on first boot.
    ///
    /// Idempotent: once the seed exists the same keypair is returned every time.
    pub fn ensure_identity(keys_dir: &Path) -> Result<Self, IdentityError> {
        std::fs::create_dir_all(keys_dir).map_err(|e| IdentityError::IoError(e.to_string()))?;

        let identity = if keys_dir.join(Self::SEED_FILE).exists() {
            Self::load(keys_dir)?
        } else {
            let identity = Self {
                signing_key: SigningKey::generate(&mut OsRng),
                keys_dir: Some(keys_dir.to_path_buf()),
            };
            identity.save_seed()?;
            log::info!("Generated new node identity in {}", keys_dir.display());
            identity
        };

        // The public key file is derived; rewrite it if it went missing
        if !keys_dir.join(Self::PUB_FILE).exists() {
            identity.save_public_key()?;
        }

        Ok(identity)
    }

    fn load(keys_dir: &Path) -> Result<Self, IdentityError> {
        let mut data = std::fs::read(keys_dir.join(Self::SEED_FILE))
            .map_err(|e| IdentityError::IoError(e.to_string()))?;

        let seed: Result<[u8; 32], _> = data.as_slice().try_into();
        let len = data.len();
        data.zeroize();

        let mut seed = seed.map_err(|_| {
            IdentityError::InvalidKeyMaterial(format!("seed must be 32 bytes, found {}", len))
        })?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        Ok(Self {
            signing_key,
            keys_dir: Some(keys_dir.to_path_buf()),
        })
    }

    fn save_seed(&self) -> Result<(), IdentityError> {
        let Some(dir) = &self.keys_dir else {
            return Ok(());
        };

        let mut seed = self.signing_key.to_bytes();
        let result = write_private(&dir.join(Self::SEED_FILE), &seed);
        seed.zeroize();
        result?;

        self.save_public_key()
    }

    fn save_public_key(&self) -> Result<(), IdentityError> {
        let Some(dir) = &self.keys_dir else {
            return Ok(());
        };
        std::fs::write(dir.join(Self::PUB_FILE), self.public_key_bytes())
            .map_err(|e| IdentityError::IoError(e.to_string()))
    }

    /// Directory the keys were loaded from, if persisted.
    pub fn keys_dir(&self) -> Option<&Path> {
        self.keys_dir.as_deref()
    }

    /// Sign arbitrary data with the node's signing key.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    pub fn sign_hex(&self, data: &[u8]) -> String {
        hex::encode(self.sign(data))
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Verify `signature` over `data` against a raw public key.
    ///
    /// Malformed keys or signatures simply fail verification.
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }

    /// `verify` over hex-encoded signature and key, as carried on the wire.
    pub fn verify_hex(data: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
        match (hex::decode(signature_hex), hex::decode(public_key_hex)) {
            (Ok(signature), Ok(public_key)) => Self::verify(data, &signature, &public_key),
            _ => false,
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| IdentityError::IoError(e.to_string()))?;
    file.write_all(bytes)
        .map_err(|e| IdentityError::IoError(e.to_string()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    let mut file = std::fs::File::create(path).map_err(|e| IdentityError::IoError(e.to_string()))?;
    file.write_all(bytes)
        .map_err(|e| IdentityError::IoError(e.to_string()))
}
