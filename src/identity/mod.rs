//! Cryptographic identity for mesh nodes
//!
//! - `NodeIdentity`: the node's Ed25519 keypair, persisted as raw seed/public files

pub mod keys;

pub use keys::NodeIdentity;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
}
