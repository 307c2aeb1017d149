// SPDX-License-Identifier: MIT

//! Core Sigsum primitives: hashes, Ed25519 keys, and namespaced signatures.

use std::fmt;

use ed25519_dalek::{Signer as _, Verifier as _};
use sha2::{Digest, Sha256};

use crate::sigsum::SigsumError;

pub const HASH_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Namespace prepended to tree leaf messages before signing, per the Sigsum
/// v1 signed data format (`namespace || 0x00 || message`).
pub const TREE_LEAF_NAMESPACE: &str = "sigsum.org/v1/tree-leaf";

/// A 32-byte SHA-256 digest, rendered as lowercase hex on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, std::hash::Hash)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    /// Hash arbitrary bytes with SHA-256.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> Result<Self, SigsumError> {
        let bytes = hex::decode(s).map_err(|_| SigsumError::MalformedHash)?;
        Ok(Hash(
            bytes.try_into().map_err(|_| SigsumError::MalformedHash)?,
        ))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A raw Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; HASH_SIZE]);

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<Self, SigsumError> {
        let bytes = hex::decode(s).map_err(|_| SigsumError::MalformedKey)?;
        Ok(PublicKey(
            bytes.try_into().map_err(|_| SigsumError::MalformedKey)?,
        ))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The key hash used as the on-log tenant identifier.
    pub fn key_hash(&self) -> Hash {
        Hash::of(&self.0)
    }

    fn verifying_key(&self) -> Result<ed25519_dalek::VerifyingKey, SigsumError> {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0).map_err(|_| SigsumError::MalformedKey)
    }

    /// Verify a signature over raw (already namespaced, if applicable) bytes.
    pub fn verify_raw(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        key.verify(message, &ed25519_dalek::Signature::from_bytes(&signature.0))
            .is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// A raw Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_hex(s: &str) -> Result<Self, SigsumError> {
        let bytes = hex::decode(s).map_err(|_| SigsumError::MalformedSignature)?;
        Ok(Signature(
            bytes
                .try_into()
                .map_err(|_| SigsumError::MalformedSignature)?,
        ))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

/// An Ed25519 keypair, persisted as the hex-encoded 32-byte seed.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        KeyPair {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, SigsumError> {
        let bytes = hex::decode(s.trim()).map_err(|_| SigsumError::MalformedKey)?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| SigsumError::MalformedKey)?;
        Ok(KeyPair {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&seed),
        })
    }

    /// The hex encoding of the private seed.
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign raw bytes without any namespace. Callers are responsible for
    /// domain separation.
    pub fn sign_raw(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.public().to_hex())
    }
}

fn attach_namespace(namespace: &str, message: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(namespace.len() + 1 + message.len());
    data.extend_from_slice(namespace.as_bytes());
    data.push(0);
    data.extend_from_slice(message);
    data
}

/// Sign a 32-byte leaf message under the tree-leaf namespace.
pub fn sign_leaf_message(keypair: &KeyPair, message: &Hash) -> Signature {
    keypair.sign_raw(&attach_namespace(TREE_LEAF_NAMESPACE, message.as_bytes()))
}

/// Verify a leaf message signature under the tree-leaf namespace.
pub fn verify_leaf_message(key: &PublicKey, message: &Hash, signature: &Signature) -> bool {
    key.verify_raw(
        &attach_namespace(TREE_LEAF_NAMESPACE, message.as_bytes()),
        signature,
    )
}
