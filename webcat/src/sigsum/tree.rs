// SPDX-License-Identifier: MIT

//! Tree heads, leaves, and Merkle proof verification.
//!
//! Hashing follows RFC 6962: leaf hashes are `SHA256(0x00 || data)` and
//! interior nodes are `SHA256(0x01 || left || right)`. Inclusion proof
//! verification follows RFC 9162 §2.1.3.2.

use base64::prelude::*;
use sha2::{Digest, Sha256};

use crate::sigsum::{
    ascii,
    types::{Hash, PublicKey, Signature},
    SigsumError,
};

/// Namespace for witness cosignatures over a checkpoint body.
const COSIGNATURE_NAMESPACE: &str = "cosignature/v1";

/// The size and root hash of a log at some point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHead {
    pub size: u64,
    pub root_hash: Hash,
}

impl TreeHead {
    /// The checkpoint body that log signatures and cosignatures cover.
    ///
    /// The origin line binds the checkpoint to a specific log key, so a
    /// signature from one log cannot be replayed against another.
    pub fn checkpoint(&self, log_key_hash: &Hash) -> String {
        format!(
            "sigsum.org/v1/tree/{}\n{}\n{}\n",
            log_key_hash.to_hex(),
            self.size,
            BASE64_STANDARD.encode(self.root_hash.as_bytes()),
        )
    }
}

/// A witness cosignature over a tree head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cosignature {
    pub key_hash: Hash,
    pub timestamp: u64,
    pub signature: Signature,
}

impl Cosignature {
    pub(crate) fn from_ascii_value(value: &str) -> Result<Self, SigsumError> {
        let mut fields = value.split_ascii_whitespace();
        let (Some(key_hash), Some(timestamp), Some(signature), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(SigsumError::Ascii(format!(
                "cosignature must have three fields: {value:?}"
            )));
        };
        Ok(Cosignature {
            key_hash: Hash::from_hex(key_hash)?,
            timestamp: ascii::parse_u64(timestamp, "cosignature timestamp")?,
            signature: Signature::from_hex(signature)?,
        })
    }

    pub(crate) fn to_ascii_value(&self) -> String {
        format!(
            "{} {} {}",
            self.key_hash.to_hex(),
            self.timestamp,
            self.signature.to_hex()
        )
    }

    /// Check this cosignature against a witness key and the checkpoint of
    /// the cosigned tree head.
    pub fn verify(&self, witness_key: &PublicKey, checkpoint: &str) -> bool {
        let message = format!(
            "{}\ntime {}\n{}",
            COSIGNATURE_NAMESPACE, self.timestamp, checkpoint
        );
        witness_key.verify_raw(message.as_bytes(), &self.signature)
    }
}

/// A tree head together with the log signature and any witness
/// cosignatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTreeHead {
    pub size: u64,
    pub root_hash: Hash,
    pub signature: Signature,
    pub cosignatures: Vec<Cosignature>,
}

impl SignedTreeHead {
    pub fn tree_head(&self) -> TreeHead {
        TreeHead {
            size: self.size,
            root_hash: self.root_hash,
        }
    }

    /// Verify the log's signature over the checkpoint body.
    pub fn verify(&self, log_key: &PublicKey) -> Result<(), SigsumError> {
        let checkpoint = self.tree_head().checkpoint(&log_key.key_hash());
        if log_key.verify_raw(checkpoint.as_bytes(), &self.signature) {
            Ok(())
        } else {
            Err(SigsumError::InvalidTreeHead)
        }
    }

    pub(crate) fn from_ascii(pairs: &[(String, String)]) -> Result<Self, SigsumError> {
        let size = ascii::parse_u64(ascii::require_one(pairs, "size")?, "size")?;
        let root_hash = Hash::from_hex(ascii::require_one(pairs, "root_hash")?)?;
        let signature = Signature::from_hex(ascii::require_one(pairs, "signature")?)?;
        let cosignatures = ascii::collect(pairs, "cosignature")
            .into_iter()
            .map(Cosignature::from_ascii_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SignedTreeHead {
            size,
            root_hash,
            signature,
            cosignatures,
        })
    }

    pub(crate) fn to_ascii(&self, out: &mut String) {
        ascii::write_line(out, "size", self.size);
        ascii::write_line(out, "root_hash", self.root_hash.to_hex());
        ascii::write_line(out, "signature", self.signature.to_hex());
        for cosignature in &self.cosignatures {
            ascii::write_line(out, "cosignature", cosignature.to_ascii_value());
        }
    }
}

/// A log leaf: the double-hashed payload checksum, the submitter's leaf
/// signature, and the hash of the submitter's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub checksum: Hash,
    pub signature: Signature,
    pub key_hash: Hash,
}

impl Leaf {
    /// The 128-byte serialization that leaf hashes are computed over.
    pub fn to_bytes(&self) -> [u8; 128] {
        let mut bytes = [0_u8; 128];
        bytes[..32].copy_from_slice(self.checksum.as_bytes());
        bytes[32..96].copy_from_slice(&self.signature.0);
        bytes[96..].copy_from_slice(self.key_hash.as_bytes());
        bytes
    }

    /// The Merkle leaf hash of this leaf.
    pub fn leaf_hash(&self) -> Hash {
        leaf_hash(&self.to_bytes())
    }

    pub(crate) fn from_ascii_value(value: &str) -> Result<Self, SigsumError> {
        let mut fields = value.split_ascii_whitespace();
        let (Some(checksum), Some(signature), Some(key_hash), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(SigsumError::Ascii(format!(
                "leaf must have three fields: {value:?}"
            )));
        };
        Ok(Leaf {
            checksum: Hash::from_hex(checksum)?,
            signature: Signature::from_hex(signature)?,
            key_hash: Hash::from_hex(key_hash)?,
        })
    }
}

/// `SHA256(0x00 || data)`, the RFC 6962 leaf hash.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// `SHA256(0x01 || left || right)`, the RFC 6962 interior node hash.
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash(hasher.finalize().into())
}

/// Verify an inclusion proof that the tree of size `tree_size` with root
/// `root_hash` contains `leaf_hash` at `leaf_index`, per RFC 9162
/// §2.1.3.2.
pub fn verify_inclusion(
    proof: &[Hash],
    tree_size: u64,
    root_hash: &Hash,
    leaf_index: u64,
    leaf_hash: &Hash,
) -> Result<(), SigsumError> {
    if leaf_index >= tree_size {
        return Err(SigsumError::InvalidProof);
    }
    let mut f_n = leaf_index;
    let mut s_n = tree_size - 1;
    let mut r = *leaf_hash;
    for p in proof {
        if s_n == 0 {
            return Err(SigsumError::InvalidProof);
        }
        if f_n & 1 == 1 || f_n == s_n {
            r = node_hash(p, &r);
            while f_n & 1 == 0 && f_n != 0 {
                f_n >>= 1;
                s_n >>= 1;
            }
        } else {
            r = node_hash(&r, p);
        }
        f_n >>= 1;
        s_n >>= 1;
    }
    if s_n == 0 && r == *root_hash {
        Ok(())
    } else {
        Err(SigsumError::InvalidProof)
    }
}

/// Compute the RFC 6962 root hash over a slice of leaf hashes. Handy for
/// reconstructing small trees; the empty tree is the hash of the empty
/// string.
pub fn tree_root(leaf_hashes: &[Hash]) -> Hash {
    match leaf_hashes {
        [] => Hash::of(b""),
        [leaf] => *leaf,
        leaves => {
            let k = split_point(leaves.len() as u64) as usize;
            node_hash(&tree_root(&leaves[..k]), &tree_root(&leaves[k..]))
        }
    }
}

/// Compute the inclusion path for `leaf_index` over a slice of leaf hashes.
pub fn inclusion_path(leaf_hashes: &[Hash], leaf_index: u64) -> Vec<Hash> {
    if leaf_hashes.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(leaf_hashes.len() as u64);
    let mut path;
    if leaf_index < k {
        path = inclusion_path(&leaf_hashes[..k as usize], leaf_index);
        path.push(tree_root(&leaf_hashes[k as usize..]));
    } else {
        path = inclusion_path(&leaf_hashes[k as usize..], leaf_index - k);
        path.push(tree_root(&leaf_hashes[..k as usize]));
    }
    path
}

/// The largest power of two strictly smaller than `n`. Requires `n > 1`.
fn split_point(n: u64) -> u64 {
    1 << (n - 1).ilog2()
}
