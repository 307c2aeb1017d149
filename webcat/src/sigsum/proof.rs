// SPDX-License-Identifier: MIT

//! Proofs of logging: the leaf signature, the cosigned tree head, and the
//! inclusion path, bundled for storage and re-verification.

use std::collections::{HashMap, HashSet};

use crate::sigsum::{
    ascii,
    policy::Policy,
    tree::{self, Leaf, SignedTreeHead},
    types::{verify_leaf_message, Hash, PublicKey, Signature},
    SigsumError,
};

pub const PROOF_VERSION: u64 = 2;

/// The position of a leaf plus the sibling hashes up to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    pub leaf_index: u64,
    pub node_hashes: Vec<Hash>,
}

/// Everything needed to show that a message was logged: which log, the
/// submitter's leaf signature, the cosigned tree head, and the inclusion
/// path connecting the leaf to it.
///
/// The leaf checksum is deliberately absent; it is recomputed from the
/// message being verified, which is what binds the proof to the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigsumProof {
    pub log_key_hash: Hash,
    pub leaf_key_hash: Hash,
    pub leaf_signature: Signature,
    pub tree_head: SignedTreeHead,
    pub inclusion: InclusionProof,
}

impl SigsumProof {
    /// Serialize to the `key=value` form stored in transparency records.
    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        ascii::write_line(&mut out, "version", PROOF_VERSION);
        ascii::write_line(&mut out, "log", self.log_key_hash.to_hex());
        ascii::write_line(
            &mut out,
            "leaf",
            format!(
                "{} {}",
                self.leaf_key_hash.to_hex(),
                self.leaf_signature.to_hex()
            ),
        );
        self.tree_head.to_ascii(&mut out);
        ascii::write_line(&mut out, "leaf_index", self.inclusion.leaf_index);
        for node in &self.inclusion.node_hashes {
            ascii::write_line(&mut out, "node_hash", node.to_hex());
        }
        out
    }

    pub fn from_ascii(text: &str) -> Result<Self, SigsumError> {
        let pairs = ascii::parse(text)?;
        let version = ascii::parse_u64(ascii::require_one(&pairs, "version")?, "version")?;
        if version != PROOF_VERSION {
            return Err(SigsumError::Ascii(format!(
                "unsupported proof version {version}"
            )));
        }
        let log_key_hash = Hash::from_hex(ascii::require_one(&pairs, "log")?)?;
        let leaf_value = ascii::require_one(&pairs, "leaf")?;
        let mut leaf_fields = leaf_value.split_ascii_whitespace();
        let (Some(key_hash), Some(signature), None) =
            (leaf_fields.next(), leaf_fields.next(), leaf_fields.next())
        else {
            return Err(SigsumError::Ascii(format!(
                "leaf must have two fields: {leaf_value:?}"
            )));
        };
        let tree_head = SignedTreeHead::from_ascii(&pairs)?;
        let leaf_index = ascii::parse_u64(ascii::require_one(&pairs, "leaf_index")?, "leaf_index")?;
        let node_hashes = ascii::collect(&pairs, "node_hash")
            .into_iter()
            .map(Hash::from_hex)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SigsumProof {
            log_key_hash,
            leaf_key_hash: Hash::from_hex(key_hash)?,
            leaf_signature: Signature::from_hex(signature)?,
            tree_head,
            inclusion: InclusionProof {
                leaf_index,
                node_hashes,
            },
        })
    }

    /// Verify this proof for `message` against known submitter keys and a
    /// trust policy.
    ///
    /// Checks, in order: the leaf signature under the submitter key matching
    /// `leaf_key_hash`, the tree head signature under the policy's log key
    /// matching `log_key_hash`, the witness cosignature quorum, and the
    /// inclusion path from the reconstructed leaf to the root hash.
    pub fn verify(
        &self,
        message: &Hash,
        submit_keys: &HashMap<Hash, PublicKey>,
        policy: &Policy,
    ) -> Result<(), SigsumError> {
        let submit_key = submit_keys
            .get(&self.leaf_key_hash)
            .ok_or(SigsumError::UnknownKeyHash(self.leaf_key_hash))?;
        if !verify_leaf_message(submit_key, message, &self.leaf_signature) {
            return Err(SigsumError::InvalidLeafSignature);
        }

        let log_key = policy
            .log_key(&self.log_key_hash)
            .ok_or(SigsumError::UnknownKeyHash(self.log_key_hash))?;
        self.tree_head.verify(log_key)?;

        let checkpoint = self.tree_head.tree_head().checkpoint(&self.log_key_hash);
        let mut cosigned = HashSet::new();
        for cosignature in &self.tree_head.cosignatures {
            let Some(witness_key) = policy.witness_key(&cosignature.key_hash) else {
                continue;
            };
            if cosignature.verify(witness_key, &checkpoint) {
                cosigned.insert(cosignature.key_hash);
            }
        }
        if !policy.quorum_satisfied(&cosigned) {
            return Err(SigsumError::QuorumNotSatisfied);
        }

        let leaf = Leaf {
            checksum: Hash::of(message.as_bytes()),
            signature: self.leaf_signature,
            key_hash: self.leaf_key_hash,
        };
        tree::verify_inclusion(
            &self.inclusion.node_hashes,
            self.tree_head.size,
            &self.tree_head.root_hash,
            self.inclusion.leaf_index,
            &leaf.leaf_hash(),
        )
    }
}
