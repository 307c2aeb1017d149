// SPDX-License-Identifier: MIT

//! A minimal Sigsum v1 client.
//!
//! This covers the slice of the protocol webcat needs: submitting signed
//! leaves, enumerating leaves, verifying tree heads and inclusion proofs
//! under a trust policy, and (de)serializing the proof material that gets
//! stored alongside transparency records. It is not a log implementation.

use thiserror::Error;

mod ascii;
pub mod client;
pub mod policy;
pub mod proof;
pub mod tree;
pub mod types;

pub use client::{submit_leaf, LeafRequest, LogClient, SubmitConfig};
pub use policy::Policy;
pub use proof::{InclusionProof, SigsumProof};
pub use tree::{Cosignature, Leaf, SignedTreeHead, TreeHead};
pub use types::{Hash, KeyPair, PublicKey, Signature};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SigsumError {
    #[error("malformed hash")]
    MalformedHash,

    #[error("malformed public key")]
    MalformedKey,

    #[error("malformed signature")]
    MalformedSignature,

    /// A `key=value` response or stored blob did not parse.
    #[error("malformed ASCII input: {0}")]
    Ascii(String),

    #[error("malformed policy: {0}")]
    Policy(String),

    /// The inclusion path does not connect the leaf to the root hash.
    #[error("invalid inclusion proof")]
    InvalidProof,

    /// The tree head signature does not verify under the log key.
    #[error("invalid tree head signature")]
    InvalidTreeHead,

    #[error("invalid leaf signature")]
    InvalidLeafSignature,

    /// Not enough valid witness cosignatures to satisfy the policy quorum.
    #[error("witness quorum not satisfied")]
    QuorumNotSatisfied,

    #[error("no key known for key hash {0}")]
    UnknownKeyHash(Hash),

    #[error("log returned HTTP status {0}")]
    Status(u16),

    /// Every log named in the policy either failed or timed out.
    #[error("no log in the policy accepted the leaf")]
    AllLogsFailed,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
