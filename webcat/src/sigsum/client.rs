// SPDX-License-Identifier: MIT

//! HTTP client for Sigsum log endpoints, plus the submit-and-prove
//! orchestration used by the processor and the list builder.

use std::collections::HashMap;
use std::time::Duration;

use tracing::instrument;

use crate::sigsum::{
    ascii,
    policy::{LogEntity, Policy},
    proof::{InclusionProof, SigsumProof},
    tree::{Leaf, SignedTreeHead},
    types::{Hash, PublicKey, Signature},
    SigsumError,
};

const USER_AGENT: &str = concat!("webcat/", env!("CARGO_PKG_VERSION"));

/// How long to wait between `add-leaf` attempts while the log sequences
/// the submission.
const SEQUENCE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A leaf submission request: the 32-byte message, the namespaced
/// signature over it, and the submitter's public key.
#[derive(Debug, Clone, Copy)]
pub struct LeafRequest {
    pub message: Hash,
    pub signature: Signature,
    pub public_key: PublicKey,
}

impl LeafRequest {
    fn to_ascii(self) -> String {
        let mut out = String::new();
        ascii::write_line(&mut out, "message", self.message.to_hex());
        ascii::write_line(&mut out, "signature", self.signature.to_hex());
        ascii::write_line(&mut out, "public_key", self.public_key.to_hex());
        out
    }

    /// The leaf this request becomes once sequenced.
    pub fn leaf(&self) -> Leaf {
        Leaf {
            checksum: Hash::of(self.message.as_bytes()),
            signature: self.signature,
            key_hash: self.public_key.key_hash(),
        }
    }
}

/// A client for one Sigsum log.
#[derive(Debug, Clone)]
pub struct LogClient {
    url: String,
    http: reqwest::Client,
}

impl LogClient {
    pub fn new(url: &str) -> Result<Self, SigsumError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(LogClient {
            url: url.trim_end_matches('/').to_string(),
            http,
        })
    }

    #[instrument(skip(self), fields(log = self.url))]
    pub async fn get_tree_head(&self) -> Result<SignedTreeHead, SigsumError> {
        let body = self.get(&format!("{}/get-tree-head", self.url)).await?;
        SignedTreeHead::from_ascii(&ascii::parse(&body)?)
    }

    /// Fetch the leaves in `[start, end)`. The log may return fewer than
    /// requested; it returns at least one or errors.
    #[instrument(skip(self), fields(log = self.url))]
    pub async fn get_leaves(&self, start: u64, end: u64) -> Result<Vec<Leaf>, SigsumError> {
        let body = self
            .get(&format!("{}/get-leaves/{start}/{end}", self.url))
            .await?;
        ascii::parse(&body)?
            .iter()
            .map(|(key, value)| {
                if key != "leaf" {
                    return Err(SigsumError::Ascii(format!(
                        "unexpected key in get-leaves response: {key:?}"
                    )));
                }
                Leaf::from_ascii_value(value)
            })
            .collect()
    }

    /// Submit a leaf. Returns `true` once the log has sequenced it, and
    /// `false` while the submission is still pending.
    #[instrument(skip(self, request), fields(log = self.url))]
    pub async fn add_leaf(&self, request: &LeafRequest) -> Result<bool, SigsumError> {
        let response = self
            .http
            .post(format!("{}/add-leaf", self.url))
            .body(request.to_ascii())
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(true),
            202 => Ok(false),
            status => Err(SigsumError::Status(status)),
        }
    }

    #[instrument(skip(self), fields(log = self.url))]
    pub async fn get_inclusion_proof(
        &self,
        tree_size: u64,
        leaf_hash: &Hash,
    ) -> Result<InclusionProof, SigsumError> {
        let body = self
            .get(&format!(
                "{}/get-inclusion-proof/{tree_size}/{}",
                self.url,
                leaf_hash.to_hex()
            ))
            .await?;
        let pairs = ascii::parse(&body)?;
        let leaf_index =
            ascii::parse_u64(ascii::require_one(&pairs, "leaf_index")?, "leaf_index")?;
        let node_hashes = ascii::collect(&pairs, "node_hash")
            .into_iter()
            .map(Hash::from_hex)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InclusionProof {
            leaf_index,
            node_hashes,
        })
    }

    async fn get(&self, url: &str) -> Result<String, SigsumError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SigsumError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }
}

/// Configuration for [`submit_leaf`].
pub struct SubmitConfig {
    pub policy: Policy,
    /// Budget per log before trying the next one.
    pub per_log_timeout: Duration,
}

/// Submit a leaf to the logs named in the policy, one at a time, until one
/// sequences it within the per-log timeout. Returns a proof that has been
/// verified under the policy.
#[instrument(skip_all, fields(message = %request.message))]
pub async fn submit_leaf(
    config: &SubmitConfig,
    request: &LeafRequest,
) -> Result<SigsumProof, SigsumError> {
    let logs: Vec<(&str, &LogEntity)> = config
        .policy
        .logs()
        .iter()
        .filter_map(|log| log.url.as_deref().map(|url| (url, log)))
        .collect();
    if logs.is_empty() {
        return Err(SigsumError::Policy(
            "policy has no log with a submission URL".into(),
        ));
    }

    for (url, log) in logs {
        match tokio::time::timeout(
            config.per_log_timeout,
            submit_to_log(url, log, &config.policy, request),
        )
        .await
        {
            Ok(Ok(proof)) => return Ok(proof),
            Ok(Err(error)) => {
                tracing::warn!(%error, log = url, "Log rejected the leaf submission");
            }
            Err(_) => {
                tracing::warn!(log = url, "Timed out submitting leaf to log");
            }
        }
    }
    Err(SigsumError::AllLogsFailed)
}

async fn submit_to_log(
    url: &str,
    log: &LogEntity,
    policy: &Policy,
    request: &LeafRequest,
) -> Result<SigsumProof, SigsumError> {
    let client = LogClient::new(url)?;

    while !client.add_leaf(request).await? {
        tracing::debug!(log = url, "Leaf not yet sequenced; retrying");
        tokio::time::sleep(SEQUENCE_POLL_INTERVAL).await;
    }

    let tree_head = client.get_tree_head().await?;
    tree_head.verify(&log.public_key)?;

    let leaf_hash = request.leaf().leaf_hash();
    let inclusion = if tree_head.size == 1 {
        // A one-leaf tree has a trivial proof the log won't serve.
        InclusionProof {
            leaf_index: 0,
            node_hashes: vec![],
        }
    } else {
        client
            .get_inclusion_proof(tree_head.size, &leaf_hash)
            .await?
    };

    let proof = SigsumProof {
        log_key_hash: log.public_key.key_hash(),
        leaf_key_hash: request.public_key.key_hash(),
        leaf_signature: request.signature,
        tree_head,
        inclusion,
    };
    let submit_keys: HashMap<Hash, PublicKey> =
        HashMap::from([(request.public_key.key_hash(), request.public_key)]);
    proof.verify(&request.message, &submit_keys, policy)?;
    Ok(proof)
}
