// SPDX-License-Identifier: MIT

//! The list builder.
//!
//! A batch job that replays the transparency log into the published binary
//! list: it verifies the tree head, pages through the leaves, re-fetches
//! and re-verifies every payload from the data server, replays the action
//! stream into an in-memory table, emits the canonical blob, signs it, and
//! records that signature in the log too.
//!
//! Every verification failure is a hard abort: continuing would produce a
//! signed list that admits tampered entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::payload::{domain_policy_json, Action, CanonicalPayload};
use crate::sigsum::{
    client::{submit_leaf, LeafRequest, LogClient, SubmitConfig},
    tree::Leaf,
    types::sign_leaf_message,
    Hash, KeyPair, Policy, PublicKey, SigsumProof,
};

/// Budget for enumerating and verifying log leaves.
const ENUMERATION_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Per-log budget when submitting the list signature.
const PER_LOG_TIMEOUT: Duration = Duration::from_secs(300);

pub struct BuildConfig {
    pub log_url: String,
    pub log_key: PublicKey,
    /// Only leaves submitted under this key are replayed.
    pub submit_key: PublicKey,
    pub data_server: String,
    pub start_index: u64,
    pub batch_size: u64,
    pub output_dir: PathBuf,
    pub signing_key: KeyPair,
    pub policy: Policy,
}

/// What a successful build produced.
#[derive(Debug)]
pub struct BuildOutcome {
    /// SHA-256 of the list blob; also the logged message.
    pub message: Hash,
    pub record_count: usize,
    pub list_path: PathBuf,
    pub proof_path: PathBuf,
}

/// One replayed domain: the normalized signers JSON and the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRecord {
    pub signers: String,
    pub threshold: i64,
}

/// The in-memory present state, keyed by domain.
pub type ListTable = BTreeMap<String, ListRecord>;

/// The JSON response of the data server's transparency endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyEntry {
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub hash: String,
    pub payload: String,
    pub proof: String,
    pub signature: String,
}

/// Cross-check a log leaf against the data server's record of it and
/// return the replayable payload.
///
/// The checks bind the leaf to the stored payload in both directions:
/// the re-serialized payload must hash to the stored hash, the stored
/// hash must produce the leaf checksum, the stored signature must be the
/// leaf signature, and that signature must verify as a leaf message over
/// the payload hash under the submit key.
pub fn verify_entry(
    leaf: &Leaf,
    entry: &TransparencyEntry,
    submit_key: &PublicKey,
) -> anyhow::Result<CanonicalPayload> {
    let payload = CanonicalPayload::from_json(&entry.payload)
        .context("stored payload is not a canonical payload")?;
    let canonical_bytes = payload
        .to_canonical_bytes()
        .context("payload re-serialization failed")?;

    let computed_hash = Hash::of(&canonical_bytes);
    if computed_hash.to_hex() != entry.hash {
        bail!(
            "hash mismatch: computed {} but the record says {}",
            computed_hash.to_hex(),
            entry.hash
        );
    }
    if leaf.signature.to_hex() != entry.signature {
        bail!(
            "signature mismatch: leaf carries {} but the record says {}",
            leaf.signature.to_hex(),
            entry.signature
        );
    }
    let computed_checksum = Hash::of(computed_hash.as_bytes());
    if computed_checksum != leaf.checksum {
        bail!(
            "checksum mismatch: computed {} but the leaf carries {}",
            computed_checksum,
            leaf.checksum
        );
    }
    if !crate::sigsum::types::verify_leaf_message(submit_key, &computed_hash, &leaf.signature) {
        bail!("leaf signature does not verify over the payload hash under the submit key");
    }

    Ok(payload)
}

/// Replay one verified payload into the table.
pub fn apply_action(table: &mut ListTable, payload: &CanonicalPayload) -> anyhow::Result<()> {
    match payload.action {
        Action::Add => {
            if table.contains_key(&payload.domain) {
                bail!("domain {} already exists, cannot add", payload.domain);
            }
            table.insert(
                payload.domain.clone(),
                ListRecord {
                    signers: payload.signers.clone(),
                    threshold: payload.threshold,
                },
            );
        }
        Action::Delete => {
            if table.remove(&payload.domain).is_none() {
                bail!("domain {} does not exist, cannot delete", payload.domain);
            }
        }
        Action::Modify => {
            bail!("modify action not implemented for domain {}", payload.domain);
        }
    }
    Ok(())
}

/// Encode the table as the published binary list: for each record,
/// `sha256(domain) || sha256(policy_json)`, 64 bytes per record with no
/// framing, ordered by ascending domain hash so repeated builds are
/// byte-identical.
pub fn encode_list(table: &ListTable) -> anyhow::Result<Vec<u8>> {
    let mut records: Vec<(Hash, Hash)> = table
        .iter()
        .map(|(domain, record)| {
            let policy = domain_policy_json(&record.signers, record.threshold)
                .with_context(|| format!("failed to build policy JSON for {domain}"))?;
            Ok((Hash::of(domain.as_bytes()), Hash::of(&policy)))
        })
        .collect::<anyhow::Result<_>>()?;
    records.sort_by(|a, b| a.0.cmp(&b.0));

    let mut output = Vec::with_capacity(records.len() * 64);
    for (domain_hash, policy_hash) in records {
        output.extend_from_slice(domain_hash.as_bytes());
        output.extend_from_slice(policy_hash.as_bytes());
    }
    Ok(output)
}

/// Run a full build.
#[instrument(skip(config), fields(log = config.log_url))]
pub async fn run(config: &BuildConfig) -> anyhow::Result<BuildOutcome> {
    let table = tokio::time::timeout(ENUMERATION_DEADLINE, replay_log(config))
        .await
        .context("timed out enumerating log leaves")??;

    let output = encode_list(&table)?;
    let message = Hash::of(&output);
    tracing::info!(
        records = table.len(),
        bytes = output.len(),
        message = %message,
        "List assembled"
    );

    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("failed to create output directory {}", config.output_dir.display())
    })?;
    let list_path = config.output_dir.join(format!("{}.bin", message.to_hex()));
    std::fs::write(&list_path, &output)
        .with_context(|| format!("failed to write {}", list_path.display()))?;

    let signature = sign_leaf_message(&config.signing_key, &message);
    let request = LeafRequest {
        message,
        signature,
        public_key: config.signing_key.public(),
    };
    let submit_config = SubmitConfig {
        policy: config.policy.clone(),
        per_log_timeout: PER_LOG_TIMEOUT,
    };
    let proof = submit_leaf(&submit_config, &request)
        .await
        .context("failed to log the list signature")?;

    let bundle = ProofBundle::new(&message, &proof);
    let proof_path = config.output_dir.join(format!("{}.json", message.to_hex()));
    std::fs::write(&proof_path, serde_json::to_vec_pretty(&bundle)?)
        .with_context(|| format!("failed to write {}", proof_path.display()))?;
    replace_symlink(
        &format!("{}.json", message.to_hex()),
        &config.output_dir.join("update.json"),
    )?;

    Ok(BuildOutcome {
        message,
        record_count: table.len(),
        list_path,
        proof_path,
    })
}

/// Walk the log from the start index and replay every leaf submitted
/// under the submit key into a fresh table.
async fn replay_log(config: &BuildConfig) -> anyhow::Result<ListTable> {
    let client = LogClient::new(&config.log_url)?;
    let tree_head = client.get_tree_head().await?;
    tree_head
        .verify(&config.log_key)
        .context("tree head signature verification failed")?;
    tracing::info!(size = tree_head.size, "Tree head verified");

    let target_key_hash = config.submit_key.key_hash();
    let http = reqwest::Client::builder()
        .user_agent(concat!("webcat/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()?;

    let mut table = ListTable::new();
    let mut start = config.start_index;
    while start < tree_head.size {
        let end = (start + config.batch_size).min(tree_head.size);
        tracing::info!(start, end, "Downloading leaves");
        let leaves = client.get_leaves(start, end).await?;
        anyhow::ensure!(
            !leaves.is_empty() && leaves.len() as u64 <= end - start,
            "log returned {} leaves for range [{start}, {end})",
            leaves.len()
        );

        for leaf in &leaves {
            if leaf.key_hash != target_key_hash {
                continue;
            }
            let entry = fetch_entry(&http, &config.data_server, &leaf.checksum).await?;
            let payload = verify_entry(leaf, &entry, &config.submit_key).with_context(|| {
                format!("verification failed for leaf {}", leaf.checksum)
            })?;
            tracing::debug!(
                leaf = %leaf.checksum,
                domain = payload.domain,
                action = %payload.action,
                created_at = entry.created_at,
                "Leaf verified"
            );
            apply_action(&mut table, &payload)?;
        }
        start += leaves.len() as u64;
    }
    Ok(table)
}

async fn fetch_entry(
    http: &reqwest::Client,
    data_server: &str,
    checksum: &Hash,
) -> anyhow::Result<TransparencyEntry> {
    let url = format!(
        "{}/transparency/{}",
        data_server.trim_end_matches('/'),
        checksum.to_hex()
    );
    let response = http.get(&url).send().await?;
    anyhow::ensure!(
        response.status().is_success(),
        "data server returned status {} for leaf {}",
        response.status().as_u16(),
        checksum
    );
    Ok(response.json().await?)
}

/// The exported proof bundle: everything a list consumer needs to verify
/// that the published list hash was logged.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProofBundle {
    pub version: u64,
    pub log_key_hash: String,
    pub message_hash: String,
    pub leaf: BundleLeaf,
    pub tree_head: BundleTreeHead,
    pub inclusion_proof: BundleInclusionProof,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleLeaf {
    pub key_hash: String,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleTreeHead {
    pub size: u64,
    pub root_hash: String,
    pub signature: String,
    pub cosignatures: Vec<BundleCosignature>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleCosignature {
    pub keyhash: String,
    pub timestamp: u64,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BundleInclusionProof {
    pub leaf_index: u64,
    pub node_hashes: Vec<String>,
}

impl ProofBundle {
    pub fn new(message: &Hash, proof: &SigsumProof) -> Self {
        ProofBundle {
            version: crate::sigsum::proof::PROOF_VERSION,
            log_key_hash: proof.log_key_hash.to_hex(),
            message_hash: message.to_hex(),
            leaf: BundleLeaf {
                key_hash: proof.leaf_key_hash.to_hex(),
                signature: proof.leaf_signature.to_hex(),
            },
            tree_head: BundleTreeHead {
                size: proof.tree_head.size,
                root_hash: proof.tree_head.root_hash.to_hex(),
                signature: proof.tree_head.signature.to_hex(),
                cosignatures: proof
                    .tree_head
                    .cosignatures
                    .iter()
                    .map(|cosignature| BundleCosignature {
                        keyhash: cosignature.key_hash.to_hex(),
                        timestamp: cosignature.timestamp,
                        signature: cosignature.signature.to_hex(),
                    })
                    .collect(),
            },
            inclusion_proof: BundleInclusionProof {
                leaf_index: proof.inclusion.leaf_index,
                node_hashes: proof
                    .inclusion
                    .node_hashes
                    .iter()
                    .map(Hash::to_hex)
                    .collect(),
            },
        }
    }
}

/// Point `link` at `target`, replacing any previous link.
fn replace_symlink(target: &str, link: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(link) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(error).with_context(|| format!("failed to remove {}", link.display()))
        }
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("failed to create symlink {}", link.display()))
}
