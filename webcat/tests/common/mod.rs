// SPDX-License-Identifier: MIT

//! Shared fixtures: a temp-file database, a scriptable prober, and an
//! in-process single-tenant log.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use sqlx::SqlitePool;
use webcat::{
    config::ConfirmationMode,
    db::{self, Submission},
    error::ValidationError,
    fsm::{Driver, LeafPublisher},
    sigsum::{
        client::LeafRequest,
        proof::InclusionProof,
        tree::{inclusion_path, tree_root, Leaf, SignedTreeHead, TreeHead},
        Hash, KeyPair, Policy, SigsumError, SigsumProof,
    },
    validator::Prober,
};

/// A [`Prober`] whose answers are set by the test.
pub struct StubProber {
    pub headers: Mutex<HeaderMap>,
    pub dns_ok: AtomicBool,
    pub https_ok: AtomicBool,
}

impl StubProber {
    pub fn new(headers: HeaderMap) -> Self {
        StubProber {
            headers: Mutex::new(headers),
            dns_ok: AtomicBool::new(true),
            https_ok: AtomicBool::new(true),
        }
    }

    pub fn set_headers(&self, headers: HeaderMap) {
        *self.headers.lock().unwrap() = headers;
    }
}

#[async_trait]
impl Prober for StubProber {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ValidationError> {
        if self.dns_ok.load(Ordering::SeqCst) {
            Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
        } else {
            Err(ValidationError::DnsFailure(format!(
                "no addresses found for {hostname}"
            )))
        }
    }

    async fn fetch_headers(&self, _hostname: &str) -> Result<HeaderMap, ValidationError> {
        if self.https_ok.load(Ordering::SeqCst) {
            Ok(self.headers.lock().unwrap().clone())
        } else {
            Err(ValidationError::HttpsFailure(
                "HTTPS check returned status 503".to_string(),
            ))
        }
    }
}

/// An in-process log: leaves accumulate in memory and every publish
/// returns a fully verified proof over the current tree.
pub struct StubLog {
    log_key: KeyPair,
    policy: Policy,
    leaves: Mutex<Vec<Leaf>>,
    pub fail: AtomicBool,
}

impl StubLog {
    pub fn new() -> Self {
        let log_key = KeyPair::generate();
        let policy = Policy::parse(&format!(
            "log {}\nquorum none\n",
            log_key.public().to_hex()
        ))
        .unwrap();
        StubLog {
            log_key,
            policy,
            leaves: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn leaves(&self) -> Vec<Leaf> {
        self.leaves.lock().unwrap().clone()
    }

    pub fn policy(&self) -> Policy {
        self.policy.clone()
    }
}

#[async_trait]
impl LeafPublisher for StubLog {
    async fn publish(&self, request: &LeafRequest) -> Result<SigsumProof, SigsumError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SigsumError::AllLogsFailed);
        }
        let leaf = request.leaf();
        let mut leaves = self.leaves.lock().unwrap();
        // Content-addressed: re-submitting an existing leaf is a no-op.
        let index = match leaves.iter().position(|known| *known == leaf) {
            Some(index) => index,
            None => {
                leaves.push(leaf);
                leaves.len() - 1
            }
        };
        let hashes: Vec<Hash> = leaves.iter().map(Leaf::leaf_hash).collect();
        let size = hashes.len() as u64;
        let root_hash = tree_root(&hashes);
        let checkpoint = TreeHead { size, root_hash }.checkpoint(&self.log_key.public().key_hash());
        let proof = SigsumProof {
            log_key_hash: self.log_key.public().key_hash(),
            leaf_key_hash: request.public_key.key_hash(),
            leaf_signature: request.signature,
            tree_head: SignedTreeHead {
                size,
                root_hash,
                signature: self.log_key.sign_raw(checkpoint.as_bytes()),
                cosignatures: vec![],
            },
            inclusion: InclusionProof {
                leaf_index: index as u64,
                node_hashes: inclusion_path(&hashes, index as u64),
            },
        };
        drop(leaves);

        let submit_keys = HashMap::from([(request.public_key.key_hash(), request.public_key)]);
        proof.verify(&request.message, &submit_keys, &self.policy)?;
        Ok(proof)
    }
}

/// A processor-in-a-box: database, driver, and both stubs.
pub struct Instance {
    _dir: tempfile::TempDir,
    pub db: SqlitePool,
    pub driver: Driver,
    pub prober: Arc<StubProber>,
    pub log: Arc<StubLog>,
    pub keypair: KeyPair,
}

pub async fn instance(mode: ConfirmationMode, headers: HeaderMap) -> Instance {
    let dir = tempfile::TempDir::new().unwrap();
    let db = db::pool(dir.path().join("webcat.sqlite").to_str().unwrap())
        .await
        .unwrap();
    db::migrate(&db).await.unwrap();

    let keypair = KeyPair::generate();
    let prober = Arc::new(StubProber::new(headers));
    let log = Arc::new(StubLog::new());
    let driver = Driver::new(
        db.clone(),
        prober.clone(),
        log.clone(),
        keypair.clone(),
        mode,
    );
    Instance {
        _dir: dir,
        db,
        driver,
        prober,
        log,
        keypair,
    }
}

/// Response headers advertising the given signers, threshold, and action.
pub fn sigstore_headers(signers: &str, threshold: &str, action: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-sigstore-signers", HeaderValue::from_str(signers).unwrap());
    headers.insert(
        "x-sigstore-threshold",
        HeaderValue::from_str(threshold).unwrap(),
    );
    headers.insert("x-webcat-action", HeaderValue::from_str(action).unwrap());
    headers
}

pub const GITHUB_SIGNER: &str =
    r#"[{"identity":"A@X.Y","issuer":"https://github.com/login/oauth"}]"#;

/// Create a fresh submission row the way the API does.
pub async fn ingest(db: &SqlitePool, domain: &str) -> String {
    let mut conn = db.acquire().await.unwrap();
    let submission = Submission::new(domain);
    submission.insert(&mut conn).await.unwrap();
    submission.id
}

pub async fn get_submission(db: &SqlitePool, id: &str) -> Submission {
    let mut conn = db.acquire().await.unwrap();
    Submission::get(&mut conn, id).await.unwrap()
}

/// Move a pending confirmation deadline into the past.
pub async fn expire_wait(db: &SqlitePool, id: &str) {
    let mut conn = db.acquire().await.unwrap();
    let mut submission = Submission::get(&mut conn, id).await.unwrap();
    assert!(submission.wait_until.is_some());
    submission.wait_until = Some(Utc::now() - Duration::seconds(1));
    submission.save(&mut conn).await.unwrap();
}
