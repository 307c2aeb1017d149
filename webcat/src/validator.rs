// SPDX-License-Identifier: MIT

//! Submission validation: hostname canonicalization, the DNS and HTTPS
//! probes, and Sigstore header normalization.

use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::HeaderMap;
use tracing::instrument;

use crate::error::ValidationError;
use crate::payload::{Action, Signer};

/// Issuers a signer is allowed to name.
pub const ALLOWED_ISSUERS: [&str; 4] = [
    "https://accounts.google.com",
    "https://login.microsoftonline.com",
    "https://github.com/login/oauth",
    "https://gitlab.com",
];

pub const MIN_SIGNERS: usize = 1;
pub const MAX_SIGNERS: usize = 16;

/// How long the HTTPS probe waits before giving up.
const HTTPS_TIMEOUT: Duration = Duration::from_secs(10);

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("the pattern is valid"));

/// Canonicalize a submitted hostname to its lower-cased ASCII form.
///
/// Rejects anything that is not a bare domain: embedded schemes, paths,
/// ports, leading or trailing dots, empty labels, and single-label names.
pub fn canonicalize_hostname(raw: &str) -> Result<String, ValidationError> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(ValidationError::InvalidHostname("empty hostname".into()));
    }
    if input.contains("://") {
        return Err(ValidationError::InvalidHostname(
            "hostname must be raw, no scheme allowed".into(),
        ));
    }
    if input.contains('/') {
        return Err(ValidationError::InvalidHostname(
            "hostname must be raw, no path allowed".into(),
        ));
    }
    if input.contains(':') {
        return Err(ValidationError::InvalidHostname(
            "hostname must be raw, no port allowed".into(),
        ));
    }

    let ascii = idna::domain_to_ascii(input)
        .map_err(|e| ValidationError::InvalidHostname(format!("IDNA conversion failed: {e}")))?;

    if ascii.starts_with('.') || ascii.ends_with('.') {
        return Err(ValidationError::InvalidHostname(format!(
            "hostname {ascii:?} must not have a leading or trailing dot"
        )));
    }
    if !ascii.contains('.') || ascii.contains("..") {
        return Err(ValidationError::InvalidHostname(format!(
            "hostname {ascii:?} does not appear to be valid"
        )));
    }

    Ok(ascii.to_lowercase())
}

/// The two network probes the FSM driver performs, behind a trait so the
/// driver can be exercised without the network.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Resolve the hostname to a non-empty set of addresses.
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ValidationError>;

    /// Fetch the response headers of `https://<hostname>/`, requiring
    /// HTTP 200.
    async fn fetch_headers(&self, hostname: &str) -> Result<HeaderMap, ValidationError>;
}

/// The production [`Prober`]: system DNS and a real HTTPS request.
pub struct NetProber {
    http: reqwest::Client,
}

impl NetProber {
    pub fn new() -> Result<Self, ValidationError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("webcat/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTPS_TIMEOUT)
            .build()
            .map_err(|e| ValidationError::HttpsFailure(e.to_string()))?;
        Ok(NetProber { http })
    }
}

#[async_trait]
impl Prober for NetProber {
    #[instrument(skip(self))]
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ValidationError> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((hostname, 443))
            .await
            .map_err(|e| ValidationError::DnsFailure(e.to_string()))?
            .map(|addr| addr.ip())
            .collect();
        if addrs.is_empty() {
            return Err(ValidationError::DnsFailure(format!(
                "no addresses found for {hostname}"
            )));
        }
        Ok(addrs)
    }

    #[instrument(skip(self))]
    async fn fetch_headers(&self, hostname: &str) -> Result<HeaderMap, ValidationError> {
        let response = self
            .http
            .get(format!("https://{hostname}/"))
            .send()
            .await
            .map_err(|e| ValidationError::HttpsFailure(e.to_string()))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(ValidationError::HttpsFailure(format!(
                "HTTPS check returned status {}",
                response.status().as_u16()
            )));
        }
        Ok(response.headers().clone())
    }
}

/// The validated, normalized content of the three webcat headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedHeaders {
    /// Compact JSON array of signers, lower-cased and sorted.
    pub signers: String,
    pub threshold: i64,
    pub action: Action,
}

/// Validate and normalize `x-sigstore-signers`, `x-sigstore-threshold`,
/// and `x-webcat-action`.
pub fn normalize_sigstore(headers: &HeaderMap) -> Result<NormalizedHeaders, ValidationError> {
    let signers_raw = require_header(headers, "x-sigstore-signers")?;
    let threshold_raw = require_header(headers, "x-sigstore-threshold")?;
    let action_raw = require_header(headers, "x-webcat-action")?;

    let action = Action::parse(&action_raw).ok_or_else(|| {
        ValidationError::HeaderMalformed(format!(
            "invalid x-webcat-action value {action_raw:?}: must be add, modify, or delete"
        ))
    })?;

    let (signers, count) = normalize_signers(&signers_raw)?;

    let threshold: i64 = threshold_raw.trim().parse().map_err(|_| {
        ValidationError::HeaderMalformed(format!(
            "x-sigstore-threshold is not a valid integer: {threshold_raw:?}"
        ))
    })?;
    if threshold < 0 {
        return Err(ValidationError::HeaderMalformed(
            "x-sigstore-threshold must not be negative".into(),
        ));
    }
    if threshold > count as i64 {
        return Err(ValidationError::HeaderMalformed(format!(
            "x-sigstore-threshold ({threshold}) is greater than the number of signers ({count})"
        )));
    }

    Ok(NormalizedHeaders {
        signers,
        threshold,
        action,
    })
}

/// Normalize a raw signers JSON array: trim and lower-case each field,
/// validate the identity shape and issuer allow-list, sort by
/// `(identity, issuer)`, and re-serialize compactly. Returns the
/// normalized JSON and the signer count.
///
/// Normalization is a fixed point: feeding the output back in returns the
/// same string.
pub fn normalize_signers(raw: &str) -> Result<(String, usize), ValidationError> {
    let mut signers: Vec<Signer> = serde_json::from_str(raw).map_err(|e| {
        ValidationError::HeaderMalformed(format!("invalid x-sigstore-signers JSON: {e}"))
    })?;

    let count = signers.len();
    if !(MIN_SIGNERS..=MAX_SIGNERS).contains(&count) {
        return Err(ValidationError::HeaderMalformed(format!(
            "number of signers must be between {MIN_SIGNERS} and {MAX_SIGNERS}; got {count}"
        )));
    }

    for (i, signer) in signers.iter_mut().enumerate() {
        signer.identity = signer.identity.trim().to_lowercase();
        signer.issuer = signer.issuer.trim().to_lowercase();

        if !EMAIL_RE.is_match(&signer.identity) {
            return Err(ValidationError::HeaderMalformed(format!(
                "signer {i} has an invalid email address: {}",
                signer.identity
            )));
        }
        if !ALLOWED_ISSUERS.contains(&signer.issuer.as_str()) {
            return Err(ValidationError::HeaderMalformed(format!(
                "signer {i} has an invalid issuer: {}",
                signer.issuer
            )));
        }
    }

    signers.sort_by(|a, b| {
        a.identity
            .cmp(&b.identity)
            .then_with(|| a.issuer.cmp(&b.issuer))
    });

    let normalized = serde_json::to_string(&signers).map_err(|e| {
        ValidationError::HeaderMalformed(format!("failed to serialize normalized signers: {e}"))
    })?;
    Ok((normalized, count))
}

fn require_header(headers: &HeaderMap, name: &str) -> Result<String, ValidationError> {
    let value = headers
        .get(name)
        .ok_or_else(|| {
            ValidationError::HeaderMalformed(format!("missing required header: {name}"))
        })?
        .to_str()
        .map_err(|_| {
            ValidationError::HeaderMalformed(format!("header {name} is not valid ASCII"))
        })?
        .trim()
        .to_string();
    if value.is_empty() {
        return Err(ValidationError::HeaderMalformed(format!(
            "missing required header: {name}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn canonicalizes_mixed_case_and_unicode() {
        assert_eq!(
            canonicalize_hostname("Example.COM").unwrap(),
            "example.com"
        );
        assert_eq!(
            canonicalize_hostname("bücher.example").unwrap(),
            "xn--bcher-kva.example"
        );
    }

    #[test]
    fn rejects_malformed_hostnames() {
        for bad in [
            "",
            "   ",
            "https://example.com",
            "example.com/path",
            "example.com:8443",
            ".example.com",
            "example.com.",
            "example..com",
            "localhost",
        ] {
            assert!(
                canonicalize_hostname(bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    fn headers(signers: &str, threshold: &str, action: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            "x-sigstore-signers",
            HeaderValue::from_str(signers).unwrap(),
        );
        map.insert(
            "x-sigstore-threshold",
            HeaderValue::from_str(threshold).unwrap(),
        );
        map.insert("x-webcat-action", HeaderValue::from_str(action).unwrap());
        map
    }

    fn signers_json(count: usize) -> String {
        let signers: Vec<String> = (0..count)
            .map(|i| {
                format!(r#"{{"identity":"user{i}@example.com","issuer":"https://gitlab.com"}}"#)
            })
            .collect();
        format!("[{}]", signers.join(","))
    }

    #[test]
    fn normalizes_and_sorts_signers() {
        let map = headers(
            r#"[{"identity":"B@X.Y","issuer":"https://GitHub.com/login/oauth"}, {"identity":" a@x.y ","issuer":"https://github.com/login/oauth"}]"#,
            "1",
            "ADD",
        );
        let normalized = normalize_sigstore(&map).unwrap();
        assert_eq!(
            normalized.signers,
            r#"[{"identity":"a@x.y","issuer":"https://github.com/login/oauth"},{"identity":"b@x.y","issuer":"https://github.com/login/oauth"}]"#
        );
        assert_eq!(normalized.threshold, 1);
        assert_eq!(normalized.action, Action::Add);
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        let (once, _) = normalize_signers(
            r#"[{"identity":"B@X.Y","issuer":"https://gitlab.com"},
                {"identity":"a@x.y","issuer":"https://gitlab.com"}]"#,
        )
        .unwrap();
        let (twice, _) = normalize_signers(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn signer_count_bounds() {
        assert!(normalize_signers(&signers_json(1)).is_ok());
        assert!(normalize_signers(&signers_json(16)).is_ok());
        assert!(normalize_signers(&signers_json(0)).is_err());
        assert!(normalize_signers(&signers_json(17)).is_err());
    }

    #[test]
    fn threshold_bounds() {
        let map = headers(&signers_json(3), "3", "add");
        assert!(normalize_sigstore(&map).is_ok());
        let map = headers(&signers_json(3), "4", "add");
        assert!(normalize_sigstore(&map).is_err());
        let map = headers(&signers_json(3), "-1", "add");
        assert!(normalize_sigstore(&map).is_err());
        let map = headers(&signers_json(3), "three", "add");
        assert!(normalize_sigstore(&map).is_err());
    }

    #[test]
    fn rejects_unknown_issuer_and_bad_identity() {
        assert!(normalize_signers(
            r#"[{"identity":"a@x.y","issuer":"https://evil.example.org"}]"#
        )
        .is_err());
        assert!(
            normalize_signers(r#"[{"identity":"not-an-email","issuer":"https://gitlab.com"}]"#)
                .is_err()
        );
    }

    #[test]
    fn rejects_signers_with_extra_fields() {
        assert!(normalize_signers(
            r#"[{"identity":"a@x.y","issuer":"https://gitlab.com","role":"admin"}]"#
        )
        .is_err());
    }

    #[test]
    fn rejects_missing_headers_and_bad_action() {
        let map = headers(&signers_json(1), "1", "publish");
        assert!(normalize_sigstore(&map).is_err());

        let mut map = headers(&signers_json(1), "1", "add");
        map.remove("x-sigstore-threshold");
        assert!(normalize_sigstore(&map).is_err());
    }

    #[test]
    fn action_is_case_insensitive() {
        let map = headers(&signers_json(1), "1", "DELETE");
        assert_eq!(normalize_sigstore(&map).unwrap().action, Action::Delete);
    }
}
