// SPDX-License-Identifier: MIT

//! The canonical payload: the exact bytes that are hashed, signed, and
//! recorded in the transparency log.
//!
//! Serialization here is part of the wire format. The list builder
//! re-serializes payloads fetched from the data server and requires byte
//! equality with the originally signed bytes, so field order is fixed by
//! struct declaration order, JSON is compact, and `signers` stays a string
//! field containing JSON rather than a nested array.

use serde::{Deserialize, Serialize};

use crate::sigsum::Hash;

/// The requested mutation of the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Action {
    Add,
    Modify,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Modify => "modify",
            Action::Delete => "delete",
        }
    }

    /// Parse a header value, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "add" => Some(Action::Add),
            "modify" => Some(Action::Modify),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Sigstore signer: an OIDC identity and the issuer that attests it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signer {
    pub identity: String,
    pub issuer: String,
}

/// The canonical payload. Field order is load-bearing; see the module
/// docs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanonicalPayload {
    pub domain: String,
    pub action: Action,
    /// The normalized signers JSON, kept as a string field.
    pub signers: String,
    pub threshold: i64,
    /// RFC 3339, second precision, UTC.
    pub confirmation_date: String,
}

impl CanonicalPayload {
    /// The canonical serialization: compact JSON in declaration order.
    pub fn to_canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// The canonical serialization as a string, for storage columns and
    /// wire fields. Byte-identical to [`CanonicalPayload::to_canonical_bytes`].
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// The message hash: SHA-256 over the canonical serialization.
    pub fn message_hash(&self) -> serde_json::Result<Hash> {
        Ok(Hash::of(&self.to_canonical_bytes()?))
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// The per-domain policy object hashed into the published list. Signers
/// are lower-cased and sorted by `(identity, issuer)` before
/// serialization, so equal policies hash equally regardless of how the
/// stored signers string was produced.
pub fn domain_policy_json(signers_json: &str, threshold: i64) -> serde_json::Result<Vec<u8>> {
    #[derive(Serialize)]
    struct DomainPolicy<'a> {
        #[serde(rename = "x-sigstore-signers")]
        signers: &'a [Signer],
        #[serde(rename = "x-sigstore-threshold")]
        threshold: i64,
    }

    let mut signers: Vec<Signer> = serde_json::from_str(signers_json)?;
    for signer in &mut signers {
        signer.identity = signer.identity.to_lowercase();
        signer.issuer = signer.issuer.to_lowercase();
    }
    signers.sort_by(|a, b| {
        a.identity
            .cmp(&b.identity)
            .then_with(|| a.issuer.cmp(&b.issuer))
    });

    serde_json::to_vec(&DomainPolicy {
        signers: &signers,
        threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> CanonicalPayload {
        CanonicalPayload {
            domain: "example.com".to_string(),
            action: Action::Add,
            signers: r#"[{"identity":"a@x.y","issuer":"https://github.com/login/oauth"}]"#
                .to_string(),
            threshold: 1,
            confirmation_date: "2025-06-10T12:00:00Z".to_string(),
        }
    }

    #[test]
    fn canonical_bytes_have_fixed_field_order() {
        let bytes = payload().to_canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            r#"{"domain":"example.com","action":"add","signers":"[{\"identity\":\"a@x.y\",\"issuer\":\"https://github.com/login/oauth\"}]","threshold":1,"confirmation_date":"2025-06-10T12:00:00Z"}"#
        );
    }

    #[test]
    fn canonical_json_matches_canonical_bytes() {
        let payload = payload();
        assert_eq!(
            payload.to_canonical_json().unwrap().into_bytes(),
            payload.to_canonical_bytes().unwrap()
        );
    }

    #[test]
    fn reserialization_is_byte_stable() {
        let bytes = payload().to_canonical_bytes().unwrap();
        let parsed = CanonicalPayload::from_json(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(parsed.to_canonical_bytes().unwrap(), bytes);
        assert_eq!(parsed.message_hash().unwrap(), payload().message_hash().unwrap());
    }

    #[test]
    fn rejects_unknown_payload_fields() {
        let result = CanonicalPayload::from_json(
            r#"{"domain":"example.com","action":"add","signers":"[]","threshold":1,"confirmation_date":"2025-06-10T12:00:00Z","extra":true}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn domain_policy_sorts_and_lowercases() {
        let signers = r#"[
            {"identity":"B@x.y","issuer":"https://gitlab.com"},
            {"identity":"a@x.y","issuer":"https://gitlab.com"}
        ]"#;
        let policy = domain_policy_json(signers, 2).unwrap();
        let text = String::from_utf8(policy).unwrap();
        assert_eq!(
            text,
            r#"{"x-sigstore-signers":[{"identity":"a@x.y","issuer":"https://gitlab.com"},{"identity":"b@x.y","issuer":"https://gitlab.com"}],"x-sigstore-threshold":2}"#
        );
    }
}
