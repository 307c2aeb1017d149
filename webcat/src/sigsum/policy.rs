// SPDX-License-Identifier: MIT

//! Sigsum trust policy files.
//!
//! A policy names the logs a client may use and the witnesses whose
//! cosignatures it requires. The format is line-oriented:
//!
//! ```text
//! log <pubkey-hex> [url]
//! witness <name> <pubkey-hex> [url]
//! group <name> <any|all|k> <member>...
//! quorum <name|none>
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::sigsum::{
    types::{Hash, PublicKey},
    SigsumError,
};

/// A log named in the policy. The URL is optional; logs without one can
/// verify proofs but cannot be submitted to.
#[derive(Debug, Clone)]
pub struct LogEntity {
    pub public_key: PublicKey,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
struct Group {
    threshold: usize,
    members: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Policy {
    logs: Vec<LogEntity>,
    witnesses: HashMap<String, PublicKey>,
    groups: HashMap<String, Group>,
    /// `None` means an explicit `quorum none`: no cosignatures required.
    quorum: Option<String>,
}

impl Policy {
    pub fn from_file(path: &Path) -> Result<Self, SigsumError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SigsumError::Policy(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, SigsumError> {
        let mut logs = Vec::new();
        let mut witnesses = HashMap::new();
        let mut groups: HashMap<String, Group> = HashMap::new();
        let mut quorum: Option<Option<String>> = None;

        for (number, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_ascii_whitespace();
            let directive = fields.next().expect("non-empty line has a first field");
            let fields: Vec<&str> = fields.collect();
            match directive {
                "log" => match fields.as_slice() {
                    [key] => logs.push(LogEntity {
                        public_key: PublicKey::from_hex(key)?,
                        url: None,
                    }),
                    [key, url] => logs.push(LogEntity {
                        public_key: PublicKey::from_hex(key)?,
                        url: Some((*url).to_string()),
                    }),
                    _ => return Err(malformed(number, "log takes a key and an optional URL")),
                },
                "witness" => match fields.as_slice() {
                    [name, key] | [name, key, _] => {
                        let key = PublicKey::from_hex(key)?;
                        if witnesses.insert((*name).to_string(), key).is_some()
                            || groups.contains_key(*name)
                        {
                            return Err(malformed(number, "duplicate name"));
                        }
                    }
                    _ => {
                        return Err(malformed(
                            number,
                            "witness takes a name, a key, and an optional URL",
                        ))
                    }
                },
                "group" => {
                    let [name, threshold, members @ ..] = fields.as_slice() else {
                        return Err(malformed(
                            number,
                            "group takes a name, a threshold, and members",
                        ));
                    };
                    if members.is_empty() {
                        return Err(malformed(number, "group must have at least one member"));
                    }
                    let threshold = match *threshold {
                        "any" => 1,
                        "all" => members.len(),
                        k => k.parse().map_err(|_| {
                            malformed(number, "group threshold must be any, all, or an integer")
                        })?,
                    };
                    if threshold == 0 || threshold > members.len() {
                        return Err(malformed(number, "group threshold out of range"));
                    }
                    for member in members {
                        if !witnesses.contains_key(*member) && !groups.contains_key(*member) {
                            return Err(malformed(number, "group member is not yet defined"));
                        }
                    }
                    let group = Group {
                        threshold,
                        members: members.iter().map(|m| (*m).to_string()).collect(),
                    };
                    if witnesses.contains_key(*name)
                        || groups.insert((*name).to_string(), group).is_some()
                    {
                        return Err(malformed(number, "duplicate name"));
                    }
                }
                "quorum" => {
                    let [name] = fields.as_slice() else {
                        return Err(malformed(number, "quorum takes a single name"));
                    };
                    if quorum.is_some() {
                        return Err(malformed(number, "quorum is already set"));
                    }
                    if *name == "none" {
                        quorum = Some(None);
                    } else {
                        if !witnesses.contains_key(*name) && !groups.contains_key(*name) {
                            return Err(malformed(number, "quorum names an undefined entity"));
                        }
                        quorum = Some(Some((*name).to_string()));
                    }
                }
                other => {
                    return Err(malformed(number, &format!("unknown directive {other:?}")));
                }
            }
        }

        if logs.is_empty() {
            return Err(SigsumError::Policy("policy must name at least one log".into()));
        }
        let quorum = quorum
            .ok_or_else(|| SigsumError::Policy("policy must set a quorum".into()))?;

        Ok(Policy {
            logs,
            witnesses,
            groups,
            quorum,
        })
    }

    pub fn logs(&self) -> &[LogEntity] {
        &self.logs
    }

    /// Look up a log key by its key hash.
    pub fn log_key(&self, key_hash: &Hash) -> Option<&PublicKey> {
        self.logs
            .iter()
            .map(|log| &log.public_key)
            .find(|key| key.key_hash() == *key_hash)
    }

    /// Look up a witness key by its key hash.
    pub fn witness_key(&self, key_hash: &Hash) -> Option<&PublicKey> {
        self.witnesses
            .values()
            .find(|key| key.key_hash() == *key_hash)
    }

    /// Whether the set of witnesses (by key hash) that produced valid
    /// cosignatures satisfies the configured quorum.
    pub fn quorum_satisfied(&self, cosigned: &HashSet<Hash>) -> bool {
        match &self.quorum {
            None => true,
            Some(name) => self.entity_satisfied(name, cosigned),
        }
    }

    fn entity_satisfied(&self, name: &str, cosigned: &HashSet<Hash>) -> bool {
        if let Some(key) = self.witnesses.get(name) {
            return cosigned.contains(&key.key_hash());
        }
        if let Some(group) = self.groups.get(name) {
            let satisfied = group
                .members
                .iter()
                .filter(|member| self.entity_satisfied(member, cosigned))
                .count();
            return satisfied >= group.threshold;
        }
        false
    }
}

fn malformed(line_number: usize, message: &str) -> SigsumError {
    SigsumError::Policy(format!("line {}: {message}", line_number + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigsum::types::KeyPair;

    fn key() -> String {
        KeyPair::generate().public().to_hex()
    }

    #[test]
    fn parses_log_and_quorum_none() {
        let policy = Policy::parse(&format!(
            "# test policy\nlog {} https://log.example.org\nquorum none\n",
            key()
        ))
        .unwrap();
        assert_eq!(policy.logs().len(), 1);
        assert!(policy.quorum_satisfied(&HashSet::new()));
    }

    #[test]
    fn group_threshold_evaluation() {
        let w1 = KeyPair::generate().public();
        let w2 = KeyPair::generate().public();
        let w3 = KeyPair::generate().public();
        let policy = Policy::parse(&format!(
            "log {}\n\
             witness w1 {}\n\
             witness w2 {}\n\
             witness w3 {}\n\
             group two-of-three 2 w1 w2 w3\n\
             quorum two-of-three\n",
            key(),
            w1.to_hex(),
            w2.to_hex(),
            w3.to_hex(),
        ))
        .unwrap();

        let mut cosigned = HashSet::new();
        cosigned.insert(w1.key_hash());
        assert!(!policy.quorum_satisfied(&cosigned));
        cosigned.insert(w3.key_hash());
        assert!(policy.quorum_satisfied(&cosigned));
    }

    #[test]
    fn rejects_missing_quorum() {
        assert!(Policy::parse(&format!("log {}\n", key())).is_err());
    }

    #[test]
    fn rejects_undefined_group_member() {
        let result = Policy::parse(&format!(
            "log {}\ngroup g any nobody\nquorum none\n",
            key()
        ));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_directive() {
        assert!(Policy::parse("frobnicate yes\n").is_err());
    }
}
