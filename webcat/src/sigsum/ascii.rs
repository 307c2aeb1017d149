// SPDX-License-Identifier: MIT

//! The `key=value` line format used by Sigsum log endpoints and stored
//! proofs.

use crate::sigsum::SigsumError;

/// Parse a blob of `key=value` lines, preserving order and duplicates.
/// Blank lines are ignored.
pub(crate) fn parse(text: &str) -> Result<Vec<(String, String)>, SigsumError> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| SigsumError::Ascii(format!("line without '=': {line:?}")))?;
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

/// Get the single value for `key`, failing on absence or duplication.
pub(crate) fn require_one<'a>(
    pairs: &'a [(String, String)],
    key: &str,
) -> Result<&'a str, SigsumError> {
    let mut values = pairs.iter().filter(|(k, _)| k == key);
    let value = values
        .next()
        .ok_or_else(|| SigsumError::Ascii(format!("missing key {key:?}")))?;
    if values.next().is_some() {
        return Err(SigsumError::Ascii(format!("duplicate key {key:?}")));
    }
    Ok(&value.1)
}

/// Collect every value for a repeatable `key`.
pub(crate) fn collect<'a>(pairs: &'a [(String, String)], key: &str) -> Vec<&'a str> {
    pairs
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .collect()
}

pub(crate) fn parse_u64(value: &str, key: &str) -> Result<u64, SigsumError> {
    value
        .parse()
        .map_err(|_| SigsumError::Ascii(format!("{key} is not an unsigned integer: {value:?}")))
}

pub(crate) fn write_line(out: &mut String, key: &str, value: impl std::fmt::Display) {
    out.push_str(key);
    out.push('=');
    out.push_str(&value.to_string());
    out.push('\n');
}
