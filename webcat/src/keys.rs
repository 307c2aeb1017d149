// SPDX-License-Identifier: MIT

//! Submit-key storage.
//!
//! The key is persisted as two hex-encoded files: `<path>` holds the
//! private seed (mode 0600) and `<path>.pub` the public key (mode 0644).

use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use anyhow::Context;

use crate::sigsum::KeyPair;

/// Load the submit key, generating and persisting a fresh keypair if the
/// key file does not exist yet.
pub fn ensure_submit_key(path: &Path) -> anyhow::Result<KeyPair> {
    if path.exists() {
        return load_keypair(path);
    }

    tracing::info!(path = %path.display(), "Key file not found; generating a new keypair");
    let keypair = KeyPair::generate();
    write_private(path, &keypair.to_hex())?;

    let public_path = public_key_path(path);
    fs::write(&public_path, keypair.public().to_hex())
        .with_context(|| format!("failed to write {}", public_path.display()))?;
    fs::set_permissions(&public_path, Permissions::from_mode(0o644))?;

    tracing::info!(
        private = %path.display(),
        public = %public_path.display(),
        "New keypair generated and saved"
    );
    Ok(keypair)
}

/// Load an existing hex-encoded private key file.
pub fn load_keypair(path: &Path) -> anyhow::Result<KeyPair> {
    let encoded = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    KeyPair::from_hex(&encoded)
        .with_context(|| format!("key file {} is not a hex-encoded seed", path.display()))
}

fn public_key_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pub");
    name.into()
}

fn write_private(path: &Path, data: &str) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(data.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_same_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("submit.key");

        let generated = ensure_submit_key(&path).unwrap();
        let reloaded = ensure_submit_key(&path).unwrap();
        assert_eq!(generated.public(), reloaded.public());

        let public = fs::read_to_string(dir.path().join("submit.key.pub")).unwrap();
        assert_eq!(public, generated.public().to_hex());
    }

    #[test]
    fn file_modes_are_restrictive() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("submit.key");
        ensure_submit_key(&path).unwrap();

        let private_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(private_mode, 0o600);
        let public_mode = fs::metadata(dir.path().join("submit.key.pub"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(public_mode, 0o644);
    }

    #[test]
    fn rejects_garbage_key_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("submit.key");
        fs::write(&path, "not hex").unwrap();
        assert!(ensure_submit_key(&path).is_err());
    }
}
