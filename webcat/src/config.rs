// SPDX-License-Identifier: MIT

//! Service configuration.
//!
//! Configuration is layered: a TOML file (or built-in defaults) provides
//! the base, the environment contract (`DATABASE_PATH`,
//! `CONFIRMATION_MODE`, `SIGSUM_PRIVATE_KEY_PATH`,
//! `SIGSUM_LOG_POLICY_PATH`, `WEBCAT_API_LISTEN`) overrides it, and CLI
//! flags override both.

use std::{env, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The config file name looked up under `$CONFIGURATION_DIRECTORY` when
/// no explicit path is given.
const CONFIG_FILE: &str = "webcat.toml";

/// How an `AWAITING_CONFIRMATION` submission gets confirmed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationMode {
    /// A random token is issued and its hash stored; an out-of-band
    /// confirmation must arrive within 12 hours.
    Email,
    /// The headers are re-fetched after one minute and must match the
    /// initially observed values byte for byte.
    #[default]
    Recheck,
}

/// Configuration shared by the webcat services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The directory where the service keeps its state: the SQLite
    /// database and the submit keypair. Back up this directory to back up
    /// the service.
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,

    /// The confirmation mode for new submissions.
    #[serde(default)]
    pub confirmation_mode: ConfirmationMode,

    /// The path to the hex-encoded submit private key. Generated on first
    /// start if missing; the matching `<path>.pub` file is written next to
    /// it.
    #[serde(default = "default_submit_key_path")]
    pub submit_key_path: PathBuf,

    /// The Sigsum trust policy file used when submitting leaves and
    /// verifying proofs.
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    /// The address the REST API binds to.
    #[serde(default = "default_api_listen_addr")]
    pub api_listen_addr: String,

    /// Seconds between processor polls for runnable submissions.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Config {
    /// Load the configuration.
    ///
    /// The file is taken from `path` when given, otherwise from
    /// `$CONFIGURATION_DIRECTORY/webcat.toml` if that exists, otherwise
    /// the defaults are used. The environment contract is then applied on
    /// top, so a `DATABASE_PATH` set by the operator (or a systemd unit)
    /// wins over the file.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or
    /// parsed, or if an environment variable holds an unusable value.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = match path.or_else(default_config_path) {
            Some(path) => {
                let text = std::fs::read_to_string(&path).with_context(|| {
                    format!("failed to read configuration from {}", path.display())
                })?;
                let config = toml::from_str(&text).with_context(|| {
                    format!(
                        "configuration file {} is invalid; the expected format is:\n\n{}",
                        path.display(),
                        Config::default()
                    )
                })?;
                tracing::info!(path = %path.display(), "Configuration file loaded");
                config
            }
            None => {
                tracing::debug!("No configuration file; starting from built-in defaults");
                Config::default()
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Fold the environment contract into this configuration. Unset and
    /// empty variables leave the current value alone.
    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(directory) = env_path("DATABASE_PATH") {
            self.state_directory = directory;
        }
        if let Some(mode) = env_string("CONFIRMATION_MODE") {
            self.confirmation_mode = match mode.to_ascii_lowercase().as_str() {
                "email" => ConfirmationMode::Email,
                "recheck" => ConfirmationMode::Recheck,
                other => anyhow::bail!(
                    "CONFIRMATION_MODE must be 'email' or 'recheck', not {other:?}"
                ),
            };
        }
        if let Some(path) = env_path("SIGSUM_PRIVATE_KEY_PATH") {
            self.submit_key_path = path;
        }
        if let Some(path) = env_path("SIGSUM_LOG_POLICY_PATH") {
            self.policy_path = path;
        }
        if let Some(addr) = env_string("WEBCAT_API_LISTEN") {
            self.api_listen_addr = addr;
        }
        Ok(())
    }

    /// The path of the SQLite database inside the state directory.
    pub fn database(&self) -> PathBuf {
        self.state_directory.join("webcat.sqlite")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_directory: default_state_directory(),
            confirmation_mode: ConfirmationMode::default(),
            submit_key_path: default_submit_key_path(),
            policy_path: default_policy_path(),
            api_listen_addr: default_api_listen_addr(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_config_path() -> Option<PathBuf> {
    env::var_os("CONFIGURATION_DIRECTORY")
        .map(|directory| PathBuf::from(directory).join(CONFIG_FILE))
        .filter(|path| path.is_file())
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("/var/lib/webcat/")
}

fn default_submit_key_path() -> PathBuf {
    PathBuf::from("/var/lib/webcat/submit.key")
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("/etc/webcat/sigsum.policy")
}

fn default_api_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let parsed: Config = toml::from_str(&config.to_string()).unwrap();
        assert_eq!(parsed.database(), config.database());
        assert_eq!(parsed.confirmation_mode, ConfirmationMode::Recheck);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("confirmation_mode = \"email\"\n").unwrap();
        assert_eq!(parsed.confirmation_mode, ConfirmationMode::Email);
        assert_eq!(parsed.poll_interval_secs, 5);
    }

    // All environment mutation lives in this one test; tests run in
    // parallel and must not race on these variables.
    #[test]
    fn environment_contract_overrides_the_file() {
        env::set_var("DATABASE_PATH", "/srv/webcat");
        env::set_var("CONFIRMATION_MODE", "Email");
        env::set_var("SIGSUM_PRIVATE_KEY_PATH", "/srv/webcat/submit.key");
        env::set_var("SIGSUM_LOG_POLICY_PATH", "/srv/webcat/sigsum.policy");
        env::set_var("WEBCAT_API_LISTEN", "0.0.0.0:9000");

        let config = Config::load(None).unwrap();
        assert_eq!(config.state_directory, PathBuf::from("/srv/webcat"));
        assert_eq!(config.database(), PathBuf::from("/srv/webcat/webcat.sqlite"));
        assert_eq!(config.confirmation_mode, ConfirmationMode::Email);
        assert_eq!(
            config.submit_key_path,
            PathBuf::from("/srv/webcat/submit.key")
        );
        assert_eq!(
            config.policy_path,
            PathBuf::from("/srv/webcat/sigsum.policy")
        );
        assert_eq!(config.api_listen_addr, "0.0.0.0:9000");

        // An unusable mode is an error, not a silent default.
        env::set_var("CONFIRMATION_MODE", "carrier-pigeon");
        assert!(Config::load(None).is_err());

        // Empty values leave the file/default value alone.
        env::set_var("CONFIRMATION_MODE", "");
        env::set_var("WEBCAT_API_LISTEN", " ");
        let config = Config::load(None).unwrap();
        assert_eq!(config.confirmation_mode, ConfirmationMode::Recheck);
        assert_eq!(config.api_listen_addr, default_api_listen_addr());

        for name in [
            "DATABASE_PATH",
            "CONFIRMATION_MODE",
            "SIGSUM_PRIVATE_KEY_PATH",
            "SIGSUM_LOG_POLICY_PATH",
            "WEBCAT_API_LISTEN",
        ] {
            env::remove_var(name);
        }
    }
}
