// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};
use webcat::{
    builder::{self, BuildConfig},
    keys,
    sigsum::{Policy, PublicKey},
};

/// Rebuild the published webcat list from the transparency log.
///
/// The builder trusts nothing but the log key, the submit key, and the
/// Sigsum policy: every payload is re-fetched from the data server,
/// re-hashed, and re-verified against its log leaf before it is replayed.
/// Any verification failure aborts the build. On success, the binary list
/// and a JSON proof bundle are written to the output directory and
/// `update.json` is pointed at the new bundle.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// A set of one or more comma-separated directives to filter logs.
    #[arg(long, env = "WEBCAT_LOG", default_value = "WARN,webcat=INFO")]
    log_filter: String,

    /// URL of the Sigsum log (e.g., https://poc.sigsum.org/jellyfish).
    #[arg(long)]
    log_url: Option<String>,

    /// Hex-encoded public key of the log.
    #[arg(long)]
    log_key: Option<String>,

    /// Hex-encoded submit public key; only its leaves are replayed.
    #[arg(long)]
    submit_key: Option<String>,

    /// URL of the data server for payload retrieval.
    #[arg(long)]
    data_server: Option<String>,

    /// Index to start retrieving leaves from.
    #[arg(long, default_value_t = 0)]
    start_index: u64,

    /// Number of leaves to fetch in each batch.
    #[arg(long, default_value_t = 512)]
    batch_size: u64,

    /// Directory the list and proof bundle are written to.
    #[arg(long, default_value = "pub")]
    output_dir: PathBuf,

    /// Path to the hex-encoded private key used to sign the list.
    #[arg(long, default_value = "signing.key")]
    signing_key_file: PathBuf,

    /// Path to the Sigsum trust policy file.
    #[arg(long, default_value = "sigsum.policy.test")]
    policy: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    let log_filter = EnvFilter::builder()
        .parse(&opts.log_filter)
        .context("WEBCAT_LOG contains an invalid log directive")?;
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let (Some(log_url), Some(log_key), Some(submit_key), Some(data_server)) = (
        opts.log_url,
        opts.log_key,
        opts.submit_key,
        opts.data_server,
    ) else {
        eprintln!(
            "--log-url, --log-key, --submit-key, and --data-server are required; \
             see --help for details"
        );
        std::process::exit(1);
    };

    let config = BuildConfig {
        log_url,
        log_key: PublicKey::from_hex(&log_key).context("--log-key is not a valid public key")?,
        submit_key: PublicKey::from_hex(&submit_key)
            .context("--submit-key is not a valid public key")?,
        data_server,
        start_index: opts.start_index,
        batch_size: opts.batch_size,
        output_dir: opts.output_dir,
        signing_key: keys::load_keypair(&opts.signing_key_file)?,
        policy: Policy::from_file(&opts.policy)?,
    };

    let outcome = builder::run(&config).await?;
    println!(
        "List written to {} ({} records); proof bundle at {}",
        outcome.list_path.display(),
        outcome.record_count,
        outcome.proof_path.display(),
    );
    Ok(())
}
