// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::Instrument;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};
use webcat::{
    config::{Config, ConfirmationMode},
    db,
    fsm::{Driver, SigsumPublisher},
    keys,
    processor::Processor,
    sigsum::Policy,
    signal_handler,
    validator::NetProber,
};

/// The webcat submission processor.
///
/// This includes a command to run the background processor, along with a
/// set of management commands: applying database migrations and inspecting
/// the effective configuration.
///
/// The processor drives every pending submission through verification,
/// ownership confirmation, payload signing, and transparency logging. It
/// generates the submit keypair on first start if the configured key file
/// does not exist.
///
/// Configuration is layered: the TOML file (or defaults), then the
/// DATABASE_PATH, CONFIRMATION_MODE, SIGSUM_PRIVATE_KEY_PATH, and
/// SIGSUM_LOG_POLICY_PATH environment variables, then any flags below.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the processor's configuration file.
    ///
    /// If no path is provided, $CONFIGURATION_DIRECTORY/webcat.toml is
    /// used when present, else the defaults. To view the effective
    /// configuration, run the `config` subcommand.
    #[arg(long, short, env = "WEBCAT_PROCESSOR_CONFIG")]
    config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level"
    /// where level is one of TRACE, DEBUG, INFO, WARN, ERROR.
    #[arg(long, env = "WEBCAT_LOG", default_value = "WARN,webcat=INFO")]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the processor.
    Listen {
        /// Override the state directory, which holds the SQLite database.
        #[arg(long)]
        database_path: Option<PathBuf>,

        /// Override the confirmation mode.
        #[arg(long, value_enum)]
        confirmation_mode: Option<ConfirmationMode>,

        /// Override the submit key path.
        #[arg(long)]
        submit_key_path: Option<PathBuf>,

        /// Override the Sigsum trust policy path.
        #[arg(long)]
        policy_path: Option<PathBuf>,
    },

    /// See the current processor configuration.
    Config {},

    /// Apply any database migrations.
    ///
    /// The processor and the API apply migrations on startup as well, so
    /// this is only needed to prepare a database ahead of time.
    Migrate {},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "WEBCAT_LOG contains an invalid log directive; refer to the \
         tracing-subscriber EnvFilter documentation for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let mut config = Config::load(opts.config)?;

    match opts.command {
        Command::Listen {
            database_path,
            confirmation_mode,
            submit_key_path,
            policy_path,
        } => {
            if let Some(path) = database_path {
                config.state_directory = path;
            }
            if let Some(mode) = confirmation_mode {
                config.confirmation_mode = mode;
            }
            if let Some(path) = submit_key_path {
                config.submit_key_path = path;
            }
            if let Some(path) = policy_path {
                config.policy_path = path;
            }

            let root_span = tracing::info_span!("processor");
            async move {
                let db = db::pool(
                    config
                        .database()
                        .as_os_str()
                        .to_str()
                        .ok_or_else(|| anyhow::anyhow!("Database path isn't valid UTF8"))?,
                )
                .await?;
                db::migrate(&db).await?;

                let keypair = keys::ensure_submit_key(&config.submit_key_path)?;
                let policy = Policy::from_file(&config.policy_path)?;
                let driver = Driver::new(
                    db.clone(),
                    Arc::new(NetProber::new()?),
                    Arc::new(SigsumPublisher::new(policy)),
                    keypair,
                    config.confirmation_mode,
                );
                let processor = Processor::new(
                    db,
                    driver,
                    Duration::from_secs(config.poll_interval_secs),
                )
                .run();
                tokio::spawn(signal_handler(processor.halt_token()));

                processor.wait_to_finish().await?;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(root_span)
            .await?;
        }
        Command::Config {} => {
            println!("# This is the current configuration\n\n{config}");
        }
        Command::Migrate {} => {
            let db = db::pool(
                config
                    .database()
                    .as_os_str()
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Database path isn't valid UTF8"))?,
            )
            .await?;
            db::migrate(&db).await?;
        }
    };

    Ok(())
}
