// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};
use webcat::{
    api::{self, ApiState},
    config::Config,
    db, signal_handler,
};

/// The webcat REST API.
///
/// Serves submission ingest, status, confirmation, and the transparency
/// data server. All verification happens in the separate processor; this
/// service only creates and reads rows.
///
/// Configuration is layered: the TOML file (or defaults), then the
/// DATABASE_PATH and WEBCAT_API_LISTEN environment variables, then any
/// flags below.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the API's configuration file.
    ///
    /// If no path is provided, $CONFIGURATION_DIRECTORY/webcat.toml is
    /// used when present, else the defaults.
    #[arg(long, short, env = "WEBCAT_API_CONFIG")]
    config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level"
    /// where level is one of TRACE, DEBUG, INFO, WARN, ERROR.
    #[arg(long, env = "WEBCAT_LOG", default_value = "WARN,webcat=INFO")]
    log_filter: String,

    /// Override the state directory, which holds the SQLite database.
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long)]
    listen: Option<String>,
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
    if let Some(path) = opts.database_path {
        config.state_directory = path;
    }
    if let Some(listen) = opts.listen {
        config.api_listen_addr = listen;
    }

    let db = db::pool(
        config
            .database()
            .as_os_str()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Database path isn't valid UTF8"))?,
    )
    .await?;
    db::migrate(&db).await?;

    let halt_token = CancellationToken::new();
    tokio::spawn(signal_handler(halt_token.clone()));
    api::serve(ApiState { db }, &config.api_listen_addr, halt_token).await
}
