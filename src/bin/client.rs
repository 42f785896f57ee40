//! Cloak Tunnel Client
//!
//! Accepts local TCP connections and carries each one as a stream over a
//! pooled, TLS-camouflaged session to the remote server. Runs standalone
//! from flags or as a plugin driven by the `SS_*` environment.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use cloak_tunnel::{
    client,
    config::{Config, ConfigError, LaunchSource, LoggingConfig},
    crypto,
    transport::{Dialer, TcpDialer},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Cloak Tunnel Client - TLS-camouflaged multiplexing tunnel
#[derive(Parser, Debug)]
#[command(name = "ck-client")]
#[command(about = "Cloak Tunnel Client - TLS-camouflaged multiplexing tunnel")]
#[command(version, disable_version_flag = true)]
struct Args {
    /// Local listen port
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Local listen host
    #[arg(long, default_value = "127.0.0.1")]
    local_host: String,

    /// Remote server host
    #[arg(short = 's', long)]
    remote_host: Option<String>,

    /// Remote server port
    #[arg(short = 'p', long, default_value_t = cloak_tunnel::DEFAULT_PORT)]
    remote_port: u16,

    /// Configuration file path or inline `Key=Value;...` options
    #[arg(short, long, default_value = "ckclient.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,
}

impl Args {
    fn launch_source(&self) -> LaunchSource {
        LaunchSource {
            local_host: Some(self.local_host.clone()),
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: Some(self.remote_port),
            options: Some(self.config.clone()),
        }
    }
}

fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match logging.format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Plugin mode wins over flags
    let source = match LaunchSource::from_env().context("Invalid plugin environment")? {
        Some(source) => source,
        None => args.launch_source(),
    };
    let options = source.options.clone().unwrap_or_else(|| args.config.clone());

    let mut config = Config::from_source(&options)
        .with_context(|| format!("Failed to load configuration from {}", options))?;
    config.client.apply(&source);

    init_logging(&config.logging, args.log_level.as_deref());

    let settings = match config.client.validate() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            match &e {
                ConfigError::Missing(field) => error!("Must specify {}", field),
                other => error!("{}", other),
            }
            std::process::exit(1);
        }
    };

    crypto::init_session_rng(None);

    info!("Cloak Tunnel Client v{}", cloak_tunnel::VERSION);
    info!("Remote: {}", settings.remote_addr);
    info!("Server name: {}", settings.server_name);
    info!("Browser profile: {}", settings.profile);
    info!("Connections per session: {}", settings.num_conn);

    let listener = TcpListener::bind(&settings.local_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", settings.local_addr))?;
    info!("Listening on {}", settings.local_addr);

    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new_default());

    tokio::select! {
        result = client::serve(listener, settings, dialer) => {
            if let Err(e) = result {
                error!("Client stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
