use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sw_crypto::{AllowList, IdentityKeyStore};
use sw_domain::config::{LogFormat, ObservabilityConfig};
use sw_echo_host::{EchoHost, HostFile};

/// Echo responder for sealed-wire sessions.
#[derive(Debug, Parser)]
#[command(name = "sw-echo-host", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(default_value = "127.0.0.1:7400")]
    listen: String,

    /// TOML config file (`[host]`, `[observability]`, `allow`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hex secp256k1 secret key.  A fresh identity is generated when absent.
    #[arg(long, env = "SW_HOST_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Signer address allowed to open sessions.  Repeatable.
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Accept session-init from any signer.
    #[arg(long, conflicts_with = "allow")]
    allow_any: bool,

    /// Override `host.context_window`.
    #[arg(long)]
    context_window: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut file = match &cli.config {
        Some(path) => HostFile::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => HostFile::default(),
    };
    init_tracing(&file.observability);

    if let Some(window) = cli.context_window {
        file.host.context_window = window;
    }

    let identity = match &cli.secret_key {
        Some(hex) => IdentityKeyStore::from_secret_hex(hex).context("parsing --secret-key")?,
        None => {
            tracing::warn!("no secret key given, generating an ephemeral identity");
            IdentityKeyStore::generate()
        }
    };

    let allowed: Vec<String> = file.allow.iter().chain(cli.allow.iter()).cloned().collect();
    let authz = if cli.allow_any || allowed.is_empty() {
        tracing::warn!("accepting session-init from any signer");
        AllowList::open()
    } else {
        AllowList::new(allowed)
    };

    let host = EchoHost::new(Arc::new(identity), Arc::new(authz), file.host);
    let public_key = host.public_key_hex();
    let mut running = host.bind(&cli.listen).await.context("binding listener")?;

    println!("address:    {}", running.control().address());
    println!("public key: {public_key}");
    println!("url:        {}", running.url());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    running.shutdown();
    running.wait().await;
    Ok(())
}

fn init_tracing(obs: &ObservabilityConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sw_echo_host=debug", obs.log_filter)));
    let registry = tracing_subscriber::registry().with(env_filter);
    match obs.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}
