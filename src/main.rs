use anyhow::{Context, Result};
use clap::Parser;
use forgeproxy::{LogRecorder, MitmProxy, ProxyConfig, RootAuthority};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "forgeproxy", version, about = "TLS-intercepting forward proxy")]
struct Cli {
  /// Address to listen on
  #[arg(short, long, env = "FORGEPROXY_LISTEN", default_value = "127.0.0.1:8080")]
  listen: String,
  /// Path to the root certificate (PEM)
  #[arg(long, env = "FORGEPROXY_CA_CERT", default_value = "ca.crt")]
  ca_cert: PathBuf,
  /// Path to the root private key (PEM)
  #[arg(long, env = "FORGEPROXY_CA_KEY", default_value = "ca.key")]
  ca_key: PathBuf,
  /// Directory where forged certificates are stored
  #[arg(long, env = "FORGEPROXY_CERT_STORE", default_value = "certs")]
  cert_store: PathBuf,
  /// Origin connect timeout in seconds
  #[arg(long, default_value_t = 10)]
  connect_timeout: u64,
  /// Skip verification of origin certificates
  #[arg(long, default_value_t = false)]
  insecure_origin: bool,
  /// Generate a root pair at the CA paths and exit
  #[arg(long, default_value_t = false)]
  init_ca: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "forgeproxy=info".into()),
    )
    .init();

  let cli = Cli::parse();

  if cli.init_ca {
    RootAuthority::generate(&cli.ca_cert, &cli.ca_key)
      .await
      .context("root pair generation failed")?;
    tracing::info!(
      "root pair written to {} and {}",
      cli.ca_cert.display(),
      cli.ca_key.display()
    );
    return Ok(());
  }

  let config = ProxyConfig {
    listen: cli.listen,
    ca_cert_path: cli.ca_cert,
    ca_key_path: cli.ca_key,
    cert_store_path: cli.cert_store,
    connect_timeout: Duration::from_secs(cli.connect_timeout),
    verify_origin_certs: !cli.insecure_origin,
    ..ProxyConfig::default()
  };

  let proxy = MitmProxy::new(config, Arc::new(LogRecorder))
    .await
    .context("proxy initialization failed")?;
  proxy.start().await.context("proxy terminated")?;
  Ok(())
}
