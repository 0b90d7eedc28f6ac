//! `s3driver`: node plugin that mounts S3 buckets into RK8s workloads.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use libs3csi::config::DEFAULT_BUCKET_CHECK_TIMEOUT;
use libs3csi::mount_point::DEFAULT_MOUNTS_FILE;
use libs3csi::mounter::fuse::DEFAULT_MOUNT_WAIT;
use libs3csi::transport::server::CsiServer;
use libs3csi::transport::tls;
use libs3csi::{
    FileSecretStore, FuseMounter, MountPointChecker, MounterKind, NodeConfig, NodeServer,
    S3BucketClient,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// S3 CSI node plugin.
#[derive(Parser, Debug)]
#[command(name = "s3driver", version, about, long_about = None)]
struct Args {
    /// QUIC listen address
    #[arg(long, env = "S3CSI_ENDPOINT", default_value = "0.0.0.0:7443")]
    endpoint: SocketAddr,

    /// Identifier of this node
    #[arg(long, env = "S3CSI_NODE_ID")]
    node_id: String,

    /// Maximum volumes on this node, 0 for unlimited
    #[arg(long, env = "S3CSI_MAX_VOLUMES", default_value_t = 0)]
    max_volumes: u64,

    /// Root of the mounted secret volumes (<dir>/<namespace>/<name>/<key>)
    #[arg(long, env = "S3CSI_SECRETS_DIR", value_name = "DIR")]
    secrets_dir: PathBuf,

    /// PEM certificate chain presented to clients
    #[arg(long, env = "S3CSI_TLS_CERT", value_name = "FILE")]
    tls_cert: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, env = "S3CSI_TLS_KEY", value_name = "FILE")]
    tls_key: PathBuf,

    /// Mount table consulted for idempotency checks
    #[arg(long, env = "S3CSI_MOUNTS_FILE", default_value = DEFAULT_MOUNTS_FILE)]
    mounts_file: PathBuf,

    /// FUSE tool used when neither the bucket nor its credentials name one
    #[arg(long, env = "S3CSI_DEFAULT_MOUNTER", default_value = "s3fs")]
    default_mounter: MounterKind,

    /// Upper bound on each bucket lookup against object storage
    #[arg(long, env = "S3CSI_BUCKET_CHECK_TIMEOUT_SECS", default_value_t = DEFAULT_BUCKET_CHECK_TIMEOUT.as_secs())]
    bucket_check_timeout_secs: u64,

    /// How long a FUSE tool gets to make its mount visible
    #[arg(long, env = "S3CSI_MOUNT_WAIT_SECS", default_value_t = DEFAULT_MOUNT_WAIT.as_secs())]
    mount_wait_secs: u64,

    #[arg(long, env = "S3CSI_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            node_id: self.node_id.clone(),
            max_volumes: self.max_volumes,
            bucket_check_timeout: Duration::from_secs(self.bucket_check_timeout_secs),
            mount_wait_timeout: Duration::from_secs(self.mount_wait_secs),
            default_mounter: self.default_mounter,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_tls(args: &Args) -> Result<rustls::ServerConfig> {
    let certs = CertificateDer::pem_file_iter(&args.tls_cert)
        .with_context(|| format!("failed to open {}", args.tls_cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse {}", args.tls_cert.display()))?;
    let key = PrivateKeyDer::from_pem_file(&args.tls_key)
        .with_context(|| format!("failed to load {}", args.tls_key.display()))?;
    tls::server_config(certs, key).context("invalid TLS certificate or key")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    info!("s3driver {}", env!("CARGO_PKG_VERSION"));

    let config = args.node_config();
    let checker = MountPointChecker::new(&args.mounts_file);
    let node = NodeServer::new(
        config.clone(),
        checker.clone(),
        Arc::new(FileSecretStore::new(&args.secrets_dir)),
        Arc::new(S3BucketClient::new(config.default_mounter)),
        Arc::new(FuseMounter::new(checker, config.mount_wait_timeout)),
    );

    let tls_config = load_tls(&args)?;
    let server = CsiServer::new(args.endpoint, tls_config, Arc::new(node))
        .context("failed to start QUIC server")?;
    info!(
        node_id = %config.node_id,
        endpoint = %args.endpoint,
        default_mounter = %config.default_mounter,
        "node plugin ready"
    );

    tokio::select! {
        res = server.serve() => res.context("QUIC server stopped")?,
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            warn!("shutdown signal received");
        }
    }

    server.shutdown().await;
    Ok(())
}
