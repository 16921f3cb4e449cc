mod cluster;
mod config;
mod logging;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use libcsisync::MetadataSyncer;
use libcsisync::backend::memory::MemoryCatalog;
use libcsisync::transport::client::CatalogClient;
use libcsisync::transport::server::CatalogServer;
use libcsisync::transport::tls;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cluster::KubeClusterState;
use crate::config::DaemonConfig;
use crate::logging::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "csisyncd", version, about = "CSI volume metadata sync daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Also send logs to the systemd journal.
    #[arg(long, global = true)]
    journald: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Keep the remote catalog in sync with the Kubernetes cluster.
    Run(RunArgs),
    /// Serve an in-memory catalog over QUIC, for development.
    Catalog(CatalogArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// YAML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long)]
    cluster_id: Option<String>,

    /// Catalog address, `host:port`.
    #[arg(long)]
    catalog_addr: Option<String>,

    #[arg(long)]
    catalog_server_name: Option<String>,

    /// CA bundle used to verify the catalog certificate.
    #[arg(long)]
    catalog_ca: Option<PathBuf>,

    #[arg(long)]
    full_sync_interval_minutes: Option<u64>,
}

impl RunArgs {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(cluster_id) = self.cluster_id {
            config.sync.cluster_id = cluster_id;
        }
        if let Some(address) = self.catalog_addr {
            config.catalog.address = address;
        }
        if let Some(server_name) = self.catalog_server_name {
            config.catalog.server_name = server_name;
        }
        if let Some(ca) = self.catalog_ca {
            config.catalog.ca_cert = Some(ca);
        }
        if let Some(minutes) = self.full_sync_interval_minutes {
            config.sync.full_sync_interval_minutes = minutes;
        }
    }
}

#[derive(Debug, Args)]
struct CatalogArgs {
    #[arg(long, default_value = "0.0.0.0:7443")]
    listen: SocketAddr,

    /// PEM certificate chain presented to clients.
    #[arg(long)]
    cert: PathBuf,

    /// PEM private key for `--cert`.
    #[arg(long)]
    key: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.journald)?;
    // kube and the catalog transport share one rustls provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a rustls crypto provider was already installed");
    }

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Catalog(args) => serve_catalog(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config_path = args.config.clone();
    let mut config = DaemonConfig::load(config_path.as_deref())?;
    args.apply(&mut config);
    config.sync.validate().context("invalid sync configuration")?;

    let Some(ca_path) = config.catalog.ca_cert.as_deref() else {
        bail!("catalog.ca_cert (or --catalog-ca) is required");
    };
    let roots = tls::load_certs(ca_path).context("failed to load catalog CA")?;
    let addr: SocketAddr = config
        .catalog
        .address
        .parse()
        .with_context(|| format!("invalid catalog address {}", config.catalog.address))?;
    let tls_config = tls::client_config(roots)?;
    let catalog = CatalogClient::connect(addr, &config.catalog.server_name, tls_config)
        .await
        .with_context(|| format!("failed to connect to catalog at {addr}"))?;
    info!(%addr, "connected to catalog");

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let cluster = Arc::new(KubeClusterState::new(client));

    let syncer = MetadataSyncer::new(Arc::new(catalog), cluster, config.sync)?;
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown.send(true);
        }
    });
    syncer.run(rx).await?;
    Ok(())
}

async fn serve_catalog(args: CatalogArgs) -> Result<()> {
    let chain = tls::load_certs(&args.cert)?;
    let key = tls::load_key(&args.key)?;
    let server = CatalogServer::new(
        args.listen,
        tls::server_config(chain, key)?,
        Arc::new(MemoryCatalog::new()),
    )?;
    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received, stopping catalog"),
    }
    Ok(())
}
