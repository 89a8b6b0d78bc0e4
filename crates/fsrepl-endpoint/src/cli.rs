//! Command-line interface of the `fsrepl` binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fsrepl_transport::{
    Gate, RpcClient, RpcClientConfig, RpcServer, TcpTransport, TcpTransportConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::handler::Dispatcher;
use crate::remote::RemoteEndpoint;

/// `fsrepl` command line.
#[derive(Parser)]
#[command(name = "fsrepl")]
#[command(about = "Filesystem replication endpoint", long_about = None)]
pub struct Cli {
    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Serve the configured endpoint until interrupted.
    Serve {
        /// Configuration file (`.toml` or `.json`).
        #[arg(short, long, default_value = "/etc/fsrepl/endpoint.toml", env = "FSREPL_CONFIG")]
        config: PathBuf,
    },
    /// Ask a running endpoint what it exposes.
    List {
        /// Address of the endpoint.
        #[arg(short, long)]
        connect: String,
        /// List the versions of this filesystem instead of the filesystems.
        #[arg(long)]
        versions: Option<String>,
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Execute the parsed command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { config } => {
                let config = EndpointConfig::from_file(&config)?;
                let shutdown = CancellationToken::new();
                let on_signal = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received");
                        on_signal.cancel();
                    }
                });
                serve(&config, shutdown).await
            }
            Command::List {
                connect,
                versions,
                json,
            } => list(&connect, versions.as_deref(), json).await,
        }
    }
}

/// Serve the endpoint described by `config` until `shutdown` fires.
pub async fn serve(config: &EndpointConfig, shutdown: CancellationToken) -> Result<()> {
    let endpoint = config.local_endpoint(config.backend())?;
    let transport = TcpTransport::new(TcpTransportConfig::default());
    let listener = transport.listen(&config.listen).await?;
    info!(
        role = endpoint.role(),
        listen = %config.listen,
        max_concurrent_calls = config.max_concurrent_calls,
        "serving endpoint"
    );
    let server = RpcServer::new(Arc::new(Dispatcher::new(endpoint)))
        .with_gate(Gate::new(config.max_concurrent_calls));
    server.serve(&transport, listener, shutdown).await?;
    Ok(())
}

async fn list(addr: &str, versions: Option<&str>, json: bool) -> Result<()> {
    let transport = TcpTransport::new(TcpTransportConfig::default());
    let client = RpcClient::connect(&transport, addr, RpcClientConfig::default()).await?;
    let remote = RemoteEndpoint::new(Arc::new(client));

    match versions {
        Some(fs) => {
            let versions = remote.list_filesystem_versions(fs).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&versions)?);
            } else {
                for v in versions {
                    println!("{}{}\t{}\t{}", fs, v.rel_name(), v.guid, v.create_txg);
                }
            }
        }
        None => {
            let filesystems = remote.list_filesystems().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&filesystems)?);
            } else {
                for fs in filesystems {
                    println!("{}", fs.path);
                }
            }
        }
    }
    Ok(())
}
