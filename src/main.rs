// skiff server binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skiff::config::ServerConfig;
use skiff::directory::{derive_credential_secret, SqliteDirectory};
use skiff::server::ChatServer;

#[derive(Debug, Parser)]
#[command(name = "skiffd")]
#[command(about = "Chat/messaging server with challenge-response authentication")]
struct SkiffdCli {
    #[command(subcommand)]
    command: SkiffdCommand,
}

#[derive(Debug, Subcommand)]
enum SkiffdCommand {
    /// Run the server
    Run {
        /// Listen address (host:port)
        #[arg(short, long, default_value = "0.0.0.0:7670")]
        listen: String,

        /// Directory database path
        #[arg(short, long, default_value = "skiff.db")]
        database: PathBuf,

        /// Maximum concurrent connections
        #[arg(long, default_value = "64")]
        max_connections: usize,

        /// Poll timeout in milliseconds
        #[arg(long, default_value = "500")]
        poll_timeout_ms: u64,

        /// Handshake digest algorithm (sha256 or sha512)
        #[arg(long, default_value = "sha256")]
        digest: String,
    },

    /// Provision a user in the directory database
    AddUser {
        /// Directory database path
        #[arg(short, long, default_value = "skiff.db")]
        database: PathBuf,

        identity: String,
        password: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = SkiffdCli::parse();

    match cli.command {
        SkiffdCommand::Run {
            listen,
            database,
            max_connections,
            poll_timeout_ms,
            digest,
        } => {
            let directory = Arc::new(
                SqliteDirectory::open(&database).context("failed to open directory database")?,
            );
            let config = ServerConfig::new(&listen)?
                .with_max_connections(max_connections)?
                .with_poll_timeout(Duration::from_millis(poll_timeout_ms))?
                .with_digest(&digest)?;

            let mut server = ChatServer::bind(config, directory).await?;

            // Log registry changes in place of an attached admin console.
            if let Some(mut events) = server.take_events() {
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        tracing::info!(?event, "registry changed");
                    }
                });
            }

            let shutdown = server.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received");
                    let _ = shutdown.shutdown();
                }
            });

            server.run().await
        }

        SkiffdCommand::AddUser {
            database,
            identity,
            password,
        } => {
            let directory =
                SqliteDirectory::open(&database).context("failed to open directory database")?;
            directory.register_user(&identity, &derive_credential_secret(&identity, &password))?;
            println!("registered '{identity}'");
            Ok(())
        }
    }
}
