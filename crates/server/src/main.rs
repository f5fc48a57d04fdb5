use std::sync::Arc;

use clap::{Parser, Subcommand};
use rollout_cache_core::{RolloutStore, SpeculationConfig};

use rollout_cache_server::api::{self, AppState};
use rollout_cache_server::config::ServerConfig;
use rollout_cache_server::logging;
use rollout_cache_server::shutdown::shutdown_signal;

#[derive(Parser)]
#[command(name = "rollout-cache-server", about = "Shared-memory rollout cache server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the shared-memory arena and serve cache uploads
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "::")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value_t = rollout_cache_server::config::DEFAULT_PORT)]
        port: u16,

        /// Name of the shared-memory region
        #[arg(long, default_value = "SUFFIX_CACHE")]
        shm_name: String,

        /// Shared-memory region size in GiB
        #[arg(long, default_value_t = 500)]
        shm_size_gb: usize,

        /// Registry capacity (distinct prompt fingerprints)
        #[arg(long, default_value_t = 65_536)]
        registry_slots: usize,

        /// Trailing prompt tokens re-injected before each response
        #[arg(long, default_value_t = 5)]
        prefix_reinjection: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            host,
            port,
            shm_name,
            shm_size_gb,
            registry_slots,
            prefix_reinjection,
        } => {
            let config = ServerConfig {
                host,
                port,
                shm_name,
                shm_size_bytes: shm_size_gb * 1024 * 1024 * 1024,
                registry_slots,
            };
            let spec = SpeculationConfig {
                prefix_reinjection,
                ..Default::default()
            };
            serve(config, spec).await
        }
    }
}

async fn serve(config: ServerConfig, spec: SpeculationConfig) -> anyhow::Result<()> {
    let store = Arc::new(RolloutStore::create(&config.arena_config(), spec)?);
    let router = api::create_router(AppState::new(store.clone()));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, shm = %config.shm_name, "rollout cache server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped, releasing shared memory");
    drop(store);
    Ok(())
}
