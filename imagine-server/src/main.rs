use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use imagine_core::{ModelCatalog, ModelRegistry};
use imagine_diffusion::{DeviceMap, DiffusionFactory};
use imagine_server::{router, AppState, GenerationServer, DEFAULT_MAX_CONCURRENT_GENERATIONS};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Imagine multi-model image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Serve only this model
    #[arg(long, env = "IMAGINE_MODEL")]
    model: Option<String>,

    /// JSON model catalog replacing the built-in one
    #[arg(long, env = "IMAGINE_CATALOG")]
    catalog: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Bearer token required on every request
    #[arg(long, env = "VALID_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Generations allowed to run at once
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_GENERATIONS)]
    max_concurrent_generations: usize,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_catalog(args: &Args) -> Result<ModelCatalog> {
    let catalog = match &args.catalog {
        Some(path) => ModelCatalog::from_file(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?,
        None => ModelCatalog::builtin(),
    };
    match &args.model {
        Some(model) => Ok(catalog.only(model)?),
        None => Ok(catalog),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "imagine_server={level},imagine_core={level},imagine_diffusion={level},tower_http={level}",
                    level = args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let catalog = load_catalog(&args)?;
    let factory = DiffusionFactory::new(DeviceMap::new(args.cpu))?;
    let registry = ModelRegistry::new(catalog, Arc::new(factory));
    let server = GenerationServer::new(registry, args.max_concurrent_generations);

    let token = args.token.filter(|token| !token.is_empty());
    if token.is_none() {
        warn!("No VALID_TOKEN configured, authentication is disabled");
    }
    let state = AppState::new(server, token);

    let loader = state.server.clone();
    tokio::spawn(async move {
        for (name, status) in loader.registry().load_all().await {
            match status.error {
                None => info!(model = %name, "Model ready"),
                Some(err) => warn!(model = %name, "Model unavailable: {err}"),
            }
        }
    });

    let app = router(state);
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
