// =============================================================================
// Aurora Market Sim — Main Entry Point
// =============================================================================
//
// Boots the HTTP/WS surface over an `InstanceController`. No market instance
// exists until a client posts a template and creates one — this process is
// just the host.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod clock;
mod config;
mod controller;
mod entities;
mod errors;
mod factory;
mod ids;
mod lifecycle;
mod push_bus;
mod registry;
mod snapshot;
mod tick_loop;
mod timeseries;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::rest::AppState;
use crate::config::EngineConfig;
use crate::controller::InstanceController;
use crate::factory::{FactoryConfig, InMemoryTemplateStore, InstanceFactory, TemplateStore};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-market-sim starting up");

    let config_path = PathBuf::from(std::env::var("AURORA_CONFIG_PATH").unwrap_or_else(|_| "engine_config.json".to_string()));
    let config = match EngineConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load engine config, falling back to defaults");
            EngineConfig::default()
        }
    };
    info!(?config, "engine config loaded");

    let template_store: Arc<dyn TemplateStore> = Arc::new(InMemoryTemplateStore::new());
    let factory_config = FactoryConfig {
        reading_templates_timeout: std::time::Duration::from_secs(config.reading_templates_timeout_secs),
        creating_objects_timeout: std::time::Duration::from_secs(config.creating_objects_timeout_secs),
        error_threshold: config.error_threshold,
        progress_ttl: std::time::Duration::from_secs(config.progress_ttl_hours * 3600),
    };
    let factory = Arc::new(InstanceFactory::with_config(Arc::clone(&template_store), factory_config));
    let controller = Arc::new(InstanceController::new(factory));

    let state = Arc::new(AppState {
        controller: Arc::clone(&controller),
        template_store: Arc::clone(&template_store),
    });

    let app = api::rest::router(state);

    let bind_addr = std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "HTTP/WS server listening");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    info!("stopping all instances");
    for summary in controller.list_instances(None) {
        if let Err(e) = controller.delete_instance(&summary.instance_id, None).await {
            error!(instance_id = %summary.instance_id, error = %e, "failed to stop instance during shutdown");
        }
    }

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "failed to persist engine config on shutdown");
    }

    info!("aurora-market-sim shut down cleanly");
}
