// ABOUTME: Server bootstrap for the Coderun binary
// ABOUTME: Wires the store, Docker orchestrator, reaper and HTTP router from configuration

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use coderun_api::{create_router, ApiState};
use coderun_executions::ExecutionService;
use coderun_sandbox::{DockerJobOrchestrator, JobOrchestrator, JobReaper, LanguageRegistry};
use coderun_storage::SqliteExecutionStore;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod config;

pub use config::{Config, ConfigError};

/// Load the language table named by the config, or the embedded one
pub fn load_languages(config: &Config) -> anyhow::Result<LanguageRegistry> {
    let registry = match &config.languages_file {
        Some(path) => LanguageRegistry::from_file(path)
            .with_context(|| format!("Failed to load languages from {}", path.display()))?,
        None => LanguageRegistry::new().context("Failed to load embedded languages")?,
    };
    Ok(registry)
}

/// CORS layer for the configured origin list; `*` allows any origin.
pub fn cors_layer(cors_origin: &str) -> anyhow::Result<CorsLayer> {
    let allow_origin = if cors_origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        let origins = cors_origin
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(|origin| {
                origin
                    .parse::<HeaderValue>()
                    .with_context(|| format!("Invalid CORS origin: {}", origin))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any))
}

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let store = SqliteExecutionStore::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    store
        .migrate()
        .await
        .context("Failed to apply database migrations")?;

    let languages = load_languages(&config)?;
    info!("Supported languages: {}", languages.supported_ids().join(", "));

    let orchestrator = Arc::new(
        DockerJobOrchestrator::with_pull_timeout(config.pull_timeout)
            .context("Failed to create Docker client")?,
    );
    // Submissions fail with 503 until the daemon answers
    if let Err(e) = orchestrator.ping().await {
        warn!("Docker daemon is not reachable yet: {}", e);
    }

    let reaper = config.reaper_interval.map(|interval| {
        info!(
            "Reaping finished jobs older than {}h every {}s",
            config.reaper_max_age.num_hours(),
            interval.as_secs()
        );
        JobReaper::new(orchestrator.clone(), interval, config.reaper_max_age).spawn()
    });

    let service = ExecutionService::new(
        Arc::new(store),
        orchestrator,
        Arc::new(languages),
        config.execution_settings(),
    );

    let app = create_router(ApiState::new(Arc::new(service)))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origin)?);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!("Coderun listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = reaper {
        handle.abort();
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_accepts_wildcard_and_lists() {
        assert!(cors_layer("*").is_ok());
        assert!(cors_layer("http://localhost:3000, https://coderun.dev").is_ok());
    }

    #[test]
    fn test_cors_layer_rejects_invalid_origin() {
        assert!(cors_layer("http://bad\norigin").is_err());
    }

    #[test]
    fn test_load_embedded_languages() {
        let config = Config::from_lookup(|_| None).unwrap();
        let registry = load_languages(&config).unwrap();
        assert!(registry.is_supported("python"));
    }

    #[test]
    fn test_load_missing_languages_file_fails() {
        let config = Config::from_lookup(|name| {
            (name == "CODERUN_LANGUAGES_FILE").then(|| "/nonexistent/languages.json".to_string())
        })
        .unwrap();
        let error = load_languages(&config).unwrap_err();
        assert!(error.to_string().contains("/nonexistent/languages.json"));
    }
}
