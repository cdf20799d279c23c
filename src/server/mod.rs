//! HTTP surface: OpenAI-compatible chat completions over the pipeline invoker.

mod api;
mod auth;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, middleware, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::BridgeConfig;
use crate::service::{OpenSpgProjectClient, PipelineInvoker, PipelineRegistry, ProjectCatalog};

pub use api::{ApiError, AppState, DEFAULT_MODEL_ID, MODEL_OWNER, SharedState, health_check};

/// Base path of the OpenAI-compatible routes for a servlet prefix.
pub fn openai_base_path(servlet_prefix: &str) -> String {
    format!("{}/openspg/v1", servlet_prefix)
}

/// Build the full application router. `servlet_prefix` is either empty or
/// of the form `/name`.
pub fn build_router(state: SharedState, servlet_prefix: &str) -> Router {
    let openai = api::openai_router().route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_api_key,
    ));

    Router::new()
        .route("/health", get(health_check))
        .nest(&openai_base_path(servlet_prefix), openai)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Assemble shared state from configuration, loading the project catalog.
pub async fn build_state(config: &BridgeConfig) -> Result<SharedState> {
    let api_keys: HashSet<String> = config.server.resolved_api_keys()?.into_iter().collect();
    if api_keys.is_empty() {
        tracing::warn!("No API keys configured; authentication is disabled");
    }

    let projects = Arc::new(
        OpenSpgProjectClient::new(&config.openspg.service_url)
            .context("Failed to create project service client")?,
    );
    let catalog = Arc::new(ProjectCatalog::new());
    if let Err(e) = catalog.refresh(projects.as_ref()).await {
        tracing::warn!(
            service = %config.openspg.service_url,
            error = %e,
            "Failed to load project catalog; project names will not resolve until it loads"
        );
    }

    let registry = Arc::new(PipelineRegistry::with_builtins());
    tracing::info!(pipelines = ?registry.names(), "Registered pipeline types");

    let invoker = PipelineInvoker::new(projects, catalog, registry)
        .with_upstream(config.upstream.clone())
        .with_poll_interval(config.stream.poll_interval());

    Ok(Arc::new(AppState {
        invoker,
        api_keys,
        model_name: config.stream.model_name.clone(),
        keep_alive: config.stream.keep_alive(),
    }))
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: BridgeConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = build_state(&config).await?;
    let prefix = config.server.servlet_prefix();
    let mut app = build_router(state, &prefix);

    if config.server.cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        base = %openai_base_path(&prefix),
        "kag-bridge listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn start_server(config: BridgeConfig) -> Result<()> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    serve(listener, config, shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutting down..."),
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}
