/*
 * 5D Labs Countermeasure - Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Controller Service - watches `CounterMeasure` and `PrometheusSource` resources
//!
//! - Polls every deployed `PrometheusSource` for active alerts
//! - Runs the remediation actions of the `CounterMeasure` policies listening for them
//! - Serves health, readiness and Prometheus metrics endpoints

use anyhow::Context as _;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use clap::Parser;
use countermeasure::cluster::KubeCluster;
use countermeasure::config::{ControllerConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use countermeasure::controllers::{run_controllers, Context};
use countermeasure::metrics::{self, ActionMetrics};
use countermeasure::producer::KubeSecretStore;
use countermeasure::recorder::KubeRecorder;
use countermeasure::{ActionManager, Bus, ProducerManager};
use prometheus::Registry;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "countermeasure", version, about = "Alert-driven remediation controller")]
struct Args {
    /// Path to the mounted configuration file
    #[arg(long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "COUNTERMEASURE_NAMESPACE")]
    namespace: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "COUNTERMEASURE_LOG_JSON")]
    log_json: bool,

    /// Address for the health and metrics server
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    actions: ActionManager,
    producers: Arc<ProducerManager>,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,countermeasure=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_controller_config(path: &str) -> anyhow::Result<ControllerConfig> {
    let config = match ControllerConfig::from_mounted_file(path) {
        Ok(config) => {
            info!(path = %path, "Loaded controller configuration");
            config
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to load configuration, using defaults");
            ControllerConfig::default()
        }
    };
    config.validate().context("invalid controller configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(
        "Starting Countermeasure controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_controller_config(&args.config)?;

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    let registry = Arc::new(Registry::new());
    let action_metrics = ActionMetrics::new()?;
    action_metrics.register(&registry)?;

    let bus = Bus::new(config.bus.clone());
    let bus_handle = {
        let bus = bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bus.start(cancel).await })
    };

    let recorder = Arc::new(KubeRecorder::new(client.clone(), config.reporter.clone()));
    let actions = ActionManager::new(
        bus.clone(),
        Arc::new(KubeCluster::new(client.clone())),
        recorder.clone(),
        action_metrics,
        cancel.clone(),
    );
    let producers = Arc::new(ProducerManager::new(
        bus,
        config.producer.clone(),
        Arc::new(KubeSecretStore::new(client.clone())),
        cancel.clone(),
    ));

    let context = Arc::new(Context {
        client,
        actions: actions.clone(),
        producers: producers.clone(),
        recorder,
    });
    let controller_handle = {
        let cancel = cancel.clone();
        let namespace = args.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = run_controllers(context, namespace, cancel).await {
                error!("Controller error: {}", e);
            }
        })
    };

    let state = AppState {
        registry,
        actions,
        producers,
    };
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.metrics_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.metrics_addr))?;
    info!("HTTP server listening on {}", args.metrics_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = controller_handle.await {
        error!("Controller task failed: {}", e);
    }
    if let Err(e) = bus_handle.await {
        error!("Event bus task failed: {}", e);
    }
    info!("Countermeasure controller stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "countermeasure",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "countermeasure",
        "listening": state.actions.listening(),
        "producers": state.producers.len(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match metrics::render(&state.registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
