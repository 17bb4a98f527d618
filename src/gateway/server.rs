//! Gateway RPC server

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use futures::Stream;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::service::GatewayService;
use crate::config::{Config, StreamingConfig};
use crate::eventsource::EventSource;
use crate::stream::{ChannelEventStream, StreamMessage};
use crate::{Error, Result};

/// Event gateway server
pub struct Gateway {
    config: Config,
    service: Arc<GatewayService>,
}

impl Gateway {
    /// Create a gateway with the built-in listeners
    pub fn new(config: Config) -> Self {
        let service = Arc::new(GatewayService::from_config(&config));
        Self { config, service }
    }

    /// The service behind the RPC surface
    pub fn service(&self) -> Arc<GatewayService> {
        Arc::clone(&self.service)
    }

    /// Serve until Ctrl-C / SIGTERM, then stop every event source
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind {
                port: addr.port(),
                source,
            })?;

        let app = create_router(Arc::clone(&self.service), &self.config.streaming);

        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        info!(
            types = ?self.service.registry().types(),
            webhook_host = %self.config.webhook.host,
            "Event source listeners ready"
        );

        let service = Arc::clone(&self.service);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                // Ends open streams so the server can drain
                service.shutdown().await;
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway shutdown complete");
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<GatewayService>,
    keep_alive: Duration,
    buffer_size: usize,
}

/// RPC router: validate, start (SSE), stop and health
pub fn create_router(service: Arc<GatewayService>, streaming: &StreamingConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/eventsources/validate", post(validate_handler))
        .route("/v1/eventsources/start", post(start_handler))
        .route("/v1/eventsources/{id}", delete(stop_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            service,
            keep_alive: streaming.keep_alive_interval,
            buffer_size: streaming.buffer_size,
        })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "running": state.service.running().len(),
        "webhook_routes": state.service.routes().route_count(),
    }))
}

async fn validate_handler(
    State(state): State<AppState>,
    Json(source): Json<EventSource>,
) -> impl IntoResponse {
    Json(state.service.validate_event_source(&source))
}

/// Stream events for one source as SSE
///
/// Every payload is an `event` frame; the stream ends with a single `end`
/// (clean) or `error` frame.
async fn start_handler(State(state): State<AppState>, Json(source): Json<EventSource>) -> Response {
    let verdict = state.service.validate_event_source(&source);
    if !verdict.is_valid {
        return (StatusCode::BAD_REQUEST, Json(verdict)).into_response();
    }

    let (tx, rx) = mpsc::channel(state.buffer_size.max(1));
    let terminal = tx.clone();
    let service = Arc::clone(&state.service);
    tokio::spawn(async move {
        let result = service
            .start_event_source(source, ChannelEventStream::new(tx))
            .await;
        // The client may already be gone; nothing to report then.
        let _ = terminal.send(StreamMessage::Terminated(result.err())).await;
    });

    Sse::new(event_frames(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(state.keep_alive)
                .text("ping"),
        )
        .into_response()
}

fn event_frames(
    mut rx: mpsc::Receiver<StreamMessage>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream! {
        while let Some(message) = rx.recv().await {
            match message {
                StreamMessage::Event(frame) => {
                    yield Ok::<Event, Infallible>(Event::default()
                        .event("event")
                        .data(serde_json::to_string(&frame).unwrap_or_default()));
                }
                StreamMessage::Terminated(None) => {
                    yield Ok::<Event, Infallible>(Event::default().event("end").data("{}"));
                    break;
                }
                StreamMessage::Terminated(Some(e)) => {
                    yield Ok::<Event, Infallible>(Event::default()
                        .event("error")
                        .data(json!({ "kind": e.kind(), "message": e.to_string() }).to_string()));
                    break;
                }
            }
        }
    }
}

async fn stop_handler(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.service.stop_event_source(&id) {
        StatusCode::NO_CONTENT
    } else {
        debug!(id = %id, "Stop for unknown event source");
        StatusCode::NOT_FOUND
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
