//! Gateway service frontend
//!
//! Resolves listeners, runs producers under panic containment and bridges
//! them to outbound streams.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::eventsource::{EventSource, ValidEventSource};
use crate::listener::{Listener, ListenerRegistry};
use crate::secrets::{EnvSecretStore, SecretStore};
use crate::session::{SessionHandle, StreamSession};
use crate::stream::{EventStream, EventStreamAdapter};
use crate::webhook::WebhookRouteManager;
use crate::{Error, Result};

/// Entry point for validate / start / stop calls
pub struct GatewayService {
    registry: ListenerRegistry,
    routes: WebhookRouteManager,
    /// Stop signal per running event source id
    sessions: DashMap<String, CancellationToken>,
    buffer_size: usize,
    release_timeout: Duration,
}

impl GatewayService {
    /// Create a service over an explicit registry and route manager
    pub fn new(config: &Config, registry: ListenerRegistry, routes: WebhookRouteManager) -> Self {
        Self {
            registry,
            routes,
            sessions: DashMap::new(),
            buffer_size: config.streaming.buffer_size,
            release_timeout: config.server.shutdown_timeout,
        }
    }

    /// Service with the built-in listeners, secrets read from the environment
    pub fn from_config(config: &Config) -> Self {
        let routes = WebhookRouteManager::new(config.webhook.clone());
        let secrets: Arc<dyn SecretStore> =
            Arc::new(EnvSecretStore::new(config.secrets.env_prefix.clone()));
        let registry = ListenerRegistry::builtin(routes.clone(), secrets);
        Self::new(config, registry, routes)
    }

    /// Listener registry
    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Webhook route manager
    pub fn routes(&self) -> &WebhookRouteManager {
        &self.routes
    }

    /// Validate an event source configuration
    ///
    /// Unknown types and unparseable blobs are invalid verdicts, never errors.
    pub fn validate_event_source(&self, source: &EventSource) -> ValidEventSource {
        let verdict = match self.registry.get(&source.source_type) {
            Ok(listener) => listener.validate(&source.value),
            Err(e) => ValidEventSource::invalid(e.to_string()),
        };
        debug!(
            event_source = %source.name,
            source_type = %source.source_type,
            valid = verdict.is_valid,
            "Validated event source"
        );
        verdict
    }

    /// Run an event source until its stream ends; returns the terminal result
    ///
    /// Ends cleanly when the client goes away or [`stop_event_source`] is
    /// called, and with the first error otherwise. The producer has released
    /// its resources (or timed out doing so) by the time this returns.
    ///
    /// [`stop_event_source`]: Self::stop_event_source
    pub async fn start_event_source<S: EventStream>(
        &self,
        source: EventSource,
        stream: S,
    ) -> Result<()> {
        let listener = self.registry.get(&source.source_type)?;
        let verdict = listener.validate(&source.value);
        if !verdict.is_valid {
            return Err(Error::InvalidEventSource(verdict.reason));
        }

        let stop = CancellationToken::new();
        match self.sessions.entry(source.id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyRunning(source.name)),
            Entry::Vacant(slot) => {
                slot.insert(stop.clone());
            }
        }
        let _running = RunningGuard {
            sessions: &self.sessions,
            id: source.id.clone(),
        };

        info!(
            event_source = %source.name,
            source_type = %source.source_type,
            id = %source.id,
            "Starting event source"
        );

        let (handle, session) = StreamSession::open(self.buffer_size);
        let producer = spawn_contained(listener, source.clone(), handle);
        let result = EventStreamAdapter::new(source.name.clone(), stream, session, stop)
            .run()
            .await;

        match tokio::time::timeout(self.release_timeout, producer).await {
            Ok(_) => debug!(event_source = %source.name, "Producer released"),
            Err(_) => warn!(
                event_source = %source.name,
                timeout = ?self.release_timeout,
                "Producer did not stop in time"
            ),
        }
        result
    }

    /// Ask a running event source to stop; `false` if it is not running
    pub fn stop_event_source(&self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(stop) => {
                info!(id = %id, "Stop requested");
                stop.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of running event sources
    pub fn running(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop every event source and release every webhook port
    pub async fn shutdown(&self) {
        for entry in &self.sessions {
            entry.value().cancel();
        }
        self.routes.shutdown().await;
        info!("Gateway service stopped");
    }
}

/// Removes a session from the running set when its start call ends
struct RunningGuard<'a> {
    sessions: &'a DashMap<String, CancellationToken>,
    id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

/// Run `start` in its own task; errors and panics become the session's terminal error
fn spawn_contained(
    listener: Arc<dyn Listener>,
    source: EventSource,
    handle: SessionHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = source.name.clone();
        let producer_handle = handle.clone();
        let task = tokio::spawn(async move { listener.start(source, producer_handle).await });

        match task.await {
            Ok(Ok(())) => debug!(event_source = %name, "Producer finished"),
            Ok(Err(e)) => {
                debug!(event_source = %name, error = %e, "Producer failed");
                handle.fail(e);
            }
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic().as_ref());
                error!(event_source = %name, panic = %message, "Producer panicked");
                handle.fail(Error::ProducerPanicked { name, message });
            }
            Err(_) => debug!(event_source = %name, "Producer cancelled"),
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
