//! Event source listeners
//!
//! Every signal variant implements [`Listener`]: a pure `check` of its
//! configuration blob and a `start` that produces raw event bytes into a
//! session until the session ends. Variants are resolved by type string
//! through a [`ListenerRegistry`] built once at startup.

pub mod file;
pub mod gitlab;
pub mod poll;
pub mod slack;
pub mod webhook;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::eventsource::{EventSource, ValidEventSource};
use crate::secrets::SecretStore;
use crate::session::SessionHandle;
use crate::webhook::WebhookRouteManager;
use crate::{Error, Result};

/// Contract shared by every signal variant
#[async_trait]
pub trait Listener: Send + Sync {
    /// Type string this listener is registered under
    fn source_type(&self) -> &'static str;

    /// Parse and check a configuration blob without touching shared state
    fn check(&self, value: &[u8]) -> Result<()>;

    /// Validate a configuration blob into a verdict
    fn validate(&self, value: &[u8]) -> ValidEventSource {
        match self.check(value) {
            Ok(()) => ValidEventSource::valid(),
            Err(e) => ValidEventSource::invalid(reason(&e)),
        }
    }

    /// Produce events into `session` until it is done
    ///
    /// Returning an error terminates the session with it. Every resource
    /// acquired here must be released before returning.
    async fn start(&self, source: EventSource, session: SessionHandle) -> Result<()>;
}

/// Human-readable reason for a failed check
fn reason(error: &Error) -> String {
    match error {
        Error::InvalidEventSource(reason) => reason.clone(),
        other => other.to_string(),
    }
}

/// Parse a YAML (or JSON) configuration blob
pub(crate) fn parse_config<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    if value.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::InvalidEventSource(
            "event source can't be empty".to_string(),
        ));
    }
    serde_yaml::from_slice(value).map_err(|e| Error::InvalidEventSource(e.to_string()))
}

/// Listener lookup by declared type
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: HashMap<&'static str, Arc<dyn Listener>>,
}

impl ListenerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in variant
    #[must_use]
    pub fn builtin(routes: WebhookRouteManager, secrets: Arc<dyn SecretStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(file::FileListener::new()));
        registry.register(Arc::new(poll::PollListener::new()));
        registry.register(Arc::new(webhook::WebhookListener::new(
            routes.clone(),
            Arc::clone(&secrets),
        )));
        registry.register(Arc::new(slack::SlackListener::new(
            routes.clone(),
            Arc::clone(&secrets),
        )));
        registry.register(Arc::new(gitlab::GitlabListener::new(routes, secrets)));
        registry
    }

    /// Add or replace a listener
    pub fn register(&mut self, listener: Arc<dyn Listener>) {
        tracing::debug!(source_type = listener.source_type(), "Registered listener");
        self.listeners.insert(listener.source_type(), listener);
    }

    /// Resolve the listener for `source_type`
    pub fn get(&self, source_type: &str) -> Result<Arc<dyn Listener>> {
        self.listeners
            .get(source_type)
            .cloned()
            .ok_or_else(|| Error::UnknownEventSourceType(source_type.to_string()))
    }

    /// Registered type strings, sorted
    pub fn types(&self) -> Vec<&'static str> {
        let sorted: BTreeMap<_, _> = self.listeners.iter().collect();
        sorted.into_keys().copied().collect()
    }
}
