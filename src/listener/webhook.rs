//! Generic webhook listener
//!
//! Forwards the raw request body of every matched request. Requests can be
//! authenticated with an HMAC-SHA256 signature when a secret is configured.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Listener, parse_config};
use crate::eventsource::EventSource;
use crate::secrets::{SecretSelector, SecretStore};
use crate::session::SessionHandle;
use crate::webhook::{
    HmacSha256Verifier, Route, WebhookContext, WebhookReply, WebhookRequest, WebhookRouteManager,
};
use crate::Result;

/// Generic webhook event source configuration
///
/// ```yaml
/// endpoint: /deploy
/// port: 12000
/// method: POST
/// secret: { name: deploy-hook, key: hmac }
/// signatureHeader: X-Signature
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventSourceConfig {
    /// Endpoint declaration
    #[serde(flatten)]
    pub webhook: WebhookContext,
    /// HMAC secret; requests are unsigned when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretSelector>,
    /// Header carrying the signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_header: Option<String>,
}

/// Register `route`, serve it until the session ends, then release it
pub(crate) async fn serve_route(
    routes: &WebhookRouteManager,
    route: Route,
    event_source: &str,
    session: &SessionHandle,
) -> Result<()> {
    let registration = routes.register(route).await?;
    info!(event_source = %event_source, route = %registration.key(), "Serving webhook");

    session.done().await;

    registration.release().await;
    info!(event_source = %event_source, "Webhook released");
    Ok(())
}

/// Resolve an optional secret; a missing value is a degraded state
pub(crate) fn optional_secret(
    secrets: &dyn SecretStore,
    selector: Option<&SecretSelector>,
) -> Result<Option<String>> {
    match selector {
        Some(selector) => secrets.get(selector),
        None => Ok(None),
    }
}

/// Listener for `webhook` event sources
pub struct WebhookListener {
    routes: WebhookRouteManager,
    secrets: Arc<dyn SecretStore>,
}

impl WebhookListener {
    /// Create the listener
    pub fn new(routes: WebhookRouteManager, secrets: Arc<dyn SecretStore>) -> Self {
        Self { routes, secrets }
    }
}

#[async_trait]
impl Listener for WebhookListener {
    fn source_type(&self) -> &'static str {
        "webhook"
    }

    fn check(&self, value: &[u8]) -> Result<()> {
        parse_config::<WebhookEventSourceConfig>(value)?
            .webhook
            .validate()
    }

    async fn start(&self, source: EventSource, session: SessionHandle) -> Result<()> {
        let config: WebhookEventSourceConfig = parse_config(&source.value)?;
        let key = config.webhook.route_key()?;
        let secret = optional_secret(self.secrets.as_ref(), config.secret.as_ref())?;

        let handler = Arc::new(|request: &WebhookRequest| -> Result<WebhookReply> {
            Ok(WebhookReply::event(request.body.clone()))
        });
        let verifier = Arc::new(HmacSha256Verifier::new(
            config
                .signature_header
                .as_deref()
                .unwrap_or(HmacSha256Verifier::DEFAULT_HEADER),
        ));
        let route = Route::new(key, source.name.clone(), handler, session.data_sender())
            .with_verification(verifier, secret);

        serve_route(&self.routes, route, &source.name, &session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::secrets::MemorySecretStore;

    fn listener() -> WebhookListener {
        WebhookListener::new(
            WebhookRouteManager::new(WebhookConfig::default()),
            Arc::new(MemorySecretStore::new()),
        )
    }

    #[test]
    fn test_validation() {
        let listener = listener();
        assert!(
            listener
                .validate(b"endpoint: /hook\nport: \"12000\"\nmethod: POST\n")
                .is_valid
        );

        let verdict = listener.validate(b"port: 12000\nmethod: POST\n");
        assert!(!verdict.is_valid);
        assert_eq!(verdict.reason, "endpoint can't be empty");

        let verdict = listener.validate(b"endpoint: /hook\nmethod: POST\n");
        assert_eq!(verdict.reason, "port can't be empty");
    }

    #[test]
    fn test_secret_selector_parsed() {
        let config: WebhookEventSourceConfig = parse_config(
            b"endpoint: /hook\nport: 1\nmethod: POST\nsecret: {name: hook, key: hmac}\nsignatureHeader: X-Sig\n",
        )
        .unwrap();
        assert_eq!(config.secret, Some(SecretSelector::new("hook", "hmac")));
        assert_eq!(config.signature_header.as_deref(), Some("X-Sig"));
        assert_eq!(config.webhook.endpoint, "/hook");
    }
}
