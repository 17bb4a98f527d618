//! Slack Events API and interactivity listener

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::webhook::{optional_secret, serve_route};
use super::{Listener, parse_config};
use crate::eventsource::EventSource;
use crate::secrets::{SecretSelector, SecretStore};
use crate::session::SessionHandle;
use crate::webhook::{
    Route, RouteHandler, SlackSignatureVerifier, WebhookContext, WebhookReply, WebhookRequest,
    WebhookRouteManager,
};
use crate::{Error, Result};

/// Slack event source configuration
///
/// ```yaml
/// token: { name: slack, key: verification-token }
/// signingSecret: { name: slack, key: signing-secret }
/// webhook: { endpoint: /slack, port: 12000, method: POST }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackEventSourceConfig {
    /// Verification token sent in Events API payloads
    #[serde(default)]
    pub token: Option<SecretSelector>,
    /// Signing secret for `X-Slack-Signature`; unsigned when absent
    #[serde(default)]
    pub signing_secret: Option<SecretSelector>,
    /// Endpoint declaration
    #[serde(default)]
    pub webhook: Option<WebhookContext>,
}

impl SlackEventSourceConfig {
    fn validate(&self) -> Result<&WebhookContext> {
        if self.token.is_none() {
            return Err(Error::InvalidEventSource(
                "token can't be empty".to_string(),
            ));
        }
        let webhook = self.webhook.as_ref().ok_or_else(|| {
            Error::InvalidEventSource("webhook can't be empty".to_string())
        })?;
        webhook.validate()?;
        Ok(webhook)
    }
}

#[derive(Debug, Deserialize)]
struct EventsApiEnvelope {
    #[serde(default)]
    token: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    event: Option<Value>,
}

/// Turns Slack requests into events
///
/// * `application/x-www-form-urlencoded` interactions forward the `payload` field
/// * `url_verification` echoes the challenge and produces no event
/// * `event_callback` forwards the inner event
struct SlackHandler {
    token: String,
}

impl SlackHandler {
    fn interaction(body: &[u8]) -> Result<WebhookReply> {
        let payload = url::form_urlencoded::parse(body)
            .find(|(key, _)| key == "payload")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| Error::InvalidRequest("missing payload field".to_string()))?;
        let interaction: Value = serde_json::from_str(&payload)
            .map_err(|e| Error::InvalidRequest(format!("failed to parse interaction: {e}")))?;
        Ok(WebhookReply::event(serde_json::to_vec(&interaction)?))
    }

    fn event(&self, body: &[u8]) -> Result<WebhookReply> {
        let envelope: EventsApiEnvelope = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidRequest(format!("failed to parse event: {e}")))?;

        if !bool::from(envelope.token.as_bytes().ct_eq(self.token.as_bytes())) {
            return Err(Error::Verification("verification token mismatch".to_string()));
        }

        match envelope.kind.as_str() {
            "url_verification" => {
                let challenge = envelope.challenge.ok_or_else(|| {
                    Error::InvalidRequest("url_verification without challenge".to_string())
                })?;
                Ok(WebhookReply::respond(challenge))
            }
            "event_callback" => match envelope.event {
                Some(event) => Ok(WebhookReply::event(serde_json::to_vec(&event)?)),
                None => Err(Error::InvalidRequest("event_callback without event".to_string())),
            },
            other => {
                debug!(kind = %other, "Ignoring Slack request");
                Ok(WebhookReply::ignore())
            }
        }
    }
}

impl RouteHandler for SlackHandler {
    fn transform(&self, request: &WebhookRequest) -> Result<WebhookReply> {
        let form = request
            .headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        if form {
            Self::interaction(&request.body)
        } else {
            self.event(&request.body)
        }
    }
}

/// Listener for `slack` event sources
pub struct SlackListener {
    routes: WebhookRouteManager,
    secrets: Arc<dyn SecretStore>,
}

impl SlackListener {
    /// Create the listener
    pub fn new(routes: WebhookRouteManager, secrets: Arc<dyn SecretStore>) -> Self {
        Self { routes, secrets }
    }
}

#[async_trait]
impl Listener for SlackListener {
    fn source_type(&self) -> &'static str {
        "slack"
    }

    fn check(&self, value: &[u8]) -> Result<()> {
        parse_config::<SlackEventSourceConfig>(value)?
            .validate()
            .map(|_| ())
    }

    async fn start(&self, source: EventSource, session: SessionHandle) -> Result<()> {
        let config: SlackEventSourceConfig = parse_config(&source.value)?;
        let key = config.validate()?.route_key()?;

        let token_selector = config
            .token
            .as_ref()
            .ok_or_else(|| Error::InvalidEventSource("token can't be empty".to_string()))?;
        let token = self.secrets.require(token_selector)?;

        let signing_secret =
            optional_secret(self.secrets.as_ref(), config.signing_secret.as_ref())?;
        if signing_secret.is_none() {
            warn!(event_source = %source.name, "Signing secret not provided, signature not validated");
        }

        let route = Route::new(
            key,
            source.name.clone(),
            Arc::new(SlackHandler { token }),
            session.data_sender(),
        )
        .with_verification(Arc::new(SlackSignatureVerifier::default()), signing_secret);

        serve_route(&self.routes, route, &source.name, &session).await
    }
}
