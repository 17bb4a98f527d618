//! Gitlab project hook listener
//!
//! Registering the hook on the Gitlab side is done out of band; this listener
//! serves the endpoint the hook points at and forwards each delivery body.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::webhook::{optional_secret, serve_route};
use super::{Listener, parse_config};
use crate::eventsource::EventSource;
use crate::secrets::{SecretSelector, SecretStore};
use crate::session::SessionHandle;
use crate::webhook::{
    Route, TokenVerifier, WebhookContext, WebhookReply, WebhookRequest, WebhookRouteManager,
};
use crate::{Error, Result};

/// Gitlab event source configuration
///
/// ```yaml
/// projectId: "1001"
/// event: PushEvents
/// gitlabBaseUrl: https://gitlab.com
/// accessToken: { name: gitlab, key: access-token }
/// secretToken: { name: gitlab, key: hook-token }   # optional
/// webhook: { endpoint: /push, port: 12000, method: POST }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitlabEventSourceConfig {
    /// Endpoint declaration
    #[serde(default)]
    pub webhook: Option<WebhookContext>,
    /// Project the hook belongs to
    #[serde(default)]
    pub project_id: String,
    /// Hook event, e.g. `PushEvents`
    #[serde(default)]
    pub event: String,
    /// Gitlab instance
    #[serde(default, rename = "gitlabBaseUrl")]
    pub gitlab_base_url: String,
    /// API token used to manage the hook
    #[serde(default)]
    pub access_token: Option<SecretSelector>,
    /// Shared token Gitlab sends in `X-Gitlab-Token`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<SecretSelector>,
    /// Whether Gitlab should verify TLS when delivering
    #[serde(default, rename = "enableSSLVerification")]
    pub enable_ssl_verification: bool,
}

impl GitlabEventSourceConfig {
    fn validate(&self) -> Result<&WebhookContext> {
        let invalid = |reason: &str| Error::InvalidEventSource(reason.to_string());

        if self.project_id.is_empty() {
            return Err(invalid("project id can't be empty"));
        }
        if self.event.is_empty() {
            return Err(invalid("event type can't be empty"));
        }
        if self.gitlab_base_url.is_empty() {
            return Err(invalid("gitlab base url can't be empty"));
        }
        url::Url::parse(&self.gitlab_base_url)
            .map_err(|e| Error::InvalidEventSource(format!("invalid gitlab base url: {e}")))?;
        if self.access_token.is_none() {
            return Err(invalid("access token can't be nil"));
        }
        let webhook = self
            .webhook
            .as_ref()
            .ok_or_else(|| invalid("webhook context can't be nil"))?;
        webhook.validate()?;
        Ok(webhook)
    }
}

fn forward_json(request: &WebhookRequest) -> Result<WebhookReply> {
    serde_json::from_slice::<serde_json::Value>(&request.body)
        .map_err(|e| Error::InvalidRequest(format!("hook body is not JSON: {e}")))?;
    Ok(WebhookReply::event(request.body.clone()))
}

/// Listener for `gitlab` event sources
pub struct GitlabListener {
    routes: WebhookRouteManager,
    secrets: Arc<dyn SecretStore>,
}

impl GitlabListener {
    /// Create the listener
    pub fn new(routes: WebhookRouteManager, secrets: Arc<dyn SecretStore>) -> Self {
        Self { routes, secrets }
    }
}

#[async_trait]
impl Listener for GitlabListener {
    fn source_type(&self) -> &'static str {
        "gitlab"
    }

    fn check(&self, value: &[u8]) -> Result<()> {
        parse_config::<GitlabEventSourceConfig>(value)?
            .validate()
            .map(|_| ())
    }

    async fn start(&self, source: EventSource, session: SessionHandle) -> Result<()> {
        let config: GitlabEventSourceConfig = parse_config(&source.value)?;
        let key = config.validate()?.route_key()?;

        let secret = optional_secret(self.secrets.as_ref(), config.secret_token.as_ref())?;
        if secret.is_none() {
            warn!(event_source = %source.name, "No secret token, Gitlab deliveries are not authenticated");
        }
        info!(
            event_source = %source.name,
            project_id = %config.project_id,
            event = %config.event,
            "Serving Gitlab hook"
        );

        let route = Route::new(
            key,
            source.name.clone(),
            Arc::new(forward_json),
            session.data_sender(),
        )
        .with_verification(
            Arc::new(TokenVerifier::new(TokenVerifier::GITLAB_HEADER)),
            secret,
        );

        serve_route(&self.routes, route, &source.name, &session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::secrets::MemorySecretStore;

    const VALID: &str = r#"
projectId: "1001"
event: PushEvents
gitlabBaseUrl: https://gitlab.example.com
accessToken: { name: gitlab, key: access-token }
webhook: { endpoint: /push, port: "12000", method: POST }
"#;

    fn listener() -> GitlabListener {
        GitlabListener::new(
            WebhookRouteManager::new(WebhookConfig::default()),
            Arc::new(MemorySecretStore::new()),
        )
    }

    #[test]
    fn test_valid_config() {
        let verdict = listener().validate(VALID.as_bytes());
        assert!(verdict.is_valid, "{}", verdict.reason);
    }

    #[test]
    fn test_missing_fields_in_order() {
        let cases = [
            ("projectId: \"1001\"\n", "event type can't be empty"),
            ("event: PushEvents\n", "project id can't be empty"),
            (
                "projectId: \"1\"\nevent: PushEvents\n",
                "gitlab base url can't be empty",
            ),
            (
                "projectId: \"1\"\nevent: PushEvents\ngitlabBaseUrl: https://gitlab.com\n",
                "access token can't be nil",
            ),
            (
                "projectId: \"1\"\nevent: PushEvents\ngitlabBaseUrl: https://gitlab.com\naccessToken: {name: a, key: b}\n",
                "webhook context can't be nil",
            ),
        ];
        let listener = listener();
        for (config, expected) in cases {
            let verdict = listener.validate(config.as_bytes());
            assert!(!verdict.is_valid);
            assert_eq!(verdict.reason, expected);
        }
    }

    #[test]
    fn test_forward_requires_json() {
        let request = WebhookRequest {
            method: axum::http::Method::POST,
            path: "/push".into(),
            headers: axum::http::HeaderMap::new(),
            body: bytes::Bytes::from_static(b"not json"),
        };
        assert!(matches!(
            forward_json(&request).unwrap_err(),
            Error::InvalidRequest(_)
        ));
    }
}
