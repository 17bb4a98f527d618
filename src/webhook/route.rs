//! Webhook endpoint declarations and route registration units

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;

use super::verify::SignatureVerifier;
use crate::{Error, Result};

const KNOWN_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Endpoint declaration shared by every webhook-based event source
///
/// ```yaml
/// endpoint: /github
/// port: 12000
/// method: POST
/// url: https://hooks.example.com   # public address, optional
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookContext {
    /// URL path, must start with `/`
    #[serde(default)]
    pub endpoint: String,
    /// Port to listen on (`"12000"` and `12000` are both accepted)
    #[serde(default, deserialize_with = "port_from_str_or_int")]
    pub port: u16,
    /// HTTP method
    #[serde(default)]
    pub method: String,
    /// Externally reachable base URL of the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl WebhookContext {
    /// Check the endpoint/port/method triple
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidEventSource(reason));

        if self.endpoint.is_empty() {
            return invalid("endpoint can't be empty".to_string());
        }
        if !self.endpoint.starts_with('/') {
            return invalid(format!("endpoint {} must start with '/'", self.endpoint));
        }
        if self.port == 0 {
            return invalid("port can't be empty".to_string());
        }
        if self.method.is_empty() {
            return invalid("method can't be empty".to_string());
        }
        if !KNOWN_METHODS.contains(&self.method.to_ascii_uppercase().as_str()) {
            return invalid(format!("unknown HTTP method {}", self.method));
        }
        if let Some(url) = &self.url {
            url::Url::parse(url)
                .map_err(|e| Error::InvalidEventSource(format!("invalid url {url}: {e}")))?;
        }
        Ok(())
    }

    /// Route key for this endpoint
    pub fn route_key(&self) -> Result<RouteKey> {
        self.validate()?;
        let method = Method::from_str(&self.method.to_ascii_uppercase()).map_err(|e| {
            Error::InvalidEventSource(format!("unknown HTTP method {}: {e}", self.method))
        })?;
        Ok(RouteKey::new(self.port, self.endpoint.clone(), method))
    }
}

fn port_from_str_or_int<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) if s.trim().is_empty() => Ok(0),
        Port::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("port {s} is not a valid port number"))),
    }
}

/// Identity of a route: at most one active route per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// Listening port
    pub port: u16,
    /// URL path
    pub endpoint: String,
    /// HTTP method
    pub method: Method,
}

impl RouteKey {
    /// Create a key
    pub fn new(port: u16, endpoint: impl Into<String>, method: Method) -> Self {
        Self {
            port,
            endpoint: endpoint.into(),
            method,
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :{}{}", self.method, self.port, self.endpoint)
    }
}

/// A matched inbound request, as seen by route handlers and verifiers
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Request method
    pub method: Method,
    /// Request path
    pub path: String,
    /// Raw headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Bytes,
}

/// What a handler made of one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookReply {
    /// Event payload for the session; `None` or empty produces no event
    pub payload: Option<Bytes>,
    /// Response body override (e.g. a verification challenge)
    pub body: Option<Bytes>,
}

impl WebhookReply {
    /// Forward `payload` as an event
    pub fn event(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: Some(payload.into()),
            body: None,
        }
    }

    /// Answer with `body` and produce no event
    pub fn respond(body: impl Into<Bytes>) -> Self {
        Self {
            payload: None,
            body: Some(body.into()),
        }
    }

    /// Accept the request without producing an event
    #[must_use]
    pub fn ignore() -> Self {
        Self::default()
    }
}

/// Variant-specific request-to-event transform
pub trait RouteHandler: Send + Sync {
    /// Turn a verified request into a reply; [`Error::InvalidRequest`] maps to 400
    fn transform(&self, request: &WebhookRequest) -> Result<WebhookReply>;
}

impl<F> RouteHandler for F
where
    F: Fn(&WebhookRequest) -> Result<WebhookReply> + Send + Sync,
{
    fn transform(&self, request: &WebhookRequest) -> Result<WebhookReply> {
        self(request)
    }
}

/// Registration unit handed to the route manager
pub struct Route {
    pub(crate) key: RouteKey,
    pub(crate) event_source: String,
    pub(crate) handler: Arc<dyn RouteHandler>,
    pub(crate) verifier: Option<Arc<dyn SignatureVerifier>>,
    pub(crate) secret: Option<String>,
    pub(crate) data_tx: mpsc::Sender<Bytes>,
}

impl Route {
    /// Create a route whose matched payloads go to `data_tx`
    pub fn new(
        key: RouteKey,
        event_source: impl Into<String>,
        handler: Arc<dyn RouteHandler>,
        data_tx: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            key,
            event_source: event_source.into(),
            handler,
            verifier: None,
            secret: None,
            data_tx,
        }
    }

    /// Authenticate requests with `verifier`; without a secret it is skipped
    #[must_use]
    pub fn with_verification(
        mut self,
        verifier: Arc<dyn SignatureVerifier>,
        secret: Option<String>,
    ) -> Self {
        self.verifier = Some(verifier);
        self.secret = secret;
        self
    }

    /// Key this route registers under
    pub fn key(&self) -> &RouteKey {
        &self.key
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("key", &self.key)
            .field("event_source", &self.event_source)
            .field("verified", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(endpoint: &str, port: u16, method: &str) -> WebhookContext {
        WebhookContext {
            endpoint: endpoint.to_string(),
            port,
            method: method.to_string(),
            url: None,
        }
    }

    #[test]
    fn test_valid_context() {
        let key = context("/hook", 8080, "post").route_key().unwrap();
        assert_eq!(key, RouteKey::new(8080, "/hook", Method::POST));
        assert_eq!(key.to_string(), "POST :8080/hook");
    }

    #[test]
    fn test_context_rejections() {
        let cases = [
            (context("", 8080, "POST"), "endpoint can't be empty"),
            (context("hook", 8080, "POST"), "must start with '/'"),
            (context("/hook", 0, "POST"), "port can't be empty"),
            (context("/hook", 8080, ""), "method can't be empty"),
            (context("/hook", 8080, "FETCH"), "unknown HTTP method"),
        ];
        for (ctx, expected) in cases {
            let err = ctx.validate().unwrap_err();
            assert!(err.to_string().contains(expected), "{err} should contain {expected}");
        }
    }

    #[test]
    fn test_context_bad_url() {
        let mut ctx = context("/hook", 8080, "POST");
        ctx.url = Some("not a url".to_string());
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_port_as_string() {
        let ctx: WebhookContext =
            serde_yaml::from_str("endpoint: /x\nport: \"12000\"\nmethod: POST\n").unwrap();
        assert_eq!(ctx.port, 12000);

        let ctx: WebhookContext =
            serde_yaml::from_str("endpoint: /x\nport: 12001\nmethod: POST\n").unwrap();
        assert_eq!(ctx.port, 12001);
    }

    #[test]
    fn test_closure_handler() {
        let handler = |req: &WebhookRequest| -> Result<WebhookReply> {
            Ok(WebhookReply::event(req.body.clone()))
        };
        let request = WebhookRequest {
            method: Method::POST,
            path: "/x".into(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"hi"),
        };
        assert_eq!(
            handler.transform(&request).unwrap(),
            WebhookReply::event(Bytes::from_static(b"hi"))
        );
    }
}
