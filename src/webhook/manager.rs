//! Webhook route manager
//!
//! Multiplexes every webhook event source over a small set of shared ports.
//! The manager is the only owner of port listeners and the only writer of
//! route `active` flags. A route is published to the table only after its
//! port is serving, and flipped inactive before it is removed.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::route::{Route, RouteHandler, RouteKey, WebhookRequest};
use super::verify::SignatureVerifier;
use crate::config::WebhookConfig;
use crate::{Error, Result};

/// A route as stored in the table
struct ActiveRoute {
    key: RouteKey,
    event_source: String,
    handler: Arc<dyn RouteHandler>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    secret: Option<String>,
    data_tx: mpsc::Sender<Bytes>,
    active: AtomicBool,
    /// Cancelled on removal so in-flight dispatches stop waiting
    removed: CancellationToken,
}

impl ActiveRoute {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn verify(&self, request: &WebhookRequest) -> Result<()> {
        match (&self.verifier, &self.secret) {
            (Some(verifier), Some(secret)) => {
                verifier.verify(&request.headers, &request.body, secret)
            }
            _ => Ok(()),
        }
    }
}

/// One live HTTP listener shared by every route on its port
struct PortBinding {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PortBinding {
    async fn stop(mut self, port: u16, grace: std::time::Duration) {
        self.shutdown.cancel();
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!(port, "Webhook listener did not drain in time, aborting");
            self.task.abort();
            let _ = self.task.await;
        }
        info!(port, addr = %self.addr, "Webhook port closed");
    }
}

struct Inner {
    routes: RwLock<HashMap<RouteKey, Arc<ActiveRoute>>>,
    /// Also serializes register/deregister
    ports: Mutex<HashMap<u16, PortBinding>>,
    config: WebhookConfig,
}

/// Owns the webhook route table and the port listeners behind it
#[derive(Clone)]
pub struct WebhookRouteManager {
    inner: Arc<Inner>,
}

impl WebhookRouteManager {
    /// Create an empty manager
    #[must_use]
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                routes: RwLock::new(HashMap::new()),
                ports: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Register a route, binding its port if nothing serves it yet
    ///
    /// Fails with [`Error::RouteConflict`] when the key is already active and
    /// with [`Error::Bind`] when the port cannot be bound; existing routes are
    /// untouched in both cases.
    pub async fn register(&self, route: Route) -> Result<RouteRegistration> {
        let mut ports = self.inner.ports.lock().await;

        if let Some(existing) = self.inner.routes.read().get(&route.key) {
            return Err(Error::RouteConflict(format!(
                "{} is already served by event source {}",
                route.key, existing.event_source
            )));
        }

        let port = route.key.port;
        if !ports.contains_key(&port) {
            let binding = self.bind(port).await?;
            ports.insert(port, binding);
        }

        match (&route.verifier, &route.secret) {
            (Some(_), None) => warn!(
                event_source = %route.event_source,
                route = %route.key,
                "No secret configured, signature not validated"
            ),
            (None, _) => debug!(route = %route.key, "Route has no request verification"),
            (Some(_), Some(_)) => {}
        }

        let key = route.key.clone();
        let active = Arc::new(ActiveRoute {
            key: route.key,
            event_source: route.event_source,
            handler: route.handler,
            verifier: route.verifier,
            secret: route.secret,
            data_tx: route.data_tx,
            active: AtomicBool::new(false),
            removed: CancellationToken::new(),
        });
        active.active.store(true, Ordering::Release);
        self.inner.routes.write().insert(key.clone(), Arc::clone(&active));

        info!(
            event_source = %active.event_source,
            endpoint = %key.endpoint,
            port = key.port,
            method = %key.method,
            "Route active"
        );

        Ok(RouteRegistration {
            manager: self.clone(),
            key,
            route: active,
            released: false,
        })
    }

    /// Remove a route; the last route on a port stops that port's listener
    ///
    /// Returns `false` if nothing was registered under `key`.
    pub async fn deregister(&self, key: &RouteKey) -> bool {
        self.remove(key, None).await
    }

    /// Remove `key`; with an `owner`, only if that exact route is still registered
    async fn remove(&self, key: &RouteKey, owner: Option<&Arc<ActiveRoute>>) -> bool {
        let mut ports = self.inner.ports.lock().await;

        let removed = {
            let mut routes = self.inner.routes.write();
            let owned = routes
                .get(key)
                .is_some_and(|current| owner.is_none_or(|o| Arc::ptr_eq(o, current)));
            let removed = if owned { routes.remove(key) } else { None };
            if let Some(route) = &removed {
                route.active.store(false, Ordering::Release);
                route.removed.cancel();
            }
            removed
        };
        let Some(route) = removed else {
            return false;
        };

        info!(
            event_source = %route.event_source,
            endpoint = %key.endpoint,
            port = key.port,
            method = %key.method,
            "Route removed"
        );

        let port_in_use = self.inner.routes.read().keys().any(|k| k.port == key.port);
        if !port_in_use {
            if let Some(binding) = ports.remove(&key.port) {
                binding
                    .stop(key.port, self.inner.config.shutdown_timeout)
                    .await;
            }
        }
        true
    }

    /// Route one inbound request and produce the HTTP response
    ///
    /// Unknown or inactive routes are rejected without touching any channel.
    /// Only a non-empty payload is handed to the route's session, waiting at
    /// most the configured dispatch timeout.
    pub async fn dispatch(&self, port: u16, request: WebhookRequest) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let key = RouteKey::new(port, request.path.clone(), request.method.clone());

        let route = self.inner.routes.read().get(&key).cloned();
        let Some(route) = route.filter(|r| r.is_active()) else {
            debug!(request_id = %request_id, route = %key, "No active route");
            return reject(StatusCode::NOT_FOUND, "route is not active", &request_id);
        };

        debug!(
            request_id = %request_id,
            event_source = %route.event_source,
            route = %route.key,
            body_len = request.body.len(),
            "Received webhook"
        );

        if let Err(e) = route.verify(&request) {
            warn!(
                request_id = %request_id,
                event_source = %route.event_source,
                error = %e,
                "Webhook verification failed"
            );
            return reject(StatusCode::UNAUTHORIZED, "invalid signature", &request_id);
        }

        let reply = match route.handler.transform(&request) {
            Ok(reply) => reply,
            Err(Error::Verification(reason)) => {
                warn!(
                    request_id = %request_id,
                    event_source = %route.event_source,
                    reason = %reason,
                    "Webhook verification failed"
                );
                return reject(StatusCode::UNAUTHORIZED, "verification failed", &request_id);
            }
            Err(Error::InvalidRequest(reason)) => {
                debug!(request_id = %request_id, reason = %reason, "Rejected webhook request");
                return reject(StatusCode::BAD_REQUEST, &reason, &request_id);
            }
            Err(e) => {
                error!(
                    request_id = %request_id,
                    event_source = %route.event_source,
                    error = %e,
                    "Failed to transform webhook request"
                );
                return reject(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "transformation failed",
                    &request_id,
                );
            }
        };

        if let Some(payload) = reply.payload.filter(|p| !p.is_empty()) {
            let send = tokio::time::timeout(
                self.inner.config.dispatch_timeout,
                route.data_tx.send(payload),
            );
            let outcome = tokio::select! {
                sent = send => sent,
                () = route.removed.cancelled() => {
                    return reject(StatusCode::NOT_FOUND, "route is not active", &request_id);
                }
            };
            match outcome {
                Ok(Ok(())) => {
                    debug!(request_id = %request_id, event_source = %route.event_source, "Event enqueued");
                }
                Ok(Err(_)) => {
                    return reject(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "event source is not running",
                        &request_id,
                    );
                }
                Err(_) => {
                    warn!(
                        request_id = %request_id,
                        event_source = %route.event_source,
                        "Timed out handing event to session"
                    );
                    return reject(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "event queue is full",
                        &request_id,
                    );
                }
            }
        }

        match reply.body {
            Some(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                body,
            )
                .into_response(),
            None => (
                StatusCode::OK,
                Json(json!({ "status": "received", "request_id": request_id })),
            )
                .into_response(),
        }
    }

    /// Whether `key` is registered and active
    pub fn is_active(&self, key: &RouteKey) -> bool {
        self.inner
            .routes
            .read()
            .get(key)
            .is_some_and(|r| r.is_active())
    }

    /// Number of registered routes
    pub fn route_count(&self) -> usize {
        self.inner.routes.read().len()
    }

    /// Ports with a live listener, sorted
    pub async fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.inner.ports.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Deactivate every route and stop every port listener
    pub async fn shutdown(&self) {
        let mut ports = self.inner.ports.lock().await;
        {
            let mut routes = self.inner.routes.write();
            for route in routes.values() {
                route.active.store(false, Ordering::Release);
                route.removed.cancel();
            }
            routes.clear();
        }
        for (port, binding) in ports.drain() {
            binding.stop(port, self.inner.config.shutdown_timeout).await;
        }
    }

    async fn bind(&self, port: u16) -> Result<PortBinding> {
        let host: IpAddr = self
            .inner
            .config
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid webhook host: {e}")))?;
        let listener = TcpListener::bind(SocketAddr::new(host, port))
            .await
            .map_err(|source| Error::Bind { port, source })?;
        let addr = listener.local_addr()?;

        let state = PortState {
            manager: Arc::downgrade(&self.inner),
            port,
        };
        let app = Router::new()
            .fallback(dispatch_handler)
            .layer(DefaultBodyLimit::max(self.inner.config.max_body_size))
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(port, error = %e, "Webhook listener failed");
            }
        });

        info!(port, addr = %addr, "Webhook port listening");
        Ok(PortBinding {
            addr,
            shutdown,
            task,
        })
    }
}

/// Keeps a route registered; released explicitly or on drop
pub struct RouteRegistration {
    manager: WebhookRouteManager,
    key: RouteKey,
    route: Arc<ActiveRoute>,
    released: bool,
}

impl std::fmt::Debug for RouteRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistration")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl RouteRegistration {
    /// Key of the registered route
    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    /// Deregister now and wait for the port to be released if it was the last route
    pub async fn release(mut self) {
        self.released = true;
        self.manager.remove(&self.key, Some(&self.route)).await;
    }
}

impl Drop for RouteRegistration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let key = self.key.clone();
        let route = Arc::clone(&self.route);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager.remove(&key, Some(&route)).await;
            });
        }
    }
}

#[derive(Clone)]
struct PortState {
    manager: Weak<Inner>,
    port: u16,
}

async fn dispatch_handler(
    State(state): State<PortState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(inner) = state.manager.upgrade() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let request = WebhookRequest {
        method,
        path: uri.path().to_string(),
        headers,
        body,
    };
    WebhookRouteManager { inner }
        .dispatch(state.port, request)
        .await
}

fn reject(status: StatusCode, reason: &str, request_id: &str) -> Response {
    (
        status,
        Json(json!({ "error": reason, "request_id": request_id })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::{HmacSha256Verifier, WebhookReply, sign_hmac_sha256};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn manager() -> WebhookRouteManager {
        WebhookRouteManager::new(WebhookConfig {
            host: "127.0.0.1".to_string(),
            dispatch_timeout: std::time::Duration::from_millis(200),
            ..WebhookConfig::default()
        })
    }

    fn echo() -> Arc<dyn RouteHandler> {
        Arc::new(|req: &WebhookRequest| -> Result<WebhookReply> {
            Ok(WebhookReply::event(req.body.clone()))
        })
    }

    fn post(path: &str, body: &'static [u8]) -> WebhookRequest {
        WebhookRequest {
            method: Method::POST,
            path: path.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_conflicts() {
        let manager = manager();
        let port = free_port();
        let key = RouteKey::new(port, "/hook", Method::POST);
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        let first = manager
            .register(Route::new(key.clone(), "first", echo(), tx1))
            .await
            .unwrap();
        let err = manager
            .register(Route::new(key.clone(), "second", echo(), tx2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RouteConflict(_)));
        assert!(err.to_string().contains("first"));

        let response = manager.dispatch(port, post("/hook", b"payload")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"payload"));

        first.release().await;
        assert!(manager.bound_ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let manager = manager();
        let port = free_port();
        let (tx, mut rx) = mpsc::channel(4);
        let registration = manager
            .register(Route::new(RouteKey::new(port, "/a", Method::POST), "a", echo(), tx))
            .await
            .unwrap();

        let response = manager.dispatch(port, post("/b", b"x")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let mut get = post("/a", b"x");
        get.method = Method::GET;
        assert_eq!(manager.dispatch(port, get).await.status(), StatusCode::NOT_FOUND);
        assert!(rx.try_recv().is_err());

        registration.release().await;
    }

    #[tokio::test]
    async fn test_empty_payload_is_not_enqueued() {
        let manager = manager();
        let port = free_port();
        let (tx, mut rx) = mpsc::channel(4);
        let registration = manager
            .register(Route::new(RouteKey::new(port, "/e", Method::POST), "e", echo(), tx))
            .await
            .unwrap();

        let response = manager.dispatch(port, post("/e", b"")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());

        registration.release().await;
    }

    #[tokio::test]
    async fn test_bad_signature_never_reaches_channel() {
        let manager = manager();
        let port = free_port();
        let (tx, mut rx) = mpsc::channel(4);
        let route = Route::new(RouteKey::new(port, "/signed", Method::POST), "s", echo(), tx)
            .with_verification(Arc::new(HmacSha256Verifier::default()), Some("k".into()));
        let registration = manager.register(route).await.unwrap();

        let mut bad = post("/signed", b"body");
        bad.headers
            .insert("x-hub-signature-256", "sha256=deadbeef".parse().unwrap());
        assert_eq!(
            manager.dispatch(port, bad).await.status(),
            StatusCode::UNAUTHORIZED
        );
        assert!(rx.try_recv().is_err());

        let mut good = post("/signed", b"body");
        let sig = sign_hmac_sha256("k", b"body").unwrap();
        good.headers
            .insert("x-hub-signature-256", sig.parse().unwrap());
        assert_eq!(manager.dispatch(port, good).await.status(), StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"body"));

        registration.release().await;
    }

    #[tokio::test]
    async fn test_full_queue_times_out() {
        let manager = manager();
        let port = free_port();
        let (tx, _rx) = mpsc::channel(1);
        let registration = manager
            .register(Route::new(RouteKey::new(port, "/q", Method::POST), "q", echo(), tx))
            .await
            .unwrap();

        assert_eq!(manager.dispatch(port, post("/q", b"1")).await.status(), StatusCode::OK);
        assert_eq!(
            manager.dispatch(port, post("/q", b"2")).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        registration.release().await;
    }

    #[tokio::test]
    async fn test_last_route_releases_port() {
        let manager = manager();
        let port = free_port();
        let (tx, _rx) = mpsc::channel(4);

        let a = manager
            .register(Route::new(RouteKey::new(port, "/a", Method::POST), "a", echo(), tx.clone()))
            .await
            .unwrap();
        let b = manager
            .register(Route::new(RouteKey::new(port, "/b", Method::POST), "b", echo(), tx.clone()))
            .await
            .unwrap();
        assert_eq!(manager.bound_ports().await, vec![port]);

        a.release().await;
        assert_eq!(manager.bound_ports().await, vec![port]);
        b.release().await;
        assert!(manager.bound_ports().await.is_empty());

        // A fresh listener can take the port again
        let c = manager
            .register(Route::new(RouteKey::new(port, "/c", Method::POST), "c", echo(), tx))
            .await
            .unwrap();
        assert!(manager.is_active(c.key()));
        c.release().await;
    }

    #[tokio::test]
    async fn test_dropped_registration_deregisters() {
        let manager = manager();
        let port = free_port();
        let (tx, _rx) = mpsc::channel(4);
        let key = RouteKey::new(port, "/drop", Method::POST);

        let registration = manager
            .register(Route::new(key.clone(), "d", echo(), tx))
            .await
            .unwrap();
        drop(registration);

        for _ in 0..50 {
            if manager.route_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!manager.is_active(&key));
        assert_eq!(manager.route_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_registration_leaves_new_owner() {
        let manager = manager();
        let port = free_port();
        let key = RouteKey::new(port, "/owned", Method::POST);

        let (tx, _rx) = mpsc::channel(4);
        let stale = manager
            .register(Route::new(key.clone(), "old", echo(), tx))
            .await
            .unwrap();
        manager.shutdown().await;

        let (tx, _rx2) = mpsc::channel(4);
        let _current = manager
            .register(Route::new(key.clone(), "new", echo(), tx))
            .await
            .unwrap();

        stale.release().await;
        assert!(manager.is_active(&key));
        assert_eq!(manager.bound_ports().await, vec![port]);

        assert!(manager.deregister(&key).await);
        assert!(!manager.deregister(&key).await);
        assert!(manager.bound_ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let manager = manager();
        let (tx, _rx) = mpsc::channel(4);

        let err = manager
            .register(Route::new(RouteKey::new(port, "/x", Method::POST), "x", echo(), tx))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(manager.route_count(), 0);
    }
}
