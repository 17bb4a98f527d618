//! Shared webhook plumbing
//!
//! Webhook-based event sources do not open sockets themselves. They describe
//! an endpoint with a [`WebhookContext`], wrap it in a [`Route`] and hand it to
//! the process-wide [`WebhookRouteManager`], which owns the listeners.

mod manager;
mod route;
mod verify;

pub use manager::{RouteRegistration, WebhookRouteManager};
pub use route::{Route, RouteHandler, RouteKey, WebhookContext, WebhookReply, WebhookRequest};
pub use verify::{
    HmacSha256Verifier, SignatureVerifier, SlackSignatureVerifier, TokenVerifier, sign_hmac_sha256,
};
