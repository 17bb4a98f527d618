//! Event Gateway Library
//!
//! Turns heterogeneous external signals into one outbound event stream.
//!
//! # Features
//!
//! - **Pluggable listeners**: file watches, timers, generic webhooks, Slack and Gitlab
//! - **Shared webhook ports**: many endpoints multiplexed over a few listeners
//! - **Streaming**: one SSE stream per started event source, ended by a single terminal frame
//! - **Containment**: producer panics become typed terminal errors, never process crashes
//! - **Cancellation**: client disconnects and explicit stops release routes and watches

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod eventsource;
pub mod gateway;
pub mod listener;
pub mod secrets;
pub mod session;
pub mod stream;
pub mod webhook;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
    }

    Ok(())
}
