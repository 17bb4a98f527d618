//! Fixed-interval listener
//!
//! Emits `{"eventTime": <RFC 3339>, "userPayload": <json>}` every interval.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use super::{Listener, parse_config};
use crate::config::humantime_serde;
use crate::eventsource::EventSource;
use crate::session::SessionHandle;
use crate::{Error, Result};

/// Poll event source configuration
///
/// ```yaml
/// interval: 30s
/// userPayload: { "job": "cleanup" }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollEventSourceConfig {
    /// Interval between ticks, e.g. `10s`, `5m`
    #[serde(default)]
    pub interval: String,
    /// Opaque JSON attached to every tick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_payload: Option<serde_json::Value>,
}

/// Longest accepted poll interval (one year)
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 3600);

impl PollEventSourceConfig {
    /// Parsed interval, greater than zero and at most [`MAX_INTERVAL`]
    pub fn interval(&self) -> Result<Duration> {
        if self.interval.is_empty() {
            return Err(Error::InvalidEventSource(
                "interval can't be empty".to_string(),
            ));
        }
        let interval = humantime_serde::parse(&self.interval).map_err(|e| {
            Error::InvalidEventSource(format!("invalid interval {}: {e}", self.interval))
        })?;
        if interval.is_zero() {
            return Err(Error::InvalidEventSource(
                "interval must be greater than zero".to_string(),
            ));
        }
        if interval > MAX_INTERVAL {
            return Err(Error::InvalidEventSource(format!(
                "interval {} exceeds the maximum of {}s",
                self.interval,
                MAX_INTERVAL.as_secs()
            )));
        }
        Ok(interval)
    }
}

/// Payload of one tick
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollEvent {
    /// When the tick fired
    pub event_time: chrono::DateTime<chrono::Utc>,
    /// Configured user payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_payload: Option<serde_json::Value>,
}

/// Listener for `poll` event sources
#[derive(Debug, Default)]
pub struct PollListener;

impl PollListener {
    /// Create the listener
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Listener for PollListener {
    fn source_type(&self) -> &'static str {
        "poll"
    }

    fn check(&self, value: &[u8]) -> Result<()> {
        parse_config::<PollEventSourceConfig>(value)?
            .interval()
            .map(|_| ())
    }

    async fn start(&self, source: EventSource, session: SessionHandle) -> Result<()> {
        let config: PollEventSourceConfig = parse_config(&source.value)?;
        let period = config.interval()?;

        let first = Instant::now().checked_add(period).ok_or_else(|| {
            Error::InvalidEventSource(format!("interval {} is out of range", config.interval))
        })?;
        let mut ticker = tokio::time::interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(event_source = %source.name, interval = ?period, "Polling");

        loop {
            tokio::select! {
                () = session.done() => break,
                _ = ticker.tick() => {
                    let event = PollEvent {
                        event_time: chrono::Utc::now(),
                        user_payload: config.user_payload.clone(),
                    };
                    let payload = Bytes::from(serde_json::to_vec(&event)?);
                    if session.send(payload).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(event_source = %source.name, "Stopped polling");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StreamSession;

    #[test]
    fn test_validation() {
        let listener = PollListener::new();
        assert!(listener.validate(b"interval: 10s\n").is_valid);
        assert_eq!(
            listener.validate(b"userPayload: {}\n").reason,
            "interval can't be empty"
        );
        assert!(
            listener
                .validate(b"interval: 0s\n")
                .reason
                .contains("greater than zero")
        );
        assert!(
            listener
                .validate(b"interval: often\n")
                .reason
                .contains("invalid interval")
        );
    }

    #[test]
    fn test_out_of_range_intervals_are_invalid() {
        let listener = PollListener::new();
        for value in [
            "interval: 18446744073709551615s\n",
            "interval: 400000000000000000m\n",
            "interval: 9000h\n",
        ] {
            let verdict = listener.validate(value.as_bytes());
            assert!(!verdict.is_valid, "{value}");
        }
        assert!(listener.validate(b"interval: 8760h\n").is_valid);
    }

    #[tokio::test]
    async fn test_ticks_until_done() {
        let (handle, mut session) = StreamSession::open(8);
        let source = EventSource::new("ticker", "poll", "interval: 20ms\nuserPayload: {\"n\": 1}\n");
        let producer = {
            let handle = handle.clone();
            tokio::spawn(async move { PollListener::new().start(source, handle).await })
        };

        let first = session.data_rx.recv().await.unwrap();
        let event: serde_json::Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(event["userPayload"]["n"], 1);
        assert!(event["eventTime"].is_string());

        session.close();
        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
