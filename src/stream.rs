//! Outbound event stream and the adapter that feeds it
//!
//! [`EventStreamAdapter`] drains one [`StreamSession`] onto one outbound
//! [`EventStream`]. It wakes on four conditions, first observed wins:
//!
//! 1. a payload is available: frame it and write it downstream
//! 2. the producer reported an error: terminate with that error
//! 3. the downstream call was cancelled (client went away): terminate cleanly
//! 4. the frontend asked for an explicit stop: terminate cleanly
//!
//! Every exit path closes the session's done signal so the producer stops.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::eventsource::base64_bytes;
use crate::session::StreamSession;
use crate::{Error, Result};

/// One framed event as written downstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event source that produced the payload
    pub name: String,
    /// Raw payload bytes (base64 on the wire)
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
}

/// Downstream half of a `StartEventSource` call
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Write one frame
    async fn send(&self, frame: EventFrame) -> Result<()>;

    /// Resolves when the downstream side has gone away
    async fn closed(&self);
}

/// Message carried by a [`ChannelEventStream`]
#[derive(Debug)]
pub enum StreamMessage {
    /// A framed event
    Event(EventFrame),
    /// The session ended; `None` for a clean shutdown
    Terminated(Option<Error>),
}

/// [`EventStream`] backed by a bounded channel; dropping the receiver cancels
pub struct ChannelEventStream {
    tx: mpsc::Sender<StreamMessage>,
}

impl ChannelEventStream {
    /// Wrap a sender
    #[must_use]
    pub fn new(tx: mpsc::Sender<StreamMessage>) -> Self {
        Self { tx }
    }

    /// Create a stream together with its receiving end
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<StreamMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventStream for ChannelEventStream {
    async fn send(&self, frame: EventFrame) -> Result<()> {
        self.tx
            .send(StreamMessage::Event(frame))
            .await
            .map_err(|_| Error::Transport("outbound stream closed".to_string()))
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

enum Wake {
    Data(Option<Bytes>),
    Failed(Error),
    Cancelled,
    Stopped,
}

/// Bridges one session to one outbound stream
pub struct EventStreamAdapter<S> {
    name: String,
    stream: S,
    session: StreamSession,
    stop: CancellationToken,
    delivered: u64,
}

impl<S: EventStream> EventStreamAdapter<S> {
    /// Create an adapter; cancelling `stop` ends the session cleanly
    pub fn new(
        name: impl Into<String>,
        stream: S,
        session: StreamSession,
        stop: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            stream,
            session,
            stop,
            delivered: 0,
        }
    }

    /// Pump events until the session terminates; returns the terminal result
    pub async fn run(mut self) -> Result<()> {
        let result = self.pump().await;
        self.session.close();

        match &result {
            Ok(()) => info!(
                event_source = %self.name,
                delivered = self.delivered,
                "Event stream finished"
            ),
            Err(e) => warn!(
                event_source = %self.name,
                delivered = self.delivered,
                kind = e.kind(),
                error = %e,
                "Event stream terminated"
            ),
        }
        result
    }

    async fn pump(&mut self) -> Result<()> {
        loop {
            let wake = tokio::select! {
                () = self.stream.closed() => Wake::Cancelled,
                () = self.stop.cancelled() => Wake::Stopped,
                Some(err) = self.session.error_rx.recv() => Wake::Failed(err),
                data = self.session.data_rx.recv() => Wake::Data(data),
            };

            match wake {
                Wake::Data(Some(payload)) => {
                    let frame = EventFrame {
                        name: self.name.clone(),
                        payload,
                    };
                    tokio::select! {
                        sent = self.stream.send(frame) => sent?,
                        () = self.stream.closed() => {
                            info!(event_source = %self.name, "Client disconnected during write");
                            return Ok(());
                        }
                        () = self.stop.cancelled() => return Ok(()),
                    }
                    self.delivered += 1;
                    debug!(event_source = %self.name, seq = self.delivered, "Dispatched event");
                }
                Wake::Data(None) => {
                    // Producer is gone; an error it reported may still be queued.
                    return match self.session.error_rx.try_recv() {
                        Ok(err) => Err(err),
                        Err(_) => Ok(()),
                    };
                }
                Wake::Failed(err) => return Err(err),
                Wake::Cancelled => {
                    info!(event_source = %self.name, "Client disconnected");
                    return Ok(());
                }
                Wake::Stopped => {
                    info!(event_source = %self.name, "Stop requested");
                    return Ok(());
                }
            }
        }
    }
}
