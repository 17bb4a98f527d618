//! Per-start session state shared by a producer and the stream adapter
//!
//! A session is a bounded data queue, a single-slot error channel and a done
//! signal. The producing listener holds a [`SessionHandle`]; the
//! [`EventStreamAdapter`](crate::stream::EventStreamAdapter) owns the
//! receiving [`StreamSession`]. Payloads are consumed by exactly one reader, so
//! enqueue order is delivery order.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Receiving half of a session, owned by the stream adapter
pub struct StreamSession {
    pub(crate) data_rx: mpsc::Receiver<Bytes>,
    pub(crate) error_rx: mpsc::Receiver<Error>,
    pub(crate) done: CancellationToken,
}

/// Producer half of a session
#[derive(Clone)]
pub struct SessionHandle {
    data_tx: mpsc::Sender<Bytes>,
    error_tx: mpsc::Sender<Error>,
    done: CancellationToken,
}

impl StreamSession {
    /// Open a session whose data queue holds at most `capacity` payloads
    ///
    /// ```
    /// use bytes::Bytes;
    /// use event_gateway::session::StreamSession;
    ///
    /// # tokio_test::block_on(async {
    /// let (handle, session) = StreamSession::open(8);
    /// handle.send(Bytes::from_static(b"hello")).await.unwrap();
    /// session.close();
    /// assert!(handle.is_done());
    /// # });
    /// ```
    #[must_use]
    pub fn open(capacity: usize) -> (SessionHandle, Self) {
        let (data_tx, data_rx) = mpsc::channel(capacity.max(1));
        // Only the first error matters; later ones are dropped by `fail`.
        let (error_tx, error_rx) = mpsc::channel(1);
        let done = CancellationToken::new();

        (
            SessionHandle {
                data_tx,
                error_tx,
                done: done.clone(),
            },
            Self {
                data_rx,
                error_rx,
                done,
            },
        )
    }

    /// Signal the producer to stop (idempotent)
    pub fn close(&self) {
        self.done.cancel();
    }
}

impl SessionHandle {
    /// Enqueue one payload, waiting for queue space
    ///
    /// Fails with [`Error::SessionEnded`] once the session is done, so nothing
    /// is enqueued after cancellation.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        tokio::select! {
            biased;
            () = self.done.cancelled() => Err(Error::SessionEnded),
            sent = self.data_tx.send(payload) => sent.map_err(|_| Error::SessionEnded),
        }
    }

    /// Report a terminal error; returns `false` if one was already reported
    /// or the session has ended
    pub fn fail(&self, error: Error) -> bool {
        match self.error_tx.try_send(error) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e.into_inner(), "Dropped error for finished session");
                false
            }
        }
    }

    /// Resolves once the session is done
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    /// Whether the session has ended
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Clone of the data sender, for routes that enqueue on the session's behalf
    #[must_use]
    pub fn data_sender(&self) -> mpsc::Sender<Bytes> {
        self.data_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_preserves_order() {
        let (handle, mut session) = StreamSession::open(8);
        for i in 0..5u8 {
            handle.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(session.data_rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (handle, mut session) = StreamSession::open(8);
        session.close();
        assert!(handle.is_done());
        let err = handle.send(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, Error::SessionEnded));
        assert!(session.data_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blocked_send_released_by_close() {
        let (handle, session) = StreamSession::open(1);
        handle.send(Bytes::from_static(b"fills queue")).await.unwrap();

        let blocked = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(Bytes::from_static(b"blocked")).await })
        };
        tokio::task::yield_now().await;
        session.close();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::SessionEnded)));
    }

    #[tokio::test]
    async fn test_only_first_error_is_kept() {
        let (handle, mut session) = StreamSession::open(1);
        assert!(handle.fail(Error::Watch("first".into())));
        assert!(!handle.fail(Error::Watch("second".into())));
        let err = session.error_rx.recv().await.unwrap();
        assert_eq!(err.to_string(), "File watch error: first");
    }
}
