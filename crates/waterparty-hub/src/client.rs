//! Per-connection client handle and its bounded outbound mailbox.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use waterparty_core::{ConnectionId, UserId};

/// Why a frame could not be queued for a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The mailbox is at capacity. The client is too slow and gets evicted.
    #[error("mailbox full")]
    Full,
    /// The client has already been closed.
    #[error("mailbox closed")]
    Closed,
}

struct ClientInner {
    user_id: UserId,
    connection_id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
    connected_at: Instant,
}

/// Shared handle to one connected peer.
///
/// Cheap to clone. Two handles are equal when they refer to the same
/// connection, regardless of user id.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

/// Receiving half of a client's outbound queue, owned by the outbound pump.
pub struct Mailbox {
    rx: mpsc::Receiver<Arc<str>>,
}

/// Build a client and its mailbox.
pub fn channel(user_id: UserId, capacity: usize) -> (ClientHandle, Mailbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let client = ClientHandle {
        inner: Arc::new(ClientInner {
            user_id,
            connection_id: ConnectionId::new(),
            tx,
            closed: CancellationToken::new(),
            connected_at: Instant::now(),
        }),
    };
    (client, Mailbox { rx })
}

impl ClientHandle {
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    /// Queue a frame without waiting.
    pub fn try_enqueue(&self, frame: Arc<str>) -> Result<(), EnqueueError> {
        if self.inner.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        self.inner.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the mailbox. Idempotent.
    ///
    /// Frames already queued are still flushed by the outbound pump before
    /// it sends the close frame.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once `close` has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closed.cancelled()
    }

    /// Time since the handle was created.
    pub fn age(&self) -> Duration {
        self.inner.connected_at.elapsed()
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.connection_id == other.inner.connection_id
    }
}

impl Eq for ClientHandle {}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("user_id", &self.inner.user_id)
            .field("connection_id", &self.inner.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Mailbox {
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Join `first` with every frame queued at this instant, newline
    /// separated, in arrival order.
    pub fn coalesce(&mut self, first: Arc<str>) -> String {
        let queued = self.rx.len();
        let mut batch = String::from(&*first);
        for _ in 0..queued {
            match self.rx.try_recv() {
                Ok(frame) => {
                    batch.push('\n');
                    batch.push_str(&frame);
                }
                Err(_) => break,
            }
        }
        batch
    }

    /// Take everything still queued, joined as in [`Mailbox::coalesce`].
    pub fn drain(&mut self) -> Option<String> {
        let first = self.rx.try_recv().ok()?;
        Some(self.coalesce(first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[tokio::test]
    async fn enqueue_and_receive() {
        let (client, mut mailbox) = channel(UserId::from_raw("u1"), 4);
        client.try_enqueue(frame("hello")).unwrap();
        assert_eq!(mailbox.len(), 1);
        assert_eq!(&*mailbox.recv().await.unwrap(), "hello");
    }

    #[test]
    fn full_mailbox_reports_full() {
        let (client, _mailbox) = channel(UserId::from_raw("u1"), 1);
        assert!(client.try_enqueue(frame("a")).is_ok());
        assert_eq!(client.try_enqueue(frame("b")), Err(EnqueueError::Full));
    }

    #[test]
    fn closed_client_rejects_frames() {
        let (client, _mailbox) = channel(UserId::from_raw("u1"), 4);
        client.close();
        client.close();
        assert!(client.is_closed());
        assert_eq!(client.try_enqueue(frame("a")), Err(EnqueueError::Closed));
    }

    #[test]
    fn dropped_mailbox_reports_closed() {
        let (client, mailbox) = channel(UserId::from_raw("u1"), 4);
        drop(mailbox);
        assert_eq!(client.try_enqueue(frame("a")), Err(EnqueueError::Closed));
    }

    #[test]
    fn equality_is_by_connection() {
        let (a, _ma) = channel(UserId::from_raw("same"), 1);
        let (b, _mb) = channel(UserId::from_raw("same"), 1);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.connection_id().as_str().starts_with("conn_"));
    }

    #[test]
    fn coalesce_preserves_order() {
        let (client, mut mailbox) = channel(UserId::from_raw("u1"), 8);
        for s in ["m1", "m2", "m3"] {
            client.try_enqueue(frame(s)).unwrap();
        }
        let first = mailbox.rx.try_recv().unwrap();
        assert_eq!(mailbox.coalesce(first), "m1\nm2\nm3");
        assert!(mailbox.is_empty());
    }

    #[test]
    fn drain_after_close_keeps_queued_frames() {
        let (client, mut mailbox) = channel(UserId::from_raw("u1"), 8);
        client.try_enqueue(frame("a")).unwrap();
        client.try_enqueue(frame("b")).unwrap();
        client.close();
        assert_eq!(mailbox.drain().as_deref(), Some("a\nb"));
        assert_eq!(mailbox.drain(), None);
    }

    #[tokio::test]
    async fn closed_future_resolves() {
        let (client, _mailbox) = channel(UserId::from_raw("u1"), 1);
        let waiter = client.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });
        client.close();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn age_tracks_time_since_connect() {
        let (client, _mailbox) = channel(UserId::from_raw("u1"), 1);
        assert_eq!(client.age(), Duration::ZERO);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(client.age(), Duration::from_secs(90));
    }
}
