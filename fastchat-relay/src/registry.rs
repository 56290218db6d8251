use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::extract::ws::Message;
use fastchat_core::CLOSE_TIMEOUT;
use futures::future::join_all;
use tokio::sync::{RwLock, mpsc};
use tracing::warn;

pub type ConnectionId = u64;

/// Live peer connections, each represented by the sending half of its
/// bounded outbound queue. Dropping the last sender makes the connection's
/// writer close the socket, so removal doubles as a close request.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, mpsc::Sender<Message>>>>,
    next_id: Arc<AtomicU64>,
    send_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            next_id: Arc::default(),
            send_timeout: CLOSE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<ConnectionId>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a broadcast waits for room in a full member queue before
    /// giving up on that member.
    #[must_use]
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub async fn register(&self, tx: mpsc::Sender<Message>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.write().await.insert(id, tx);
        id
    }

    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.inner.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    /// Drops every connection, closing their sockets.
    pub async fn clear(&self) -> usize {
        let mut members = self.inner.write().await;
        let count = members.len();
        members.clear();
        count
    }

    /// Queues `message` for every member except `exclude`. A full queue gets
    /// up to the send timeout to drain; a member whose queue is closed or
    /// still full after that is removed. The remaining members still get
    /// the message.
    pub async fn broadcast(&self, message: Message, exclude: Option<ConnectionId>) -> BroadcastReport {
        let recipients = {
            let members = self.inner.read().await;
            members
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect::<Vec<_>>()
        };

        let mut report = BroadcastReport::default();
        if recipients.is_empty() {
            return report;
        }

        let send_timeout = self.send_timeout;
        let sends = recipients.into_iter().map(|(id, tx)| {
            let message = message.clone();
            async move { (id, tx.send_timeout(message, send_timeout).await) }
        });
        for (id, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(connection_id = id, "dropping connection after send failure: {err}");
                    report.dropped.push(id);
                }
            }
        }

        if !report.dropped.is_empty() {
            let mut members = self.inner.write().await;
            for id in &report.dropped {
                members.remove(id);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(body: &str) -> Message {
        Message::Text(body.to_owned().into())
    }

    fn as_text(message: Message) -> String {
        match message {
            Message::Text(text) => text.as_str().to_owned(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_member_is_removed_and_others_still_receive() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        let a = registry.register(tx_a).await;
        let b = registry.register(tx_b).await;
        let c = registry.register(tx_c).await;
        drop(rx_b);

        let report = registry.broadcast(text("hi"), None).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, vec![b]);
        assert_eq!(registry.len().await, 2);
        assert!(registry.contains(a).await);
        assert!(!registry.contains(b).await);
        assert!(registry.contains(c).await);
        assert_eq!(as_text(rx_a.recv().await.unwrap()), "hi");
        assert_eq!(as_text(rx_c.recv().await.unwrap()), "hi");
    }

    #[tokio::test]
    async fn sender_is_excluded() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = registry.register(tx_a).await;
        registry.register(tx_b).await;

        let report = registry.broadcast(text("from a"), Some(a)).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(as_text(rx_b.recv().await.unwrap()), "from a");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_without_other_members_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let report = registry.broadcast(text("nobody"), None).await;
        assert_eq!(report, BroadcastReport::default());

        let (tx, _rx) = mpsc::channel(1);
        let only = registry.register(tx).await;
        let report = registry.broadcast(text("self"), Some(only)).await;
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn queue_that_stays_full_is_dropped_after_the_timeout() {
        let registry = ConnectionRegistry::new().with_send_timeout(Duration::from_millis(50));
        let (tx, _rx) = mpsc::channel(1);
        let stuck = registry.register(tx).await;

        assert_eq!(registry.broadcast(text("1"), None).await.delivered, 1);
        let report = registry.broadcast(text("2"), None).await;
        assert_eq!(report.dropped, vec![stuck]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn slow_reader_that_catches_up_stays_connected() {
        let registry = ConnectionRegistry::new().with_send_timeout(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(tx).await;

        assert_eq!(registry.broadcast(text("1"), None).await.delivered, 1);
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut seen = Vec::new();
            while let Some(message) = rx.recv().await {
                seen.push(as_text(message));
                if seen.len() == 2 {
                    break;
                }
            }
            seen
        });

        let report = registry.broadcast(text("2"), None).await;
        assert_eq!(report.delivered, 1);
        assert!(report.dropped.is_empty());
        assert_eq!(registry.len().await, 1);
        assert_eq!(reader.await.unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn clear_closes_member_queues() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(tx).await;

        assert_eq!(registry.clear().await, 1);
        assert!(rx.recv().await.is_none());
    }
}
