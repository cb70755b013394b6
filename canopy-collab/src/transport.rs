//! Message transport between one client and the server.
//!
//! A [`Transport`] is one end of a bidirectional, ordered message pipe with
//! a shared closed flag. [`Transport::pair`] builds two connected ends in
//! memory; the WebSocket adapters in [`crate::ws`] bridge one end of a pair
//! to a socket so the sync layers never see the wire.
//!
//! ```text
//!   ClientDoc ── Transport ═══ pair ═══ Transport ── pump ── WebSocket
//! ```
//!
//! Sending is fire-and-forget: messages sent after close are dropped.
//! Receiving yields every message already queued before reporting close.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::protocol::{Msg, ProtocolError};

/// Sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransportSender {
    outbound: mpsc::UnboundedSender<Msg>,
    closed: Arc<watch::Sender<bool>>,
}

impl TransportSender {
    /// Queue `msg` for delivery. Dropped silently once closed.
    pub fn send(&self, msg: Msg) {
        if self.is_closed() {
            log::trace!("transport closed, dropping {} message", msg.kind());
            return;
        }
        if self.outbound.send(msg).is_err() {
            self.close();
        }
    }

    /// Close both ends. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once either end has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // Err only if the sender is gone, which `self` prevents.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct TransportReceiver {
    inbound: mpsc::UnboundedReceiver<Msg>,
    closed: watch::Receiver<bool>,
}

impl TransportReceiver {
    /// Next message, or `None` once the transport is closed and drained.
    pub async fn recv(&mut self) -> Option<Msg> {
        tokio::select! {
            biased;
            msg = self.inbound.recv() => msg,
            _ = self.closed.wait_for(|closed| *closed) => self.inbound.try_recv().ok(),
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Msg>, ProtocolError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ProtocolError::Timeout)
    }
}

/// One end of a message pipe.
#[derive(Debug)]
pub struct Transport {
    sender: TransportSender,
    receiver: TransportReceiver,
}

impl Transport {
    /// Two connected ends sharing one closed flag.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let a = Transport {
            sender: TransportSender {
                outbound: a_tx,
                closed: Arc::clone(&closed_tx),
            },
            receiver: TransportReceiver {
                inbound: a_rx,
                closed: closed_rx.clone(),
            },
        };
        let b = Transport {
            sender: TransportSender {
                outbound: b_tx,
                closed: closed_tx,
            },
            receiver: TransportReceiver {
                inbound: b_rx,
                closed: closed_rx,
            },
        };
        (a, b)
    }

    pub fn send(&self, msg: Msg) {
        self.sender.send(msg);
    }

    pub async fn recv(&mut self) -> Option<Msg> {
        self.receiver.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Msg>, ProtocolError> {
        self.receiver.recv_timeout(timeout).await
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub fn split(self) -> (TransportSender, TransportReceiver) {
        (self.sender, self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Awareness;

    fn heartbeat() -> Msg {
        Msg::Update {
            awareness: Awareness::new(),
            seq: None,
            changeset: None,
        }
    }

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, mut b) = Transport::pair();
        a.send(Msg::auth("one"));
        a.send(Msg::auth("two"));
        assert_eq!(b.recv().await, Some(Msg::auth("one")));
        assert_eq!(b.recv().await, Some(Msg::auth("two")));
    }

    #[tokio::test]
    async fn test_close_is_shared_and_drains_first() {
        let (a, mut b) = Transport::pair();
        a.send(heartbeat());
        a.close();
        assert!(b.is_closed());
        assert_eq!(b.recv().await, Some(heartbeat()));
        assert_eq!(b.recv().await, None);

        // Sends after close are dropped.
        b.send(heartbeat());
        let (_, mut a_rx) = a.split();
        assert_eq!(a_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout() {
        let (_a, mut b) = Transport::pair();
        let got = b.recv_timeout(Duration::from_secs(1)).await;
        assert!(matches!(got, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_closed_future_resolves() {
        let (a, b) = Transport::pair();
        let sender = a.sender();
        let waiter = tokio::spawn(async move { sender.closed().await });
        b.close();
        waiter.await.unwrap();
    }
}
