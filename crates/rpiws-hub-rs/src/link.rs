use rpiws_core::protocol::encode_message;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Reason handed to the socket pump when the broker drops a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// Outbound half of one connection, as seen from the event loop.
///
/// Sends never block: frames go into a bounded queue drained by the
/// connection's writer task. A full or closed queue counts as a dead peer.
#[derive(Clone, Debug)]
pub struct Link {
    conn_id: String,
    tx: mpsc::Sender<String>,
    close_tx: Arc<watch::Sender<Option<CloseRequest>>>,
}

/// Receiving ends owned by the socket pump.
#[derive(Debug)]
pub struct LinkRx {
    pub frames: mpsc::Receiver<String>,
    pub close: watch::Receiver<Option<CloseRequest>>,
}

impl Link {
    pub fn new(conn_id: impl Into<String>, capacity: usize) -> (Self, LinkRx) {
        let (tx, frames) = mpsc::channel(capacity.max(1));
        let (close_tx, close) = watch::channel(None);
        (
            Self {
                conn_id: conn_id.into(),
                tx,
                close_tx: Arc::new(close_tx),
            },
            LinkRx { frames, close },
        )
    }

    pub fn send<T: Serialize>(&self, msg: &T) -> bool {
        let text = match encode_message(msg) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", conn_id = %self.conn_id, error = %err);
                return false;
            }
        };
        self.send_text(text)
    }

    pub fn send_text(&self, text: String) -> bool {
        if self.is_closing() {
            return false;
        }
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "send_queue_full", conn_id = %self.conn_id);
                self.close(1008, "send_queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the pump to send a close frame and tear the socket down. The
    /// first reason wins.
    pub fn close(&self, code: u16, reason: &str) {
        self.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseRequest {
                code,
                reason: reason.to_string(),
            });
            true
        });
    }

    pub fn is_closing(&self) -> bool {
        self.close_tx.borrow().is_some()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use serde::de::DeserializeOwned;

    /// Drains every queued frame and decodes it as `T`.
    pub fn drain<T: DeserializeOwned>(rx: &mut LinkRx) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(text) = rx.frames.try_recv() {
            out.push(serde_json::from_str(&text).expect("decode outbound frame"));
        }
        out
    }

    pub fn closed_with(rx: &LinkRx) -> Option<CloseRequest> {
        rx.close.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use rpiws_core::protocol::BrokerToAgent;

    #[test]
    fn full_queue_closes_the_link() {
        let (link, mut rx) = Link::new("conn-1", 2);
        assert!(link.send(&BrokerToAgent::Ack));
        assert!(link.send(&BrokerToAgent::ResumeStreaming));
        assert!(!link.send(&BrokerToAgent::PauseStreaming));
        assert!(link.is_closing());
        assert_eq!(closed_with(&rx).map(|c| c.reason), Some("send_queue_full".to_string()));

        let sent: Vec<BrokerToAgent> = drain(&mut rx);
        assert_eq!(sent, vec![BrokerToAgent::Ack, BrokerToAgent::ResumeStreaming]);
    }

    #[test]
    fn first_close_reason_wins() {
        let (link, rx) = Link::new("conn-2", 4);
        link.close(1008, "auth_failed");
        link.close(1000, "later");
        assert_eq!(
            closed_with(&rx),
            Some(CloseRequest {
                code: 1008,
                reason: "auth_failed".to_string()
            })
        );
        assert!(!link.send(&BrokerToAgent::Ack));
    }
}
