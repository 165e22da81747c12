//! Cross-tab session handoff.
//!
//! After a login completes in a secondary tab, that tab announces
//! [`SyncMessage::SessionReady`] on a shared channel until some primary tab
//! answers [`SyncMessage::Acknowledged`]. Delivery is best effort: no primary
//! tab may be listening at all, and the secondary tab must still make progress.
//!
//! Messages travel as JSON tagged by `action`, the shape browser contexts post
//! to each other. [`LocalBus`] is the in-process channel used by tests and by
//! hosts that run several contexts in one process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

mod handoff;

pub use handoff::{
    run_primary, run_secondary, HandoffConfig, HandoffOutcome, PrimaryEffect, PrimaryTab, TabHost,
};

/// Well-known channel name every context of the origin joins.
pub const CHANNEL_NAME: &str = "tessera-auth-sync";

const DEFAULT_BUS_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum SyncMessage {
    /// A session now exists; `target` is where the sender wants to end up.
    SessionReady { target: String, timestamp: i64 },
    /// Browser contexts usually post a bare `{"action":"Acknowledged"}`.
    Acknowledged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl SyncMessage {
    /// Encode to the JSON posted between contexts.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|err| SyncError::Codec(err.to_string()))
    }

    /// # Errors
    /// Returns an error if `raw` is not a known message.
    pub fn decode(raw: &str) -> Result<Self, SyncError> {
        serde_json::from_str(raw).map_err(|err| SyncError::Codec(err.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync channel closed")]
    Closed,
    #[error("invalid sync message: {0}")]
    Codec(String),
}

/// One context's endpoint on the shared channel.
///
/// Like a browser broadcast channel, an endpoint never receives its own posts.
#[async_trait]
pub trait SyncChannel: Send {
    /// Post to every other endpoint. Nobody listening is not an error.
    ///
    /// # Errors
    /// Returns an error if the message cannot be encoded.
    fn post(&self, message: &SyncMessage) -> Result<(), SyncError>;

    /// Wait for the next message from another endpoint.
    ///
    /// # Errors
    /// Returns [`SyncError::Closed`] once no further messages can arrive.
    async fn recv(&mut self) -> Result<SyncMessage, SyncError>;
}

#[derive(Clone, Debug)]
struct Envelope {
    from: u64,
    payload: String,
}

/// In-process channel shared by every joined endpoint.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Envelope>,
    next_id: Arc<AtomicU64>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl LocalBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Join the bus as a new context. Only messages posted after joining arrive.
    #[must_use]
    pub fn join(&self) -> LocalChannel {
        LocalChannel {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            sender: self.sender.clone(),
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct LocalChannel {
    id: u64,
    sender: broadcast::Sender<Envelope>,
    receiver: broadcast::Receiver<Envelope>,
}

impl LocalChannel {
    /// Take an already delivered message without waiting.
    pub fn try_recv(&mut self) -> Option<SyncMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    if let Some(message) = self.accept(envelope) {
                        return Some(message);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Sync channel lagged, messages dropped");
                }
                Err(_) => return None,
            }
        }
    }

    fn accept(&self, envelope: Envelope) -> Option<SyncMessage> {
        if envelope.from == self.id {
            return None;
        }
        match SyncMessage::decode(&envelope.payload) {
            Ok(message) => Some(message),
            Err(err) => {
                debug!("Ignoring foreign sync message: {err}");
                None
            }
        }
    }
}

#[async_trait]
impl SyncChannel for LocalChannel {
    fn post(&self, message: &SyncMessage) -> Result<(), SyncError> {
        let envelope = Envelope {
            from: self.id,
            payload: message.encode()?,
        };
        if self.sender.send(envelope).is_err() {
            debug!("No sync listeners");
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<SyncMessage, SyncError> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if let Some(message) = self.accept(envelope) {
                        return Ok(message);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Sync channel lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SyncError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn messages_are_tagged_by_action() -> Result<()> {
        let ready = SyncMessage::SessionReady {
            target: "/dashboard".to_string(),
            timestamp: 1_700_000_000,
        };
        let value: serde_json::Value = serde_json::from_str(&ready.encode()?)?;
        assert_eq!(
            value,
            serde_json::json!({
                "action": "SessionReady",
                "target": "/dashboard",
                "timestamp": 1_700_000_000
            })
        );
        assert_eq!(
            SyncMessage::decode(r#"{"action":"SessionReady","target":"/x","timestamp":1}"#)?,
            SyncMessage::SessionReady {
                target: "/x".to_string(),
                timestamp: 1
            }
        );
        assert_eq!(
            SyncMessage::decode(r#"{"action":"Acknowledged"}"#)?,
            SyncMessage::Acknowledged { timestamp: None }
        );
        assert_eq!(
            SyncMessage::decode(r#"{"action":"Acknowledged","timestamp":5}"#)?,
            SyncMessage::Acknowledged { timestamp: Some(5) }
        );
        assert_eq!(
            SyncMessage::Acknowledged { timestamp: None }.encode()?,
            r#"{"action":"Acknowledged"}"#
        );
        assert!(SyncMessage::decode(r#"{"action":"SESSION_READY","target":"/x"}"#).is_err());
        assert!(SyncMessage::decode(r#"{"action":"LOGOUT"}"#).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn endpoints_do_not_hear_themselves() -> Result<()> {
        let bus = LocalBus::default();
        let mut first = bus.join();
        let mut second = bus.join();

        first.post(&SyncMessage::Acknowledged { timestamp: Some(1) })?;
        assert_eq!(first.try_recv(), None);
        let message = second.try_recv().context("second endpoint got nothing")?;
        assert_eq!(message, SyncMessage::Acknowledged { timestamp: Some(1) });
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_payloads_are_skipped() -> Result<()> {
        let bus = LocalBus::default();
        let mut listener = bus.join();
        bus.sender
            .send(Envelope {
                from: 0,
                payload: "not json".to_string(),
            })
            .map_err(|_| anyhow::anyhow!("no receivers"))?;
        let sender = bus.join();
        sender.post(&SyncMessage::Acknowledged { timestamp: Some(2) })?;

        assert_eq!(
            listener.recv().await,
            Ok(SyncMessage::Acknowledged { timestamp: Some(2) })
        );
        Ok(())
    }

    #[tokio::test]
    async fn late_joiners_miss_earlier_posts() -> Result<()> {
        let bus = LocalBus::default();
        let early = bus.join();
        early.post(&SyncMessage::Acknowledged { timestamp: Some(3) })?;
        let mut late = bus.join();
        assert_eq!(late.try_recv(), None);
        Ok(())
    }
}
