//! Контракт сигнального канала и формат сообщений.
//!
//! Доставка не более одного раза и без гарантии порядка, в том числе
//! внутри одного потока отправитель → получатель.

pub mod memory;
pub mod websocket;

use crate::error::CallError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use memory::{LocalRelay, RelayPort};
pub use websocket::WsSignaling;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Offer,
    Answer,
    IceCandidate,
    Bye,
    Invite,
    Accept,
    Reject,
}

/// Конверт сигнального сообщения (wire format)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub call_id: String,
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl SignalingMessage {
    pub fn new(
        kind: MessageType,
        call_id: impl Into<String>,
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            call_id: call_id.into(),
            from_id: from_id.into(),
            to_id: to_id.into(),
            payload,
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CallError::Malformed(format!("{:?} payload for call {}: {e}", self.kind, self.call_id))
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Причина для `reject` и `bye`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ReasonPayload {
    #[serde(default)]
    pub reason: String,
}

impl ReasonPayload {
    pub fn to_value(reason: &str) -> Value {
        serde_json::json!({ "reason": reason })
    }
}

pub const REASON_BUSY: &str = "busy";
pub const REASON_TIMEOUT: &str = "timeout";

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("endpoint is not registered")]
    NotRegistered,
    #[error("endpoint {0} is not reachable")]
    UnknownEndpoint(String),
    #[error("signaling channel closed")]
    Closed,
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("signaling encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn register(&self, endpoint_id: &str) -> Result<(), SignalingError>;
    async fn send(&self, to: &str, message: SignalingMessage) -> Result<(), SignalingError>;
    /// Подписка на входящие сообщения; снимается при drop
    fn subscribe(&self) -> Subscription;
    /// Становится `true` после потери соединения с ретранслятором
    fn on_disconnect(&self) -> watch::Receiver<bool>;
}

/// Подписка на входящие сообщения
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

type SubscriberMap = Mutex<HashMap<u64, mpsc::UnboundedSender<SignalingMessage>>>;

/// Реестр подписчиков, общий для адаптеров
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    next: Arc<AtomicU64>,
    map: Arc<SubscriberMap>,
}

impl Subscribers {
    pub(crate) fn subscribe(&self) -> Subscription {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.map.lock().insert(id, tx);
        let weak: Weak<SubscriberMap> = Arc::downgrade(&self.map);
        Subscription {
            id,
            rx,
            release: Some(Box::new(move || {
                if let Some(map) = weak.upgrade() {
                    map.lock().remove(&id);
                }
            })),
        }
    }

    /// Рассылает сообщение всем подписчикам; возвращает число получателей
    pub(crate) fn dispatch(&self, message: &SignalingMessage) -> usize {
        let mut map = self.map.lock();
        map.retain(|_, tx| tx.send(message.clone()).is_ok());
        map.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}
