use super::{SignalingChannel, SignalingError, SignalingMessage, Subscribers, Subscription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

struct Registration {
    subscribers: Subscribers,
    disconnect: Arc<watch::Sender<bool>>,
}

/// Ретранслятор в памяти процесса для тестов и демо.
#[derive(Clone, Default)]
pub struct LocalRelay {
    endpoints: Arc<RwLock<HashMap<String, Registration>>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Новый клиентский порт; регистрируется через `register`
    pub fn port(&self) -> RelayPort {
        let (disconnect, _) = watch::channel(false);
        RelayPort {
            relay: self.clone(),
            endpoint: Mutex::new(None),
            subscribers: Subscribers::default(),
            disconnect: Arc::new(disconnect),
        }
    }

    /// Разрывает соединение endpoint с ретранслятором
    pub fn disconnect(&self, endpoint_id: &str) {
        if let Some(registration) = self.endpoints.write().remove(endpoint_id) {
            tracing::debug!(target: "peercall::signaling", endpoint = endpoint_id, "relay dropped endpoint");
            let _ = registration.disconnect.send(true);
        }
    }

    fn deliver(&self, to: &str, message: &SignalingMessage) -> Result<(), SignalingError> {
        let subscribers = self
            .endpoints
            .read()
            .get(to)
            .map(|r| r.subscribers.clone())
            .ok_or_else(|| SignalingError::UnknownEndpoint(to.to_string()))?;
        let delivered = subscribers.dispatch(message);
        if delivered == 0 {
            tracing::debug!(target: "peercall::signaling", to, "no subscribers, message dropped");
        }
        Ok(())
    }
}

pub struct RelayPort {
    relay: LocalRelay,
    endpoint: Mutex<Option<String>>,
    subscribers: Subscribers,
    disconnect: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl SignalingChannel for RelayPort {
    async fn register(&self, endpoint_id: &str) -> Result<(), SignalingError> {
        let mut endpoints = self.relay.endpoints.write();
        if let Some(existing) = endpoints.get(endpoint_id) {
            if !Arc::ptr_eq(&existing.disconnect, &self.disconnect) {
                return Err(SignalingError::Rejected(format!(
                    "{endpoint_id} is already registered"
                )));
            }
        }
        endpoints.insert(
            endpoint_id.to_string(),
            Registration {
                subscribers: self.subscribers.clone(),
                disconnect: Arc::clone(&self.disconnect),
            },
        );
        *self.endpoint.lock() = Some(endpoint_id.to_string());
        let _ = self.disconnect.send(false);
        tracing::debug!(target: "peercall::signaling", endpoint = endpoint_id, "registered with local relay");
        Ok(())
    }

    async fn send(&self, to: &str, message: SignalingMessage) -> Result<(), SignalingError> {
        if self.endpoint.lock().is_none() || *self.disconnect.borrow() {
            return Err(SignalingError::NotRegistered);
        }
        self.relay.deliver(to, &message)
    }

    fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe()
    }

    fn on_disconnect(&self) -> watch::Receiver<bool> {
        self.disconnect.subscribe()
    }
}
