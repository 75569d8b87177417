use crate::error::CallError;
use crate::peer::types::Endpoint;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Имя, если справочник недоступен или не знает endpoint
pub const PLACEHOLDER_NAME: &str = "Unknown";

#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_endpoint(&self, id: &str) -> Result<Endpoint, CallError>;
}

/// Подпись для сессии; ошибка справочника звонок не ломает
pub async fn label_endpoint(directory: &dyn Directory, id: &str) -> Endpoint {
    match directory.resolve_endpoint(id).await {
        Ok(endpoint) => Endpoint::new(id, endpoint.display_name),
        Err(err) => {
            tracing::debug!(target: "peercall::session", endpoint = id, "directory lookup failed: {err}");
            Endpoint::new(id, PLACEHOLDER_NAME)
        }
    }
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: RwLock<HashMap<String, String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, display_name: impl Into<String>) {
        self.entries.write().insert(id.into(), display_name.into());
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn resolve_endpoint(&self, id: &str) -> Result<Endpoint, CallError> {
        self.entries
            .read()
            .get(id)
            .map(|name| Endpoint::new(id, name.clone()))
            .ok_or_else(|| CallError::UnknownCall(format!("no directory entry for {id}")))
    }
}
