// Конфигурация ядра звонков.
// Значения по умолчанию совпадают с политикой клиента: 45 с на ответ,
// 5 с на восстановление соединения, не более 100 отложенных кандидатов.

use crate::error::CallError;
use crate::logger::LogConfig;
use crate::peer::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(45);

/// Период ожидания перед принудительным завершением после обрыва
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_CANDIDATE_BUFFER: usize = 100;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    #[serde(rename = "invite_timeout_ms", with = "millis")]
    pub invite_timeout: Duration,
    #[serde(rename = "reconnect_grace_ms", with = "millis")]
    pub reconnect_grace: Duration,
    pub candidate_buffer_capacity: usize,
    pub ice_servers: Vec<ServerConfig>,
    pub media: MediaConstraints,
    /// REST-адрес для записей о звонках; без него записи только в лог
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_url: Option<String>,
    pub log: LogConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            candidate_buffer_capacity: DEFAULT_CANDIDATE_BUFFER,
            ice_servers: default_ice_servers(),
            media: MediaConstraints::default(),
            records_url: None,
            log: LogConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self, CallError> {
        let config: CallConfig =
            serde_json::from_str(raw).map_err(|e| CallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.invite_timeout.is_zero() {
            return Err(CallError::Config("invite timeout must be positive".into()));
        }
        if self.candidate_buffer_capacity == 0 {
            return Err(CallError::Config(
                "candidate buffer capacity must be positive".into(),
            ));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::Config(format!(
                    "ICE server {} has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn"
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-2".into(),
            r#type: "stun".into(),
            url: "stun:stun2.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
