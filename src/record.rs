//! Запись о завершённом звонке и приёмники для неё.
//!
//! Ядро отдаёт запись и не ждёт результата: `CallRecordSink::record`
//! синхронный, асинхронные приёмники сами порождают задачу.

use crate::peer::state::CallSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub participants: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    /// От установления соединения до завершения; 0 если не соединились
    pub duration_seconds: i64,
    pub end_reason: String,
}

impl CallRecord {
    pub fn from_session(local_id: &str, session: &CallSession, reason: &str) -> Self {
        let ended_at = session.ended_at.unwrap_or_else(Utc::now);
        let duration_seconds = session
            .connected_at
            .map(|at| (ended_at - at).num_seconds().max(0))
            .unwrap_or(0);
        Self {
            call_id: session.call_id.clone(),
            participants: vec![local_id.to_string(), session.remote.id.clone()],
            started_at: session.started_at,
            connected_at: session.connected_at,
            ended_at,
            duration_seconds,
            end_reason: reason.to_string(),
        }
    }
}

pub trait CallRecordSink: Send + Sync {
    fn record(&self, record: CallRecord);
}

/// Только пишет запись в лог
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl CallRecordSink for LogSink {
    fn record(&self, record: CallRecord) {
        tracing::info!(
            target: "peercall::record",
            call_id = %record.call_id,
            duration = record.duration_seconds,
            reason = %record.end_reason,
            "call finished"
        );
    }
}

#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CallRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CallRecordSink for ChannelSink {
    fn record(&self, record: CallRecord) {
        let _ = self.tx.send(record);
    }
}

/// POST записи в REST API консультаций с bearer-токеном.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token,
        }
    }
}

impl CallRecordSink for HttpSink {
    fn record(&self, record: CallRecord) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut request = client.post(&endpoint).json(&record);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(target: "peercall::record", call_id = %record.call_id, "call record stored");
                }
                Ok(resp) => {
                    tracing::warn!(
                        target: "peercall::record",
                        call_id = %record.call_id,
                        status = %resp.status(),
                        "call record rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(target: "peercall::record", call_id = %record.call_id, "call record not stored: {err}");
                }
            }
        });
    }
}
