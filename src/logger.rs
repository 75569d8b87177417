use crate::error::CallError;
use crate::peer::media::MediaKind;
use crate::peer::types::{CallInvite, IceCandidate};
use crate::record::CallRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Переменная окружения, перекрывающая уровень из конфигурации
pub const LOG_ENV: &str = "PEERCALL_LOG";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    pub level: String,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(debug_assertions),
            level: "info".into(),
            ansi: true,
        }
    }
}

/// Устанавливает глобальный tracing subscriber.
///
/// Повторный вызов ничего не делает: подписчик уже установлен.
pub fn init(config: &LogConfig) -> Result<(), CallError> {
    if !config.enabled {
        return Ok(());
    }
    let filter = match std::env::var(LOG_ENV) {
        Ok(spec) => EnvFilter::try_new(spec),
        Err(_) => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| CallError::Config(format!("invalid log filter: {e}")))?;

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(config.ansi)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(level = %config.level, "logging initialised");
    }
    Ok(())
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, call_id: &str, cand: &IceCandidate) {
    tracing::trace!(
        target: "peercall::ice",
        call_id,
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}

/// События для прикладного слоя (UI, уведомления)
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Входящее приглашение ждёт решения пользователя
    IncomingCall(CallInvite),
    InviteWithdrawn { call_id: String },
    InviteExpired { call_id: String },
    /// Исходящее приглашение отправлено
    Ringing { call_id: String, to: String },
    /// Встречные приглашения: своё отозвано, чужое принято
    GlareResolved { withdrawn: String, accepted: String },
    Negotiating { call_id: String },
    Connected { call_id: String },
    ConnectionProblem { call_id: String },
    Recovered { call_id: String },
    MediaToggled { call_id: String, kind: MediaKind, enabled: bool },
    RemoteMedia { call_id: String, kind: MediaKind },
    Ended { call_id: String, reason: String, record: CallRecord },
    Failed { call_id: String, error: CallError },
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::IncomingCall(_) => "incoming-call",
            CallEvent::InviteWithdrawn { .. } => "invite-withdrawn",
            CallEvent::InviteExpired { .. } => "invite-expired",
            CallEvent::Ringing { .. } => "ringing",
            CallEvent::GlareResolved { .. } => "glare-resolved",
            CallEvent::Negotiating { .. } => "negotiating",
            CallEvent::Connected { .. } => "connected",
            CallEvent::ConnectionProblem { .. } => "connection-problem",
            CallEvent::Recovered { .. } => "recovered",
            CallEvent::MediaToggled { .. } => "media-toggled",
            CallEvent::RemoteMedia { .. } => "remote-media",
            CallEvent::Ended { .. } => "ended",
            CallEvent::Failed { .. } => "failed",
        }
    }
}

/// Отправитель событий приложению; закрытый приёмник не ошибка
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: CallEvent) {
        tracing::debug!(target: "peercall::events", event = event.name(), "emit");
        if self.tx.send(event).is_err() {
            tracing::trace!(target: "peercall::events", "event receiver dropped");
        }
    }
}
