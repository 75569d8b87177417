use crate::peer::types::{Endpoint, Role};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Offering,
    Answering,
}

/// Состояние переговоров одного звонка.
///
/// `Idle → Negotiating(Offering|Answering) → Connecting → Connected →
/// Ending → Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating(NegotiationPhase),
    Connecting,
    Connected,
    Ending,
    Ended,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Ending | NegotiationState::Ended)
    }

    /// Переговоры начались: описание отправлено или принято
    pub fn has_started(self) -> bool {
        !matches!(self, NegotiationState::Idle)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Negotiating(NegotiationPhase::Offering) => "negotiating(offering)",
            NegotiationState::Negotiating(NegotiationPhase::Answering) => "negotiating(answering)",
            NegotiationState::Connecting => "connecting",
            NegotiationState::Connected => "connected",
            NegotiationState::Ending => "ending",
            NegotiationState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Снимок звонка. Меняется только `Negotiator`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: String,
    /// `None` до `assign_role`
    pub local_role: Option<Role>,
    pub remote: Endpoint,
    pub state: NegotiationState,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, remote: Endpoint) -> Self {
        Self {
            call_id: call_id.into(),
            local_role: None,
            remote,
            state: NegotiationState::Idle,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}
