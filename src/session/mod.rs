//! Менеджер звонков локального endpoint.
//!
//! Не больше одной активной сессии. Приглашения (invite/accept/reject)
//! идут через тот же сигнальный канал, что и offer/answer. Все методы
//! вызываются из цикла `CallAgent` по одному.

pub mod agent;

#[cfg(test)]
mod tests;

pub use agent::{CallAgent, CallHandle, Snapshot};

use crate::directory::{label_endpoint, Directory};
use crate::error::CallError;
use crate::logger::CallEvent;
use crate::negotiation::{ConnectionVerdict, Negotiator, NegotiatorContext, Platform};
use crate::peer::connection::{PeerEvent, PeerEventKind};
use crate::peer::media::MediaKind;
use crate::peer::state::{CallSession, NegotiationState};
use crate::peer::types::{CallInvite, Endpoint, Role, SessionDescription};
use crate::record::{CallRecord, CallRecordSink};
use crate::signaling::{
    InvitePayload, MessageType, ReasonPayload, SignalingMessage, REASON_BUSY, REASON_TIMEOUT,
};
use crate::timer::{TimerEvent, TimerGuard, TimerKind};
use crate::utils::random_id;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub const REASON_HANGUP: &str = "hangup";
pub const REASON_REMOTE_HANGUP: &str = "remote-hangup";
pub const REASON_SIGNALING_LOST: &str = "signaling-lost";
pub const REASON_FAILED: &str = "failed";
pub const REASON_WITHDRAWN: &str = "withdrawn";
pub const REASON_SHUTDOWN: &str = "shutdown";

/// Сколько завершённых call_id помнить для поздних сообщений
const CLOSED_CALLS_KEPT: usize = 32;

/// Внешние зависимости менеджера
#[derive(Clone)]
pub struct Services {
    pub platform: Platform,
    pub directory: Arc<dyn Directory>,
    pub records: Arc<dyn CallRecordSink>,
}

struct OutgoingInvite {
    session: CallSession,
    _expiry: TimerGuard,
}

struct IncomingInvite {
    invite: CallInvite,
    _expiry: TimerGuard,
}

pub struct CallSessionManager {
    local: Endpoint,
    services: Services,
    ctx: NegotiatorContext,
    outgoing: Option<OutgoingInvite>,
    incoming: HashMap<String, IncomingInvite>,
    active: Option<Negotiator>,
    /// Срок на переговоры: от accept до `Connected`
    deadline: Option<TimerGuard>,
    closed: VecDeque<String>,
}

impl CallSessionManager {
    pub fn new(local: Endpoint, services: Services, ctx: NegotiatorContext) -> Self {
        Self {
            local,
            services,
            ctx,
            outgoing: None,
            incoming: HashMap::new(),
            active: None,
            deadline: None,
            closed: VecDeque::new(),
        }
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn active_session(&self) -> Option<&CallSession> {
        self.active.as_ref().map(Negotiator::session)
    }

    /// Занят: идёт звонок или ждём ответа на своё приглашение
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || self.outgoing.is_some()
    }

    pub fn pending_invites(&self) -> Vec<CallInvite> {
        let mut invites: Vec<CallInvite> =
            self.incoming.values().map(|p| p.invite.clone()).collect();
        invites.sort_by_key(|invite| invite.created_at);
        invites
    }

    pub async fn request_call(&mut self, to_id: &str) -> Result<String, CallError> {
        if self.is_busy() {
            return Err(CallError::AlreadyInCall);
        }
        if to_id == self.local.id {
            return Err(CallError::InvalidState("cannot call yourself".into()));
        }
        // Они уже пригласили нас: меньший id остаётся caller
        let crossing = self
            .incoming
            .values()
            .find(|p| p.invite.from_endpoint.id == to_id)
            .map(|p| p.invite.call_id.clone());
        if let Some(theirs) = crossing {
            if self.local.id.as_str() > to_id {
                tracing::info!(target: "peercall::session", call_id = %theirs, "invite glare: accepting pending invite instead");
                self.accept_invite(&theirs).await?;
                return Ok(theirs);
            }
            self.incoming.remove(&theirs);
            self.ctx.events.emit(CallEvent::InviteWithdrawn { call_id: theirs });
        }
        let remote = label_endpoint(self.services.directory.as_ref(), to_id).await;

        let call_id = random_id();
        let payload = serde_json::to_value(InvitePayload {
            display_name: self.local.display_name.clone(),
            created_at: Utc::now(),
        })?;
        let invite = SignalingMessage::new(
            MessageType::Invite,
            call_id.clone(),
            self.local.id.clone(),
            to_id,
            payload,
        );
        self.services.platform.signaling.send(to_id, invite).await?;

        let mut session = CallSession::new(call_id.clone(), remote);
        session.local_role = Some(Role::Caller);
        let expiry = TimerGuard::arm(
            &self.ctx.timers,
            &call_id,
            TimerKind::OutgoingInvite,
            self.ctx.config.invite_timeout,
        );
        self.outgoing = Some(OutgoingInvite {
            session,
            _expiry: expiry,
        });
        tracing::info!(target: "peercall::session", call_id = %call_id, to = to_id, "invite sent");
        self.ctx.events.emit(CallEvent::Ringing {
            call_id: call_id.clone(),
            to: to_id.to_string(),
        });
        Ok(call_id)
    }

    pub async fn accept_invite(&mut self, call_id: &str) -> Result<(), CallError> {
        if self.active.is_some() {
            return Err(CallError::AlreadyInCall);
        }
        let Some(pending) = self.incoming.remove(call_id) else {
            return Err(CallError::UnknownCall(call_id.to_string()));
        };
        if self.outgoing.is_some() {
            self.withdraw_outgoing(REASON_WITHDRAWN).await;
        }
        self.begin_as_callee(pending.invite).await
    }

    pub async fn reject_invite(&mut self, call_id: &str, reason: &str) -> Result<(), CallError> {
        let Some(pending) = self.incoming.remove(call_id) else {
            return Err(CallError::UnknownCall(call_id.to_string()));
        };
        tracing::info!(target: "peercall::session", call_id, reason, "invite rejected");
        self.remember_closed(call_id);
        self.send_control(
            MessageType::Reject,
            call_id,
            &pending.invite.from_endpoint.id,
            ReasonPayload::to_value(reason),
        )
        .await;
        Ok(())
    }

    /// Завершает текущий звонок или отзывает своё приглашение.
    /// Без звонка ничего не делает.
    pub async fn end_active_session(&mut self, reason: &str) {
        if self.active.is_some() {
            self.end_active(reason).await;
        } else if self.outgoing.is_some() {
            self.withdraw_outgoing(reason).await;
        } else {
            tracing::debug!(target: "peercall::session", "no call to end");
        }
    }

    pub async fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        match self.active.as_mut() {
            Some(negotiator) => negotiator.set_media_enabled(kind, enabled).await,
            None => Err(CallError::InvalidState("no active call".into())),
        }
    }

    pub async fn handle_message(&mut self, message: SignalingMessage) {
        if message.to_id != self.local.id {
            tracing::warn!(
                target: "peercall::session",
                to = %message.to_id,
                "message for another endpoint dropped"
            );
            return;
        }
        tracing::debug!(
            target: "peercall::session",
            kind = ?message.kind,
            call_id = %message.call_id,
            from = %message.from_id,
            "inbound"
        );
        match message.kind {
            MessageType::Invite => self.on_incoming_invite(message).await,
            MessageType::Accept => self.on_invite_accepted(message).await,
            MessageType::Reject => self.on_invite_rejected(message),
            MessageType::Bye => self.on_bye(message).await,
            MessageType::Offer | MessageType::Answer | MessageType::IceCandidate => {
                self.on_negotiation_message(message).await
            }
        }
    }

    pub async fn on_timer(&mut self, event: TimerEvent) {
        match event.kind {
            TimerKind::OutgoingInvite => {
                let current = self
                    .outgoing
                    .as_ref()
                    .is_some_and(|o| o.session.call_id == event.call_id);
                if !current {
                    return;
                }
                if let Some(outgoing) = self.outgoing.take() {
                    tracing::warn!(target: "peercall::session", call_id = %event.call_id, "invite not answered in time");
                    self.send_control(
                        MessageType::Bye,
                        &outgoing.session.call_id,
                        &outgoing.session.remote.id,
                        ReasonPayload::to_value(REASON_TIMEOUT),
                    )
                    .await;
                    self.fail_outgoing(outgoing, CallError::CallTimeout, REASON_TIMEOUT);
                }
            }
            TimerKind::IncomingInvite => {
                if let Some(pending) = self.incoming.remove(&event.call_id) {
                    tracing::info!(target: "peercall::session", call_id = %event.call_id, "incoming invite expired");
                    self.remember_closed(&event.call_id);
                    self.send_control(
                        MessageType::Reject,
                        &event.call_id,
                        &pending.invite.from_endpoint.id,
                        ReasonPayload::to_value(REASON_TIMEOUT),
                    )
                    .await;
                    self.ctx.events.emit(CallEvent::InviteExpired {
                        call_id: event.call_id,
                    });
                }
            }
            TimerKind::NegotiationDeadline => {
                let stalled = self
                    .active_for(&event.call_id)
                    .is_some_and(|n| n.session().connected_at.is_none());
                if stalled {
                    tracing::warn!(target: "peercall::session", call_id = %event.call_id, "negotiation did not complete in time");
                    self.fail_active(CallError::CallTimeout).await;
                }
            }
            TimerKind::ReconnectGrace => {
                let verdict = match self.active_for(&event.call_id) {
                    Some(negotiator) => negotiator.on_grace_expired(),
                    None => return,
                };
                if let ConnectionVerdict::Lost(reason) = verdict {
                    self.end_active(reason).await;
                }
            }
        }
    }

    pub async fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(negotiator) = self.active_for(&event.call_id) else {
            tracing::trace!(target: "peercall::session", call_id = %event.call_id, "peer event for finished call");
            return;
        };
        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                negotiator.send_local_candidate(candidate).await;
            }
            PeerEventKind::StateChanged(state) => {
                let verdict = negotiator.on_connection_state_change(state);
                if negotiator.state() == NegotiationState::Connected {
                    self.deadline = None;
                }
                if let ConnectionVerdict::Lost(reason) = verdict {
                    self.end_active(reason).await;
                }
            }
            PeerEventKind::RemoteTrack(kind) => negotiator.on_remote_track(kind),
        }
    }

    /// Потеря сигнального канала: звонок без него не переживёт пересогласование
    pub async fn on_signaling_lost(&mut self) {
        tracing::warn!(target: "peercall::session", endpoint = %self.local.id, "signaling connection lost");
        if let Some(mut negotiator) = self.take_active() {
            negotiator.terminate(REASON_SIGNALING_LOST).await;
            self.finish(negotiator.session(), REASON_SIGNALING_LOST);
        }
        if let Some(outgoing) = self.outgoing.take() {
            self.fail_outgoing(
                outgoing,
                CallError::Transport("signaling connection lost".into()),
                REASON_SIGNALING_LOST,
            );
        }
        for (call_id, _) in self.incoming.drain() {
            self.ctx.events.emit(CallEvent::InviteWithdrawn { call_id });
        }
    }

    pub async fn shutdown(&mut self) {
        self.end_active_session(REASON_SHUTDOWN).await;
        let pending: Vec<CallInvite> = self.incoming.drain().map(|(_, p)| p.invite).collect();
        for invite in pending {
            self.send_control(
                MessageType::Reject,
                &invite.call_id,
                &invite.from_endpoint.id,
                ReasonPayload::to_value(REASON_SHUTDOWN),
            )
            .await;
        }
    }

    async fn on_incoming_invite(&mut self, message: SignalingMessage) {
        let payload: InvitePayload = match message.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(target: "peercall::session", "dropping invite: {e}");
                return;
            }
        };
        let known = self.incoming.contains_key(&message.call_id)
            || self.active_session().is_some_and(|s| s.call_id == message.call_id);
        if known {
            tracing::debug!(target: "peercall::session", call_id = %message.call_id, "duplicate invite");
            return;
        }
        if self.is_closed(&message.call_id) {
            tracing::debug!(target: "peercall::session", call_id = %message.call_id, "invite for closed call ignored");
            return;
        }

        // Встречные приглашения: приглашение меньшего id выигрывает
        let glare = self
            .outgoing
            .as_ref()
            .filter(|o| self.active.is_none() && o.session.remote.id == message.from_id)
            .map(|o| o.session.call_id.clone());
        if let Some(withdrawn) = glare {
            if self.local.id < message.from_id {
                tracing::info!(
                    target: "peercall::session",
                    ours = %withdrawn,
                    theirs = %message.call_id,
                    "invite glare: keeping own invite"
                );
                return;
            }
            tracing::info!(
                target: "peercall::session",
                ours = %withdrawn,
                theirs = %message.call_id,
                "invite glare: accepting remote invite"
            );
            if let Some(outgoing) = self.outgoing.take() {
                self.close_outgoing(outgoing, REASON_WITHDRAWN);
            }
            self.ctx.events.emit(CallEvent::GlareResolved {
                withdrawn,
                accepted: message.call_id.clone(),
            });
            let invite = self.build_invite(&message, payload).await;
            let call_id = invite.call_id.clone();
            if let Err(error) = self.begin_as_callee(invite).await {
                self.ctx.events.emit(CallEvent::Failed { call_id, error });
            }
            return;
        }

        if self.is_busy() {
            tracing::info!(
                target: "peercall::session",
                call_id = %message.call_id,
                from = %message.from_id,
                "busy, invite auto-rejected"
            );
            self.send_control(
                MessageType::Reject,
                &message.call_id,
                &message.from_id,
                ReasonPayload::to_value(REASON_BUSY),
            )
            .await;
            return;
        }

        let invite = self.build_invite(&message, payload).await;
        let expiry = TimerGuard::arm(
            &self.ctx.timers,
            &invite.call_id,
            TimerKind::IncomingInvite,
            self.ctx.config.invite_timeout,
        );
        tracing::info!(
            target: "peercall::session",
            call_id = %invite.call_id,
            from = %invite.from_endpoint.id,
            "incoming call"
        );
        self.incoming.insert(
            invite.call_id.clone(),
            IncomingInvite {
                invite: invite.clone(),
                _expiry: expiry,
            },
        );
        self.ctx.events.emit(CallEvent::IncomingCall(invite));
    }

    async fn build_invite(&self, message: &SignalingMessage, payload: InvitePayload) -> CallInvite {
        let from = label_endpoint(self.services.directory.as_ref(), &message.from_id).await;
        CallInvite {
            call_id: message.call_id.clone(),
            from_endpoint: from,
            to_endpoint_id: message.to_id.clone(),
            created_at: payload.created_at,
        }
    }

    async fn begin_as_callee(&mut self, invite: CallInvite) -> Result<(), CallError> {
        let others: Vec<CallInvite> = self.incoming.drain().map(|(_, p)| p.invite).collect();
        for other in others {
            self.send_control(
                MessageType::Reject,
                &other.call_id,
                &other.from_endpoint.id,
                ReasonPayload::to_value(REASON_BUSY),
            )
            .await;
        }

        let mut negotiator = Negotiator::new(
            self.ctx.clone(),
            &self.local.id,
            &invite.call_id,
            invite.from_endpoint.clone(),
        );
        negotiator.assign_role(Role::Callee)?;
        let accept = SignalingMessage::new(
            MessageType::Accept,
            invite.call_id.clone(),
            self.local.id.clone(),
            invite.from_endpoint.id.clone(),
            Value::Null,
        );
        self.services
            .platform
            .signaling
            .send(&invite.from_endpoint.id, accept)
            .await?;
        tracing::info!(target: "peercall::session", call_id = %invite.call_id, "invite accepted, waiting for offer");
        self.set_active(negotiator);
        Ok(())
    }

    async fn on_invite_accepted(&mut self, message: SignalingMessage) {
        let current = self.outgoing.as_ref().is_some_and(|o| {
            o.session.call_id == message.call_id && o.session.remote.id == message.from_id
        });
        if !current {
            if self.is_closed(&message.call_id) {
                tracing::info!(target: "peercall::session", call_id = %message.call_id, "late accept for closed call, sending bye");
                self.send_control(
                    MessageType::Bye,
                    &message.call_id,
                    &message.from_id,
                    ReasonPayload::to_value(REASON_WITHDRAWN),
                )
                .await;
            } else {
                tracing::warn!(target: "peercall::session", call_id = %message.call_id, "stray accept dropped");
            }
            return;
        }
        let Some(outgoing) = self.outgoing.take() else {
            return;
        };
        let mut negotiator = Negotiator::new(
            self.ctx.clone(),
            &self.local.id,
            &outgoing.session.call_id,
            outgoing.session.remote.clone(),
        );
        let started = match negotiator.assign_role(Role::Caller) {
            Ok(()) => negotiator.start_as_caller().await,
            Err(e) => Err(e),
        };
        self.set_active(negotiator);
        if let Err(error) = started {
            self.fail_active(error).await;
        }
    }

    fn on_invite_rejected(&mut self, message: SignalingMessage) {
        let current = self.outgoing.as_ref().is_some_and(|o| {
            o.session.call_id == message.call_id && o.session.remote.id == message.from_id
        });
        if !current {
            tracing::warn!(target: "peercall::session", call_id = %message.call_id, "stray reject dropped");
            return;
        }
        let reason = message
            .payload_as::<ReasonPayload>()
            .map(|p| p.reason)
            .unwrap_or_default();
        if let Some(outgoing) = self.outgoing.take() {
            let error = if reason == REASON_BUSY {
                CallError::Busy
            } else if reason == REASON_TIMEOUT {
                CallError::CallTimeout
            } else {
                CallError::CallDeclined {
                    reason: reason.clone(),
                }
            };
            let end_reason = if reason.is_empty() { "declined" } else { reason.as_str() };
            self.fail_outgoing(outgoing, error, end_reason);
        }
    }

    async fn on_bye(&mut self, message: SignalingMessage) {
        let reason = message
            .payload_as::<ReasonPayload>()
            .ok()
            .map(|p| p.reason)
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| REASON_REMOTE_HANGUP.to_string());

        let is_active = self
            .active
            .as_ref()
            .is_some_and(|n| n.call_id() == message.call_id && n.remote_id() == message.from_id);
        if is_active {
            if let Some(mut negotiator) = self.take_active() {
                tracing::info!(target: "peercall::session", call_id = %message.call_id, reason = %reason, "remote hung up");
                negotiator.terminate(&reason).await;
                self.finish(negotiator.session(), &reason);
            }
            return;
        }

        let withdrawn = self
            .incoming
            .get(&message.call_id)
            .is_some_and(|p| p.invite.from_endpoint.id == message.from_id);
        if withdrawn {
            self.incoming.remove(&message.call_id);
            tracing::info!(target: "peercall::session", call_id = %message.call_id, "invite withdrawn by caller");
            self.ctx.events.emit(CallEvent::InviteWithdrawn {
                call_id: message.call_id,
            });
            return;
        }

        // bye обогнал accept: вызываемый уже принял и положил трубку
        let ended_by_callee = self.outgoing.as_ref().is_some_and(|o| {
            o.session.call_id == message.call_id && o.session.remote.id == message.from_id
        });
        if ended_by_callee {
            if let Some(outgoing) = self.outgoing.take() {
                tracing::info!(target: "peercall::session", call_id = %message.call_id, reason = %reason, "callee ended call before accept arrived");
                let error = CallError::CallDeclined {
                    reason: reason.clone(),
                };
                self.fail_outgoing(outgoing, error, &reason);
            }
            return;
        }

        tracing::debug!(target: "peercall::session", call_id = %message.call_id, "bye for unknown call, remembered");
        self.remember_closed(&message.call_id);
    }

    async fn on_negotiation_message(&mut self, message: SignalingMessage) {
        let kind = message.kind;
        if self.active_for(&message.call_id).is_none() {
            let description = matches!(kind, MessageType::Offer | MessageType::Answer);
            if description && self.is_closed(&message.call_id) {
                tracing::info!(target: "peercall::session", kind = ?kind, call_id = %message.call_id, "description for closed call, sending bye");
                self.send_control(
                    MessageType::Bye,
                    &message.call_id,
                    &message.from_id,
                    ReasonPayload::to_value(REASON_HANGUP),
                )
                .await;
            } else {
                tracing::warn!(target: "peercall::session", kind = ?kind, call_id = %message.call_id, "message for unknown call dropped");
            }
            return;
        }
        let Some(negotiator) = self.active_for(&message.call_id) else {
            return;
        };
        if negotiator.remote_id() != message.from_id {
            tracing::warn!(target: "peercall::session", kind = ?kind, from = %message.from_id, "message from unexpected endpoint dropped");
            return;
        }
        let result = match kind {
            MessageType::Offer => match message.payload_as::<SessionDescription>() {
                Ok(offer) => negotiator.handle_remote_offer(offer).await,
                Err(e) => Err(e),
            },
            MessageType::Answer => match message.payload_as::<SessionDescription>() {
                Ok(answer) => negotiator.handle_remote_answer(answer).await,
                Err(e) => Err(e),
            },
            _ => {
                negotiator.handle_remote_candidate(message.payload).await;
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(
                e @ (CallError::InvalidState(_)
                | CallError::NegotiationConflict(_)
                | CallError::Malformed(_)),
            ) => {
                tracing::warn!(target: "peercall::session", kind = ?kind, "message dropped: {e}");
            }
            Err(e) => self.fail_active(e).await,
        }
    }

    fn active_for(&mut self, call_id: &str) -> Option<&mut Negotiator> {
        self.active.as_mut().filter(|n| n.call_id() == call_id)
    }

    fn set_active(&mut self, negotiator: Negotiator) {
        self.deadline = Some(TimerGuard::arm(
            &self.ctx.timers,
            negotiator.call_id(),
            TimerKind::NegotiationDeadline,
            self.ctx.config.invite_timeout,
        ));
        self.active = Some(negotiator);
    }

    fn take_active(&mut self) -> Option<Negotiator> {
        self.deadline = None;
        self.active.take()
    }

    async fn end_active(&mut self, reason: &str) {
        if let Some(mut negotiator) = self.take_active() {
            negotiator.hangup(reason).await;
            self.finish(negotiator.session(), reason);
        }
    }

    async fn fail_active(&mut self, error: CallError) {
        if let Some(mut negotiator) = self.take_active() {
            let call_id = negotiator.call_id().to_string();
            tracing::warn!(target: "peercall::session", call_id = %call_id, "call failed: {error}");
            negotiator.hangup(REASON_FAILED).await;
            self.ctx.events.emit(CallEvent::Failed { call_id, error });
            self.finish(negotiator.session(), REASON_FAILED);
        }
    }

    async fn withdraw_outgoing(&mut self, reason: &str) {
        if let Some(outgoing) = self.outgoing.take() {
            tracing::info!(target: "peercall::session", call_id = %outgoing.session.call_id, "invite withdrawn");
            self.send_control(
                MessageType::Bye,
                &outgoing.session.call_id,
                &outgoing.session.remote.id,
                ReasonPayload::to_value(reason),
            )
            .await;
            self.close_outgoing(outgoing, reason);
        }
    }

    fn close_outgoing(&mut self, outgoing: OutgoingInvite, reason: &str) {
        let mut session = outgoing.session;
        session.ended_at = Some(Utc::now());
        session.state = NegotiationState::Ended;
        self.finish(&session, reason);
    }

    fn fail_outgoing(&mut self, outgoing: OutgoingInvite, error: CallError, reason: &str) {
        let mut session = outgoing.session;
        session.ended_at = Some(Utc::now());
        session.state = NegotiationState::Ended;
        tracing::info!(target: "peercall::session", call_id = %session.call_id, "outgoing call failed: {error}");
        self.ctx.events.emit(CallEvent::Failed {
            call_id: session.call_id.clone(),
            error,
        });
        self.finish(&session, reason);
    }

    fn finish(&mut self, session: &CallSession, reason: &str) {
        self.remember_closed(&session.call_id);
        let record = CallRecord::from_session(&self.local.id, session, reason);
        self.services.records.record(record.clone());
        self.ctx.events.emit(CallEvent::Ended {
            call_id: session.call_id.clone(),
            reason: reason.to_string(),
            record,
        });
    }

    fn remember_closed(&mut self, call_id: &str) {
        if self.is_closed(call_id) {
            return;
        }
        if self.closed.len() >= CLOSED_CALLS_KEPT {
            self.closed.pop_front();
        }
        self.closed.push_back(call_id.to_string());
    }

    fn is_closed(&self, call_id: &str) -> bool {
        self.closed.iter().any(|id| id == call_id)
    }

    async fn send_control(&self, kind: MessageType, call_id: &str, to: &str, payload: Value) {
        let message = SignalingMessage::new(kind, call_id, self.local.id.clone(), to, payload);
        if let Err(e) = self.services.platform.signaling.send(to, message).await {
            tracing::warn!(target: "peercall::session", call_id, "{kind:?} not delivered: {e}");
        }
    }
}
