//! Автомат переговоров одного звонка.
//!
//! Владеет соединением платформы, локальным медиапотоком и буфером
//! отложенных кандидатов. Все переходы идут через `&mut self`, поэтому два
//! перехода одного звонка не могут выполняться одновременно; долгие шаги
//! (захват медиа, создание offer/answer) просто ожидаются внутри перехода.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::{dump_candidate, CallEvent, EventEmitter};
use crate::peer::connection::{PeerConnection, PeerConnector, PeerEventSender};
use crate::peer::ice::{analyze_candidates, apply_pending_candidates, CandidateBuffer};
use crate::peer::media::{MediaDevices, MediaKind, MediaStream};
use crate::peer::state::{CallSession, NegotiationPhase, NegotiationState};
use crate::peer::types::{ConnectionState, Endpoint, IceCandidate, Role, SdpKind, SessionDescription};
use crate::signaling::{MessageType, ReasonPayload, SignalingChannel, SignalingMessage};
use crate::timer::{TimerGuard, TimerKind, TimerSender};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Возможности платформы, нужные переговорам
#[derive(Clone)]
pub struct Platform {
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
}

/// Всё, что `Negotiator` получает от владельца
#[derive(Clone)]
pub struct NegotiatorContext {
    pub platform: Platform,
    pub config: Arc<CallConfig>,
    pub events: EventEmitter,
    pub timers: TimerSender,
    pub peer_events: PeerEventSender,
}

/// Итог обработки события соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionVerdict {
    Continue,
    Lost(&'static str),
}

pub const REASON_CONNECTION_LOST: &str = "connection-lost";
pub const REASON_CONNECTION_CLOSED: &str = "connection-closed";

pub struct Negotiator {
    local_id: String,
    session: CallSession,
    ctx: NegotiatorContext,
    peer: Option<Box<dyn PeerConnection>>,
    media: Option<MediaStream>,
    remote_description_set: bool,
    pending: CandidateBuffer,
    local_candidates: Vec<IceCandidate>,
    grace: Option<TimerGuard>,
}

impl Negotiator {
    pub fn new(ctx: NegotiatorContext, local_id: &str, call_id: &str, remote: Endpoint) -> Self {
        let capacity = ctx.config.candidate_buffer_capacity;
        Self {
            local_id: local_id.to_string(),
            session: CallSession::new(call_id, remote),
            ctx,
            peer: None,
            media: None,
            remote_description_set: false,
            pending: CandidateBuffer::new(capacity),
            local_candidates: Vec::new(),
            grace: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.session.call_id
    }

    pub fn remote_id(&self) -> &str {
        &self.session.remote.id
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn state(&self) -> NegotiationState {
        self.session.state
    }

    pub fn role(&self) -> Option<Role> {
        self.session.local_role
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn assign_role(&mut self, role: Role) -> Result<(), CallError> {
        if let Some(existing) = self.session.local_role {
            return Err(CallError::InvalidState(format!(
                "role already assigned as {existing:?}"
            )));
        }
        if self.session.state.has_started() {
            return Err(CallError::InvalidState(format!(
                "cannot assign role in state {}",
                self.session.state
            )));
        }
        self.session.local_role = Some(role);
        Ok(())
    }

    pub async fn start_as_caller(&mut self) -> Result<(), CallError> {
        match (self.session.state, self.session.local_role) {
            (NegotiationState::Idle, Some(Role::Caller)) => {}
            (state, role) => {
                return Err(CallError::InvalidState(format!(
                    "start_as_caller in state {state} with role {role:?}"
                )))
            }
        }

        // При ошибке захвата состояние остаётся Idle
        self.acquire_media().await?;
        let offer = self.ensure_peer().await?.create_offer().await?;
        self.set_state(NegotiationState::Negotiating(NegotiationPhase::Offering));
        self.ctx.events.emit(CallEvent::Negotiating {
            call_id: self.session.call_id.clone(),
        });
        self.send(MessageType::Offer, serde_json::to_value(&offer)?)
            .await
    }

    pub async fn handle_remote_offer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        if offer.kind != SdpKind::Offer {
            return Err(CallError::Malformed("offer message carries an answer".into()));
        }
        if self.session.state.is_terminal() {
            return Err(CallError::InvalidState(format!(
                "offer in state {}",
                self.session.state
            )));
        }

        if self.session.state == NegotiationState::Negotiating(NegotiationPhase::Offering) {
            // Glare: роль caller остаётся за меньшим id
            if self.local_id.as_str() < self.session.remote.id.as_str() {
                tracing::warn!(
                    target: "peercall::negotiation",
                    call_id = %self.session.call_id,
                    "glare: keeping caller role, remote offer ignored"
                );
                return Err(CallError::NegotiationConflict(format!(
                    "{} keeps the caller role",
                    self.local_id
                )));
            }
            tracing::info!(
                target: "peercall::negotiation",
                call_id = %self.session.call_id,
                "glare: yielding caller role to {}",
                self.session.remote.id
            );
            if let Some(peer) = &self.peer {
                peer.rollback().await?;
            }
            self.session.local_role = Some(Role::Callee);
            self.set_state(NegotiationState::Idle);
        }

        if self.remote_description_set {
            return Err(CallError::NegotiationConflict(
                "remote description already applied".into(),
            ));
        }
        match (self.session.state, self.session.local_role) {
            (NegotiationState::Idle, Some(Role::Callee)) => {}
            (NegotiationState::Idle, None) => {
                tracing::debug!(
                    target: "peercall::negotiation",
                    call_id = %self.session.call_id,
                    "offer before role assignment, acting as callee"
                );
                self.session.local_role = Some(Role::Callee);
            }
            (state, role) => {
                return Err(CallError::InvalidState(format!(
                    "offer in state {state} with role {role:?}"
                )))
            }
        }

        self.acquire_media().await?;
        self.ensure_peer().await?.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_pending().await;

        let answer = self.ensure_peer().await?.create_answer().await?;
        self.set_state(NegotiationState::Negotiating(NegotiationPhase::Answering));
        self.ctx.events.emit(CallEvent::Negotiating {
            call_id: self.session.call_id.clone(),
        });
        self.send(MessageType::Answer, serde_json::to_value(&answer)?)
            .await?;
        self.set_state(NegotiationState::Connecting);
        Ok(())
    }

    pub async fn handle_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        if self.session.state != NegotiationState::Negotiating(NegotiationPhase::Offering) {
            return Err(CallError::InvalidState(format!(
                "answer in state {}",
                self.session.state
            )));
        }
        if answer.kind != SdpKind::Answer {
            return Err(CallError::Malformed("answer message carries an offer".into()));
        }
        self.ensure_peer().await?.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.flush_pending().await;
        self.set_state(NegotiationState::Connecting);
        Ok(())
    }

    /// Никогда не роняет звонок: битые кандидаты только логируются
    pub async fn handle_remote_candidate(&mut self, payload: Value) {
        if self.session.state.is_terminal() {
            tracing::debug!(target: "peercall::ice", call_id = %self.session.call_id, "candidate after hangup ignored");
            return;
        }
        let candidate: IceCandidate = match serde_json::from_value(payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!(target: "peercall::ice", call_id = %self.session.call_id, "dropping malformed candidate: {e}");
                return;
            }
        };
        dump_candidate("REMOTE", &self.session.call_id, &candidate);

        match self.peer.as_deref() {
            Some(peer) if self.remote_description_set => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    tracing::warn!(target: "peercall::ice", call_id = %self.session.call_id, "failed to add ICE candidate: {e}");
                }
            }
            _ => {
                tracing::debug!(target: "peercall::ice", call_id = %self.session.call_id, "remote description not set yet, queuing candidate");
                if self.pending.push(candidate).is_some() {
                    tracing::warn!(
                        target: "peercall::ice",
                        call_id = %self.session.call_id,
                        dropped = self.pending.dropped(),
                        "candidate buffer full, oldest candidate dropped"
                    );
                }
            }
        }
    }

    pub async fn send_local_candidate(&mut self, candidate: IceCandidate) {
        if self.session.state.is_terminal() {
            return;
        }
        let payload = match serde_json::to_value(&candidate) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(target: "peercall::ice", "failed to encode local candidate: {e}");
                return;
            }
        };
        self.local_candidates.push(candidate);
        self.send_best_effort(MessageType::IceCandidate, payload)
            .await;
    }

    pub fn on_connection_state_change(&mut self, state: ConnectionState) -> ConnectionVerdict {
        if self.session.state.is_terminal() {
            return ConnectionVerdict::Continue;
        }
        tracing::debug!(
            target: "peercall::negotiation",
            call_id = %self.session.call_id,
            "underlying connection {state:?} in {}",
            self.session.state
        );
        match state {
            ConnectionState::Connected => {
                // отменяем отложенное завершение, если оно было
                let recovered = self.grace.take().is_some();
                if recovered {
                    self.ctx.events.emit(CallEvent::Recovered {
                        call_id: self.session.call_id.clone(),
                    });
                }
                if self.session.state != NegotiationState::Connected {
                    self.set_state(NegotiationState::Connected);
                    if self.session.connected_at.is_none() {
                        self.session.connected_at = Some(Utc::now());
                        analyze_candidates(&self.local_candidates);
                        self.ctx.events.emit(CallEvent::Connected {
                            call_id: self.session.call_id.clone(),
                        });
                    }
                }
            }
            ConnectionState::Connecting => {
                if let NegotiationState::Negotiating(_) = self.session.state {
                    self.set_state(NegotiationState::Connecting);
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                if self.grace.is_some() {
                    tracing::debug!(target: "peercall::negotiation", "grace period already running");
                } else {
                    tracing::warn!(
                        target: "peercall::negotiation",
                        call_id = %self.session.call_id,
                        "connection {state:?}, waiting {} ms for recovery",
                        self.ctx.config.reconnect_grace.as_millis()
                    );
                    self.grace = Some(TimerGuard::arm(
                        &self.ctx.timers,
                        &self.session.call_id,
                        TimerKind::ReconnectGrace,
                        self.ctx.config.reconnect_grace,
                    ));
                    self.ctx.events.emit(CallEvent::ConnectionProblem {
                        call_id: self.session.call_id.clone(),
                    });
                }
            }
            ConnectionState::Closed => return ConnectionVerdict::Lost(REASON_CONNECTION_CLOSED),
            ConnectionState::New => {}
        }
        ConnectionVerdict::Continue
    }

    /// Таймер grace period истёк; устаревшее срабатывание игнорируется
    pub fn on_grace_expired(&mut self) -> ConnectionVerdict {
        match self.grace.take() {
            Some(_) if !self.session.state.is_terminal() => {
                tracing::warn!(
                    target: "peercall::negotiation",
                    call_id = %self.session.call_id,
                    "connection not recovered within grace period"
                );
                ConnectionVerdict::Lost(REASON_CONNECTION_LOST)
            }
            _ => ConnectionVerdict::Continue,
        }
    }

    pub fn on_remote_track(&mut self, kind: MediaKind) {
        self.ctx.events.emit(CallEvent::RemoteMedia {
            call_id: self.session.call_id.clone(),
            kind,
        });
    }

    pub async fn set_audio_enabled(&mut self, enabled: bool) -> Result<(), CallError> {
        self.set_media_enabled(MediaKind::Audio, enabled).await
    }

    pub async fn set_video_enabled(&mut self, enabled: bool) -> Result<(), CallError> {
        self.set_media_enabled(MediaKind::Video, enabled).await
    }

    pub async fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        let Some(stream) = self.media.as_mut() else {
            return Err(CallError::InvalidState("no local media".into()));
        };
        if !stream.has(kind) {
            return Err(CallError::InvalidState(format!("no local {kind:?} track")));
        }
        stream.set_enabled(kind, enabled);
        self.ctx.platform.devices.set_enabled(stream, kind, enabled).await;
        self.ctx.events.emit(CallEvent::MediaToggled {
            call_id: self.session.call_id.clone(),
            kind,
            enabled,
        });
        Ok(())
    }

    /// Локальное завершение: `bye` удалённой стороне, затем очистка.
    /// Повторный вызов ничего не делает.
    pub async fn hangup(&mut self, reason: &str) {
        self.shutdown(reason, true).await;
    }

    /// Завершение по инициативе удалённой стороны, без `bye`
    pub async fn terminate(&mut self, reason: &str) {
        self.shutdown(reason, false).await;
    }

    async fn shutdown(&mut self, reason: &str, notify_remote: bool) {
        if self.session.state == NegotiationState::Ended {
            tracing::debug!(target: "peercall::negotiation", call_id = %self.session.call_id, "already ended");
            return;
        }
        self.set_state(NegotiationState::Ending);
        self.grace = None;

        if notify_remote {
            self.send_best_effort(MessageType::Bye, ReasonPayload::to_value(reason))
                .await;
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!(target: "peercall::negotiation", call_id = %self.session.call_id, "failed to close peer connection: {e}");
            }
        }
        if let Some(stream) = self.media.take() {
            self.ctx.platform.devices.stop(&stream).await;
        }
        if !self.pending.is_empty() {
            tracing::debug!(
                target: "peercall::ice",
                call_id = %self.session.call_id,
                discarded = self.pending.len(),
                "discarding pending candidates"
            );
            self.pending.clear();
        }
        self.session.ended_at = Some(Utc::now());
        self.set_state(NegotiationState::Ended);
        tracing::info!(target: "peercall::negotiation", call_id = %self.session.call_id, reason, "call ended");
    }

    async fn acquire_media(&mut self) -> Result<(), CallError> {
        if self.media.is_some() {
            return Ok(());
        }
        let stream = self
            .ctx
            .platform
            .devices
            .get_user_media(&self.ctx.config.media)
            .await
            .map_err(|e| match e {
                CallError::MediaAccess(_) => e,
                other => CallError::MediaAccess(other.to_string()),
            })?;
        if let Some(peer) = &self.peer {
            if let Err(e) = peer.add_stream(&stream).await {
                self.ctx.platform.devices.stop(&stream).await;
                return Err(e);
            }
        }
        tracing::debug!(target: "peercall::negotiation", call_id = %self.session.call_id, stream = %stream.id, "local media acquired");
        self.media = Some(stream);
        Ok(())
    }

    async fn ensure_peer(&mut self) -> Result<&dyn PeerConnection, CallError> {
        if self.peer.is_none() {
            let peer = self
                .ctx
                .platform
                .connector
                .open(&self.session.call_id, self.ctx.peer_events.clone())
                .await?;
            if let Some(stream) = &self.media {
                peer.add_stream(stream).await?;
            }
            self.peer = Some(peer);
        }
        self.peer
            .as_deref()
            .ok_or_else(|| CallError::InvalidState("peer connection missing".into()))
    }

    async fn flush_pending(&mut self) {
        if let Some(peer) = self.peer.as_deref() {
            apply_pending_candidates(&self.session.call_id, peer, &mut self.pending).await;
        }
    }

    fn set_state(&mut self, next: NegotiationState) {
        tracing::debug!(
            target: "peercall::negotiation",
            call_id = %self.session.call_id,
            "{} -> {}",
            self.session.state,
            next
        );
        self.session.state = next;
    }

    fn message(&self, kind: MessageType, payload: Value) -> SignalingMessage {
        SignalingMessage::new(
            kind,
            self.session.call_id.clone(),
            self.local_id.clone(),
            self.session.remote.id.clone(),
            payload,
        )
    }

    async fn send(&self, kind: MessageType, payload: Value) -> Result<(), CallError> {
        let message = self.message(kind, payload);
        self.ctx
            .platform
            .signaling
            .send(&self.session.remote.id, message)
            .await
            .map_err(CallError::from)
    }

    async fn send_best_effort(&self, kind: MessageType, payload: Value) {
        if let Err(e) = self.send(kind, payload).await {
            tracing::warn!(
                target: "peercall::negotiation",
                call_id = %self.session.call_id,
                "best-effort {kind:?} not delivered: {e}"
            );
        }
    }
}
