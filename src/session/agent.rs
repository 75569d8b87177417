use super::{CallSessionManager, Services, REASON_HANGUP};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::{CallEvent, EventEmitter};
use crate::negotiation::NegotiatorContext;
use crate::peer::media::MediaKind;
use crate::peer::state::CallSession;
use crate::peer::types::{CallInvite, Endpoint};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_QUEUE: usize = 64;

enum Command {
    RequestCall {
        to: String,
        reply: oneshot::Sender<Result<String, CallError>>,
    },
    Accept {
        call_id: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        call_id: String,
        reason: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hangup {
        reason: String,
        reply: oneshot::Sender<()>,
    },
    SetMedia {
        kind: MediaKind,
        enabled: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Состояние менеджера на момент запроса
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub active: Option<CallSession>,
    pub pending_invites: Vec<CallInvite>,
    pub busy: bool,
}

/// Ручка приложения к циклу звонков; дешево клонируется
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::Sender<Command>,
}

impl CallHandle {
    /// Приглашает `to`; возвращает id звонка
    pub async fn request_call(&self, to: &str) -> Result<String, CallError> {
        self.ask(|reply| Command::RequestCall {
            to: to.to_string(),
            reply,
        })
        .await?
    }

    pub async fn accept(&self, call_id: &str) -> Result<(), CallError> {
        self.ask(|reply| Command::Accept {
            call_id: call_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn reject(&self, call_id: &str, reason: &str) -> Result<(), CallError> {
        self.ask(|reply| Command::Reject {
            call_id: call_id.to_string(),
            reason: reason.to_string(),
            reply,
        })
        .await?
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.hangup_with(REASON_HANGUP).await
    }

    pub async fn hangup_with(&self, reason: &str) -> Result<(), CallError> {
        self.ask(|reply| Command::Hangup {
            reason: reason.to_string(),
            reply,
        })
        .await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.set_media(MediaKind::Audio, enabled).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.set_media(MediaKind::Video, enabled).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, CallError> {
        self.ask(|reply| Command::Snapshot { reply }).await
    }

    /// Завершает звонок и останавливает цикл
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.ask(|reply| Command::Shutdown { reply }).await
    }

    async fn set_media(&self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        self.ask(|reply| Command::SetMedia {
            kind,
            enabled,
            reply,
        })
        .await?
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| CallError::InvalidState("call agent stopped".into()))?;
        rx.await
            .map_err(|_| CallError::InvalidState("call agent stopped".into()))
    }
}

/// Последовательный цикл: команды приложения, сигнальные сообщения,
/// события соединения и таймеры доходят до менеджера по одному.
pub struct CallAgent;

impl CallAgent {
    pub async fn start(
        local: Endpoint,
        services: Services,
        config: CallConfig,
    ) -> Result<(CallHandle, mpsc::UnboundedReceiver<CallEvent>, JoinHandle<()>), CallError> {
        config.validate()?;
        let signaling = Arc::clone(&services.platform.signaling);
        signaling.register(&local.id).await?;
        let mut subscription = signaling.subscribe();
        let mut disconnect = signaling.on_disconnect();

        let (events, events_rx) = EventEmitter::channel();
        let (timers, mut timer_rx) = mpsc::unbounded_channel();
        let (peer_events, mut peer_rx) = mpsc::unbounded_channel();
        let (tx, mut commands) = mpsc::channel(COMMAND_QUEUE);

        let ctx = NegotiatorContext {
            platform: services.platform.clone(),
            config: Arc::new(config),
            events,
            timers,
            peer_events,
        };
        let endpoint_id = local.id.clone();
        let mut manager = CallSessionManager::new(local, services, ctx);
        tracing::info!(target: "peercall::session", endpoint = %endpoint_id, "call agent started");

        let handle = tokio::spawn(async move {
            let mut signaling_open = true;
            let mut watching = true;
            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(Command::Shutdown { reply }) => {
                            manager.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => apply(&mut manager, command).await,
                        None => {
                            manager.shutdown().await;
                            break;
                        }
                    },
                    message = subscription.recv(), if signaling_open => match message {
                        Some(message) => manager.handle_message(message).await,
                        None => {
                            signaling_open = false;
                            manager.on_signaling_lost().await;
                        }
                    },
                    Some(event) = timer_rx.recv() => manager.on_timer(event).await,
                    Some(event) = peer_rx.recv() => manager.on_peer_event(event).await,
                    changed = disconnect.changed(), if watching => match changed {
                        Ok(()) => {
                            let lost = *disconnect.borrow_and_update();
                            if lost {
                                manager.on_signaling_lost().await;
                            }
                        }
                        Err(_) => watching = false,
                    },
                }
            }
            tracing::info!(target: "peercall::session", endpoint = %endpoint_id, "call agent stopped");
        });

        Ok((CallHandle { tx }, events_rx, handle))
    }
}

async fn apply(manager: &mut CallSessionManager, command: Command) {
    match command {
        Command::RequestCall { to, reply } => {
            let _ = reply.send(manager.request_call(&to).await);
        }
        Command::Accept { call_id, reply } => {
            let _ = reply.send(manager.accept_invite(&call_id).await);
        }
        Command::Reject {
            call_id,
            reason,
            reply,
        } => {
            let _ = reply.send(manager.reject_invite(&call_id, &reason).await);
        }
        Command::Hangup { reason, reply } => {
            manager.end_active_session(&reason).await;
            let _ = reply.send(());
        }
        Command::SetMedia {
            kind,
            enabled,
            reply,
        } => {
            let _ = reply.send(manager.set_media_enabled(kind, enabled).await);
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(Snapshot {
                active: manager.active_session().cloned(),
                pending_invites: manager.pending_invites(),
                busy: manager.is_busy(),
            });
        }
        // обрабатывается в цикле
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
