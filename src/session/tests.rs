use super::*;
use crate::config::CallConfig;
use crate::directory::StaticDirectory;
use crate::logger::EventEmitter;
use crate::peer::connection::PeerEvent;
use crate::peer::state::NegotiationPhase;
use crate::peer::types::ConnectionState;
use crate::record::ChannelSink;
use crate::signaling::{LocalRelay, SignalingChannel, Subscription};
use crate::testing::{fake_platform, FakeConnector, FakeDevices, PeerOp};
use serde_json::json;
use tokio::sync::mpsc;

/// Менеджер без агента: доставку сообщений тест делает вручную
struct Side {
    manager: CallSessionManager,
    inbox: Subscription,
    events: mpsc::UnboundedReceiver<CallEvent>,
    records: mpsc::UnboundedReceiver<CallRecord>,
    devices: Arc<FakeDevices>,
    connector: Arc<FakeConnector>,
    _timers: mpsc::UnboundedReceiver<TimerEvent>,
    _peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Side {
    async fn new(relay: &LocalRelay, id: &str) -> Self {
        let connector = FakeConnector::manual();
        let (platform, devices) = fake_platform(relay, id, connector.clone()).await.unwrap();
        let inbox = platform.signaling.subscribe();
        let directory = StaticDirectory::new();
        directory.insert("p1", "Patient One");
        directory.insert("p2", "Patient Two");
        directory.insert("d1", "Dr. Ada");
        let (records, records_rx) = ChannelSink::new();
        let (events, events_rx) = EventEmitter::channel();
        let (timers, timers_rx) = mpsc::unbounded_channel();
        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        let services = Services {
            platform: platform.clone(),
            directory: Arc::new(directory),
            records: Arc::new(records),
        };
        let ctx = NegotiatorContext {
            platform,
            config: Arc::new(CallConfig::default()),
            events,
            timers,
            peer_events,
        };
        Self {
            manager: CallSessionManager::new(Endpoint::new(id, id.to_uppercase()), services, ctx),
            inbox,
            events: events_rx,
            records: records_rx,
            devices,
            connector,
            _timers: timers_rx,
            _peer_events: peer_rx,
        }
    }

    /// Доставляет всё, что уже пришло
    async fn pump(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(message) = self.inbox.try_recv() {
            self.manager.handle_message(message).await;
            delivered += 1;
        }
        delivered
    }

    fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn state(&self) -> Option<NegotiationState> {
        self.manager.active_session().map(|s| s.state)
    }

    fn role(&self) -> Option<Role> {
        self.manager.active_session().and_then(|s| s.local_role)
    }
}

fn incoming_call_id(events: &[CallEvent]) -> String {
    events
        .iter()
        .find_map(|e| match e {
            CallEvent::IncomingCall(invite) => Some(invite.call_id.clone()),
            _ => None,
        })
        .expect("no incoming call event")
}

/// p1 звонит d1, d1 принимает, offer/answer доставлены
async fn connect(p1: &mut Side, d1: &mut Side) -> String {
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    d1.manager.accept_invite(&call_id).await.unwrap();
    p1.pump().await; // accept -> offer
    d1.pump().await; // offer -> answer
    p1.pump().await; // answer
    call_id
}

#[tokio::test]
async fn second_request_while_ringing_is_already_in_call() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let _d1 = Side::new(&relay, "d1").await;
    p1.manager.request_call("d1").await.unwrap();
    assert_eq!(
        p1.manager.request_call("d1").await,
        Err(CallError::AlreadyInCall)
    );
    let events = p1.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], CallEvent::Ringing { to, .. } if to == "d1"));
}

#[tokio::test]
async fn invite_is_labelled_and_accept_starts_negotiation() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;

    let events = d1.drain_events();
    match &events[0] {
        CallEvent::IncomingCall(invite) => {
            assert_eq!(invite.call_id, call_id);
            assert_eq!(invite.from_endpoint.display_name, "Patient One");
            assert_eq!(invite.to_endpoint_id, "d1");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(d1.manager.pending_invites().len(), 1);
    // без accept звонок не начинается
    assert!(d1.manager.active_session().is_none());

    d1.manager.accept_invite(&call_id).await.unwrap();
    assert_eq!(d1.role(), Some(Role::Callee));
    assert_eq!(d1.state(), Some(NegotiationState::Idle));
    assert!(matches!(
        d1.manager.accept_invite(&call_id).await,
        Err(CallError::AlreadyInCall)
    ));

    p1.pump().await;
    assert_eq!(p1.role(), Some(Role::Caller));
    assert_eq!(
        p1.state(),
        Some(NegotiationState::Negotiating(NegotiationPhase::Offering))
    );
    d1.pump().await;
    assert_eq!(d1.state(), Some(NegotiationState::Connecting));
    p1.pump().await;
    assert_eq!(p1.state(), Some(NegotiationState::Connecting));
}

#[tokio::test]
async fn glare_smaller_id_stays_caller_when_its_invite_lands_first() {
    let relay = LocalRelay::new();
    let mut a = Side::new(&relay, "a").await;
    let mut b = Side::new(&relay, "b").await;
    let ours = a.manager.request_call("b").await.unwrap();
    let theirs = b.manager.request_call("a").await.unwrap();

    b.pump().await; // b видит приглашение a и уступает
    let events = b.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::GlareResolved { withdrawn, accepted } if *withdrawn == theirs && *accepted == ours
    )));
    a.pump().await; // приглашение b игнорируется, accept запускает offer
    b.pump().await;
    a.pump().await;

    assert_eq!(a.role(), Some(Role::Caller));
    assert_eq!(b.role(), Some(Role::Callee));
    assert_eq!(a.manager.active_session().unwrap().call_id, ours);
    assert_eq!(a.state(), Some(NegotiationState::Connecting));
    assert_eq!(b.state(), Some(NegotiationState::Connecting));
}

#[tokio::test]
async fn glare_smaller_id_stays_caller_when_remote_invite_lands_first() {
    let relay = LocalRelay::new();
    let mut a = Side::new(&relay, "a").await;
    let mut b = Side::new(&relay, "b").await;
    let ours = a.manager.request_call("b").await.unwrap();
    let theirs = b.manager.request_call("a").await.unwrap();

    a.pump().await; // приглашение b приходит первым и игнорируется
    assert!(a.drain_events().iter().all(|e| !matches!(e, CallEvent::IncomingCall(_))));
    assert!(a.manager.active_session().is_none());

    b.pump().await;
    // отозванное приглашение b всё равно завершается записью
    let withdrawn = b.records.try_recv().unwrap();
    assert_eq!(withdrawn.call_id, theirs);
    assert_eq!(withdrawn.end_reason, REASON_WITHDRAWN);
    assert!(b.drain_events().iter().any(|e| matches!(
        e,
        CallEvent::Ended { call_id, .. } if *call_id == theirs
    )));
    a.pump().await;
    b.pump().await;
    a.pump().await;

    assert_eq!(a.role(), Some(Role::Caller));
    assert_eq!(b.role(), Some(Role::Callee));
    assert_eq!(b.manager.active_session().unwrap().call_id, ours);
}

#[tokio::test]
async fn calling_back_a_pending_inviter_resolves_by_id() {
    let relay = LocalRelay::new();
    let mut a = Side::new(&relay, "a").await;
    let mut b = Side::new(&relay, "b").await;
    let ours = a.manager.request_call("b").await.unwrap();
    b.pump().await;

    // b уже видит приглашение и сам звонит a: принимает вместо нового invite
    assert_eq!(b.manager.request_call("a").await.unwrap(), ours);
    assert_eq!(b.role(), Some(Role::Callee));
    a.pump().await;
    assert_eq!(a.role(), Some(Role::Caller));
}

#[tokio::test]
async fn early_candidate_is_applied_after_offer() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    d1.manager.accept_invite(&call_id).await.unwrap();
    p1.pump().await;

    // кандидат обогнал offer
    let early = SignalingMessage::new(
        MessageType::IceCandidate,
        call_id.clone(),
        "p1",
        "d1",
        json!({ "candidate": "candidate:9 1 udp 2122260223 10.0.0.9 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0 }),
    );
    d1.manager.handle_message(early).await;
    assert_eq!(d1.state(), Some(NegotiationState::Idle));

    d1.pump().await;
    assert_eq!(d1.state(), Some(NegotiationState::Connecting));
    let ops = d1.connector.last().unwrap().ops();
    let remote_at = ops
        .iter()
        .position(|op| *op == PeerOp::SetRemote(crate::peer::types::SdpKind::Offer))
        .unwrap();
    let candidate_at = ops
        .iter()
        .position(|op| matches!(op, PeerOp::AddCandidate(c) if c.starts_with("candidate:9")))
        .unwrap();
    assert!(remote_at < candidate_at);
}

#[tokio::test]
async fn busy_callee_auto_rejects_second_caller() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut p2 = Side::new(&relay, "p2").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let first = connect(&mut p1, &mut d1).await;
    d1.drain_events();

    let second = p2.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    assert!(d1.drain_events().is_empty());
    assert_eq!(d1.manager.active_session().unwrap().call_id, first);

    p2.pump().await;
    let events = p2.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Failed { call_id, error: CallError::Busy } if *call_id == second
    )));
    assert!(p2.manager.active_session().is_none());
    assert!(!p2.manager.is_busy());
    assert_eq!(p1.state(), Some(NegotiationState::Connecting));
}

#[tokio::test]
async fn declined_invite_fails_caller_without_session() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    d1.manager.reject_invite(&call_id, "declined").await.unwrap();
    assert!(matches!(
        d1.manager.reject_invite(&call_id, "declined").await,
        Err(CallError::UnknownCall(_))
    ));

    p1.pump().await;
    let events = p1.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Failed { error: CallError::CallDeclined { reason }, .. } if reason == "declined"
    )));
    let record = p1.records.try_recv().unwrap();
    assert_eq!(record.end_reason, "declined");
    assert_eq!(record.duration_seconds, 0);
    assert!(p1.connector.opened().is_empty());
    assert_eq!(p1.devices.acquired(), 0);
}

#[tokio::test]
async fn outgoing_timeout_withdraws_invite() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    d1.drain_events();

    // устаревший таймер другого звонка ничего не делает
    p1.manager
        .on_timer(TimerEvent {
            call_id: "stale".into(),
            kind: TimerKind::OutgoingInvite,
        })
        .await;
    assert!(p1.manager.is_busy());

    p1.manager
        .on_timer(TimerEvent {
            call_id: call_id.clone(),
            kind: TimerKind::OutgoingInvite,
        })
        .await;
    let events = p1.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::Failed { error: CallError::CallTimeout, .. })));
    assert!(events.iter().all(|e| !matches!(e, CallEvent::Negotiating { .. })));
    assert!(!p1.manager.is_busy());

    d1.pump().await;
    let events = d1.drain_events();
    assert_eq!(
        events,
        vec![CallEvent::InviteWithdrawn {
            call_id: call_id.clone()
        }]
    );
    assert!(d1.manager.pending_invites().is_empty());
}

#[tokio::test]
async fn unanswered_incoming_invite_expires_with_timeout_reject() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    d1.manager
        .on_timer(TimerEvent {
            call_id: call_id.clone(),
            kind: TimerKind::IncomingInvite,
        })
        .await;
    assert!(d1
        .drain_events()
        .contains(&CallEvent::InviteExpired { call_id: call_id.clone() }));

    p1.pump().await;
    assert!(p1
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::Failed { error: CallError::CallTimeout, .. })));
}

#[tokio::test]
async fn remote_bye_ends_both_sides_with_records() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = connect(&mut p1, &mut d1).await;
    p1.manager
        .on_peer_event(PeerEvent {
            call_id: call_id.clone(),
            kind: crate::peer::connection::PeerEventKind::StateChanged(ConnectionState::Connected),
        })
        .await;
    assert_eq!(p1.state(), Some(NegotiationState::Connected));

    p1.manager.end_active_session(REASON_HANGUP).await;
    p1.manager.end_active_session(REASON_HANGUP).await;
    assert!(p1.manager.active_session().is_none());
    assert_eq!(p1.devices.stopped(), 1);

    d1.pump().await;
    assert!(d1.manager.active_session().is_none());
    assert_eq!(d1.devices.stopped(), 1);

    let caller = p1.records.try_recv().unwrap();
    assert_eq!(caller.end_reason, REASON_HANGUP);
    assert!(caller.connected_at.is_some());
    assert_eq!(caller.participants, vec!["p1".to_string(), "d1".to_string()]);
    assert!(p1.records.try_recv().is_err());

    let callee = d1.records.try_recv().unwrap();
    assert_eq!(callee.call_id, call_id);
    assert_eq!(callee.end_reason, REASON_HANGUP);
    assert_eq!(callee.duration_seconds, 0);
}

#[tokio::test]
async fn signaling_loss_ends_active_call() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    connect(&mut p1, &mut d1).await;
    p1.drain_events();

    p1.manager.on_signaling_lost().await;
    assert!(p1.manager.active_session().is_none());
    let ended = p1
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            CallEvent::Ended { reason, .. } => Some(reason),
            _ => None,
        });
    assert_eq!(ended.as_deref(), Some(REASON_SIGNALING_LOST));
    assert_eq!(p1.devices.stopped(), 1);
}

#[tokio::test]
async fn media_failure_reports_failed_and_ends_callee() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    p1.devices.fail_next();
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    let _ = incoming_call_id(&d1.drain_events());
    d1.manager.accept_invite(&call_id).await.unwrap();
    p1.pump().await;

    assert!(p1.manager.active_session().is_none());
    assert!(p1.drain_events().iter().any(|e| matches!(
        e,
        CallEvent::Failed { error: CallError::MediaAccess(_), .. }
    )));
    d1.pump().await;
    assert!(d1.manager.active_session().is_none());
}

#[tokio::test]
async fn stray_answer_is_dropped() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    d1.manager.accept_invite(&call_id).await.unwrap();

    let stray = SignalingMessage::new(
        MessageType::Answer,
        call_id,
        "p1",
        "d1",
        json!({ "type": "answer", "sdp": "v=0" }),
    );
    d1.manager.handle_message(stray).await;
    assert_eq!(d1.state(), Some(NegotiationState::Idle));
    assert_eq!(d1.role(), Some(Role::Callee));
}

/// Всё, что лежит во входящих, в обратном порядке
fn reversed_inbox(side: &mut Side) -> Vec<SignalingMessage> {
    let mut messages = Vec::new();
    while let Some(message) = side.inbox.try_recv() {
        messages.push(message);
    }
    messages.reverse();
    messages
}

#[tokio::test]
async fn bye_overtaking_accept_ends_outgoing_call() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    d1.manager.accept_invite(&call_id).await.unwrap();
    d1.manager.end_active_session(REASON_HANGUP).await;

    let delivered = reversed_inbox(&mut p1);
    let kinds: Vec<MessageType> = delivered.iter().map(|m| m.kind).collect();
    assert_eq!(kinds, vec![MessageType::Bye, MessageType::Accept]);
    for message in delivered {
        p1.manager.handle_message(message).await;
    }

    assert!(p1.manager.active_session().is_none());
    assert!(!p1.manager.is_busy());
    assert!(p1.connector.opened().is_empty());
    assert!(p1.drain_events().iter().any(|e| matches!(
        e,
        CallEvent::Failed { error: CallError::CallDeclined { reason }, .. } if reason == REASON_HANGUP
    )));
    let record = p1.records.try_recv().unwrap();
    assert_eq!(record.call_id, call_id);
    assert_eq!(record.end_reason, REASON_HANGUP);
    assert!(p1.records.try_recv().is_err());

    // поздний accept получает bye в ответ
    let reply = d1.inbox.try_recv().unwrap();
    assert_eq!(reply.kind, MessageType::Bye);
    assert_eq!(reply.call_id, call_id);
}

#[tokio::test]
async fn bye_overtaking_invite_suppresses_incoming_call() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    p1.manager.request_call("d1").await.unwrap();
    p1.manager.end_active_session(REASON_HANGUP).await;

    for message in reversed_inbox(&mut d1) {
        d1.manager.handle_message(message).await;
    }
    assert!(d1.manager.pending_invites().is_empty());
    assert!(d1
        .drain_events()
        .iter()
        .all(|e| !matches!(e, CallEvent::IncomingCall(_))));
}

#[tokio::test]
async fn late_accept_of_withdrawn_invite_ends_callee() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;

    p1.manager.end_active_session(REASON_HANGUP).await;
    // bye об отзыве ещё в пути, d1 успевает принять
    let in_flight = d1.inbox.try_recv().unwrap();
    assert_eq!(in_flight.kind, MessageType::Bye);
    d1.manager.accept_invite(&call_id).await.unwrap();
    assert!(d1.manager.is_busy());

    p1.pump().await;
    assert!(p1.manager.active_session().is_none());
    d1.pump().await;
    assert!(d1.manager.active_session().is_none());
    let record = d1.records.try_recv().unwrap();
    assert_eq!(record.end_reason, REASON_WITHDRAWN);

    d1.manager.handle_message(in_flight).await;
    assert!(d1.records.try_recv().is_err());
}

#[tokio::test]
async fn stalled_negotiation_times_out() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;
    d1.manager.accept_invite(&call_id).await.unwrap();
    p1.pump().await;
    assert_eq!(
        p1.state(),
        Some(NegotiationState::Negotiating(NegotiationPhase::Offering))
    );
    // offer потерялся
    d1.inbox.try_recv().unwrap();
    p1.drain_events();

    p1.manager
        .on_timer(TimerEvent {
            call_id: call_id.clone(),
            kind: TimerKind::NegotiationDeadline,
        })
        .await;
    assert!(!p1.manager.is_busy());
    assert!(p1
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::Failed { error: CallError::CallTimeout, .. })));

    d1.pump().await;
    assert!(d1.manager.active_session().is_none());
}

#[tokio::test]
async fn negotiation_deadline_ignored_once_connected() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    let call_id = connect(&mut p1, &mut d1).await;
    p1.manager
        .on_peer_event(PeerEvent {
            call_id: call_id.clone(),
            kind: crate::peer::connection::PeerEventKind::StateChanged(ConnectionState::Connected),
        })
        .await;

    p1.manager
        .on_timer(TimerEvent {
            call_id,
            kind: TimerKind::NegotiationDeadline,
        })
        .await;
    assert_eq!(p1.state(), Some(NegotiationState::Connected));
}

#[tokio::test]
async fn shutdown_rejects_pending_invites() {
    let relay = LocalRelay::new();
    let mut p1 = Side::new(&relay, "p1").await;
    let mut d1 = Side::new(&relay, "d1").await;
    p1.manager.request_call("d1").await.unwrap();
    d1.pump().await;

    d1.manager.shutdown().await;
    assert!(d1.manager.pending_invites().is_empty());

    p1.pump().await;
    assert!(p1.drain_events().iter().any(|e| matches!(
        e,
        CallEvent::Failed { error: CallError::CallDeclined { reason }, .. } if reason == REASON_SHUTDOWN
    )));
    assert!(!p1.manager.is_busy());
}
