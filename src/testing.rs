//! Дублёры платформы для тестов и демо: медиа без устройств и соединение
//! без сети. Все вызовы записываются для проверок.

use crate::error::CallError;
use crate::negotiation::Platform;
use crate::peer::connection::{PeerConnection, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender};
use crate::peer::media::{MediaConstraints, MediaDevices, MediaKind, MediaStream, MediaTrack};
use crate::peer::types::{ConnectionState, IceCandidate, SdpKind, SessionDescription};
use crate::signaling::{LocalRelay, SignalingChannel};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct FakeDevices {
    acquired: AtomicUsize,
    stopped: AtomicUsize,
    fail: AtomicBool,
    toggles: Mutex<Vec<(MediaKind, bool)>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Следующий захват завершится `MediaAccess`
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn toggles(&self) -> Vec<(MediaKind, bool)> {
        self.toggles.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(&self, _constraints: &MediaConstraints) -> Result<MediaStream, CallError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(CallError::MediaAccess("permission denied".into()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream {
            id: format!("fake-stream-{n}"),
            tracks: vec![
                MediaTrack {
                    id: format!("fake-audio-{n}"),
                    kind: MediaKind::Audio,
                    enabled: true,
                },
                MediaTrack {
                    id: format!("fake-video-{n}"),
                    kind: MediaKind::Video,
                    enabled: true,
                },
            ],
        })
    }

    async fn set_enabled(&self, _stream: &MediaStream, kind: MediaKind, enabled: bool) {
        self.toggles.lock().push((kind, enabled));
    }

    async fn stop(&self, _stream: &MediaStream) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddStream,
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    Rollback,
    AddCandidate(String),
    Close,
}

/// Состояние одного фиктивного соединения
#[derive(Debug)]
pub struct FakePeerState {
    pub call_id: String,
    ops: Mutex<Vec<PeerOp>>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: AtomicBool,
    auto_connect: bool,
    events: PeerEventSender,
}

impl FakePeerState {
    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Эмулирует изменение состояния нижележащего соединения
    pub fn emit_state(&self, state: ConnectionState) {
        self.emit(PeerEventKind::StateChanged(state));
    }

    fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            call_id: self.call_id.clone(),
            kind,
        });
    }

    fn record(&self, op: PeerOp) {
        self.ops.lock().push(op);
    }

    /// Обе стороны описаны: имитируем ICE и установление соединения
    fn maybe_connect(&self) {
        if !self.auto_connect
            || !self.local_set.load(Ordering::SeqCst)
            || !self.remote_set.load(Ordering::SeqCst)
        {
            return;
        }
        self.emit(PeerEventKind::StateChanged(ConnectionState::Connecting));
        self.emit(PeerEventKind::StateChanged(ConnectionState::Connected));
        self.emit(PeerEventKind::RemoteTrack(MediaKind::Audio));
    }
}

struct FakePeer {
    state: Arc<FakePeerState>,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_stream(&self, _stream: &MediaStream) -> Result<(), CallError> {
        self.state.record(PeerOp::AddStream);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.state.record(PeerOp::CreateOffer);
        self.state.local_set.store(true, Ordering::SeqCst);
        self.state.emit(PeerEventKind::LocalCandidate(IceCandidate::new(
            "candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host",
        )));
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.state.call_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.state.record(PeerOp::CreateAnswer);
        self.state.local_set.store(true, Ordering::SeqCst);
        self.state.emit(PeerEventKind::LocalCandidate(IceCandidate::new(
            "candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx",
        )));
        self.state.maybe_connect();
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.state.call_id)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.state.record(PeerOp::SetRemote(desc.kind));
        self.state.remote_set.store(true, Ordering::SeqCst);
        if desc.kind == SdpKind::Answer {
            self.state.maybe_connect();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), CallError> {
        self.state.record(PeerOp::Rollback);
        self.state.local_set.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.state.record(PeerOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.state.record(PeerOp::Close);
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeConnector {
    auto_connect: bool,
    opened: Mutex<Vec<Arc<FakePeerState>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: true,
            opened: Mutex::new(Vec::new()),
        })
    }

    /// Соединения не переходят в `Connected` сами
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: false,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn opened(&self) -> Vec<Arc<FakePeerState>> {
        self.opened.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakePeerState>> {
        self.opened.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn open(&self, call_id: &str, events: PeerEventSender) -> Result<Box<dyn PeerConnection>, CallError> {
        let state = Arc::new(FakePeerState {
            call_id: call_id.to_string(),
            ops: Mutex::new(Vec::new()),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            auto_connect: self.auto_connect,
            events,
        });
        self.opened.lock().push(Arc::clone(&state));
        Ok(Box::new(FakePeer { state }))
    }
}

/// Платформа на фиктивных устройствах, зарегистрированная в `relay`
pub async fn fake_platform(
    relay: &LocalRelay,
    endpoint_id: &str,
    connector: Arc<FakeConnector>,
) -> Result<(Platform, Arc<FakeDevices>), CallError> {
    let port = relay.port();
    port.register(endpoint_id).await?;
    let devices = FakeDevices::new();
    let platform = Platform {
        signaling: Arc::new(port),
        devices: devices.clone(),
        connector,
    };
    Ok((platform, devices))
}

#[cfg(test)]
pub use harness::Harness;
