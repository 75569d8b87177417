use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::dump_candidate;
use crate::peer::media::{MediaKind, MediaStream};
use crate::peer::types::{ConnectionState, IceCandidate, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Событие от нижележащего соединения конкретного звонка
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub call_id: String,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    RemoteTrack(MediaKind),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Соединение платформы (RTCPeerConnection).
///
/// `create_offer`/`create_answer` сразу устанавливают local description.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), CallError>;
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    /// Откат собственного offer при glare
    async fn rollback(&self) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    async fn close(&self) -> Result<(), CallError>;
}

/// Создаёт соединение на каждый звонок
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(
        &self,
        call_id: &str,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerConnection>, CallError>;
}

/// Дорожки webrtc-rs, которые нужны конвейеру захвата/воспроизведения
#[derive(Clone)]
pub enum RtcTrack {
    Local {
        call_id: String,
        kind: MediaKind,
        track: Arc<TrackLocalStaticSample>,
    },
    Remote {
        call_id: String,
        track: Arc<TrackRemote>,
    },
}

/// `PeerConnector` поверх webrtc-rs
#[derive(Clone, Default)]
pub struct RtcConnector {
    ice_servers: Vec<ServerConfig>,
    track_sink: Option<mpsc::UnboundedSender<RtcTrack>>,
}

impl RtcConnector {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            track_sink: None,
        }
    }

    pub fn with_track_sink(mut self, sink: mpsc::UnboundedSender<RtcTrack>) -> Self {
        self.track_sink = Some(sink);
        self
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn open(
        &self,
        call_id: &str,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerConnection>, CallError> {
        let peer = RtcPeer::new(
            call_id,
            rtc_config(&self.ice_servers),
            events,
            self.track_sink.clone(),
        )
        .await?;
        Ok(Box::new(peer))
    }
}

pub struct RtcPeer {
    call_id: String,
    pc: Arc<RTCPeerConnection>,
    track_sink: Option<mpsc::UnboundedSender<RtcTrack>>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl RtcPeer {
    pub async fn new(
        call_id: &str,
        config: RTCConfiguration,
        events: PeerEventSender,
        track_sink: Option<mpsc::UnboundedSender<RtcTrack>>,
    ) -> Result<Self, CallError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let cid = call_id.to_string();
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            // cand == None означает конец сбора
            if let Some(c) = cand {
                match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        dump_candidate("LOCAL", &cid, &candidate);
                        let _ = tx.send(PeerEvent {
                            call_id: cid.clone(),
                            kind: PeerEventKind::LocalCandidate(candidate),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(target: "peercall::ice", call_id = %cid, "failed to serialise local candidate: {e}");
                    }
                }
            } else {
                tracing::debug!(target: "peercall::ice", call_id = %cid, "ICE candidate gathering completed");
            }
            Box::pin(async {})
        }));

        let cid = call_id.to_string();
        let tx = events.clone();
        let weak: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            tracing::debug!(target: "peercall::rtc", call_id = %cid, "peer connection state changed to {st:?}");
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = weak.upgrade() {
                    let cid = cid.clone();
                    tokio::spawn(async move {
                        dump_selected_pair(&cid, &pc, "BEFORE-FAIL").await;
                    });
                }
            }
            if let Some(state) = map_state(st) {
                let _ = tx.send(PeerEvent {
                    call_id: cid.clone(),
                    kind: PeerEventKind::StateChanged(state),
                });
            }
            Box::pin(async {})
        }));

        let cid = call_id.to_string();
        let tx = events;
        let sink = track_sink.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    _ => None,
                };
                tracing::debug!(target: "peercall::rtc", call_id = %cid, "remote track {:?}", kind);
                if let Some(kind) = kind {
                    let _ = tx.send(PeerEvent {
                        call_id: cid.clone(),
                        kind: PeerEventKind::RemoteTrack(kind),
                    });
                }
                if let Some(sink) = &sink {
                    let _ = sink.send(RtcTrack::Remote {
                        call_id: cid.clone(),
                        track,
                    });
                }
                Box::pin(async {})
            },
        ));

        Ok(Self {
            call_id: call_id.to_string(),
            pc,
            track_sink,
            local_tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().clone()
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), CallError> {
        for media_track in &stream.tracks {
            let mime_type = match media_track.kind {
                MediaKind::Audio => MIME_TYPE_OPUS,
                MediaKind::Video => MIME_TYPE_VP8,
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                media_track.id.clone(),
                stream.id.clone(),
            ));
            self.pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            if let Some(sink) = &self.track_sink {
                let _ = sink.send(RtcTrack::Local {
                    call_id: self.call_id.clone(),
                    kind: media_track.kind,
                    track: Arc::clone(&track),
                });
            }
            self.local_tracks.lock().push(track);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), CallError> {
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))?;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.local_tracks.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}

fn map_state(st: RTCPeerConnectionState) -> Option<ConnectionState> {
    match st {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

/// Конфигурация для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Снимок getStats → выбранная пара
async fn dump_selected_pair(call_id: &str, pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                tracing::debug!(
                    target: "peercall::rtc",
                    call_id,
                    "STATS {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
