use crate::error::CallError;
use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub enabled: bool,
}

/// Локальный поток; принадлежит ровно одному `Negotiator`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn set_enabled(&mut self, kind: MediaKind, enabled: bool) {
        for track in self.tracks.iter_mut().filter(|t| t.kind == kind) {
            track.enabled = enabled;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub max_width: u32,
    pub ideal_height: u32,
    pub max_height: u32,
    pub facing_mode: String,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            max_width: 1280,
            ideal_height: 480,
            max_height: 720,
            facing_mode: "user".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Ограничения getUserMedia; `None` отключает соответствующий тип
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }
}

/// Доступ к камере и микрофону платформы.
///
/// Захват и кодирование живут за этой границей; ядро только получает,
/// переключает и освобождает поток.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints)
        -> Result<MediaStream, CallError>;

    async fn set_enabled(&self, _stream: &MediaStream, _kind: MediaKind, _enabled: bool) {}

    async fn stop(&self, stream: &MediaStream);
}

/// Выдаёт описания дорожек без захвата: сэмплы пишет внешний конвейер
/// в дорожки, созданные `RtcConnector`.
#[derive(Debug, Default, Clone)]
pub struct TrackDevices;

#[async_trait]
impl MediaDevices for TrackDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CallError> {
        let stream_id = format!("stream-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(MediaTrack {
                id: format!("audio-{}", random_id()),
                kind: MediaKind::Audio,
                enabled: true,
            });
        }
        if constraints.video.is_some() {
            tracks.push(MediaTrack {
                id: format!("video-{}", random_id()),
                kind: MediaKind::Video,
                enabled: true,
            });
        }
        if tracks.is_empty() {
            return Err(CallError::MediaAccess(
                "constraints request neither audio nor video".into(),
            ));
        }
        tracing::debug!(stream = %stream_id, tracks = tracks.len(), "allocated local tracks");
        Ok(MediaStream {
            id: stream_id,
            tracks,
        })
    }

    async fn stop(&self, stream: &MediaStream) {
        tracing::debug!(stream = %stream.id, "local tracks stopped");
    }
}
