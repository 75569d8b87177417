pub mod connection;
pub mod ice;
pub mod media;
pub mod state;
pub mod types;

pub use connection::{
    PeerConnection, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender, RtcConnector,
    RtcTrack,
};
pub use ice::{CandidateBuffer, PendingCandidate};
pub use media::{MediaConstraints, MediaDevices, MediaKind, MediaStream, TrackDevices};
pub use state::{CallSession, NegotiationPhase, NegotiationState};
pub use types::{
    CallInvite, ConnectionState, Endpoint, IceCandidate, Role, SdpKind, ServerConfig,
    SessionDescription,
};
