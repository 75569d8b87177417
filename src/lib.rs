pub mod config;
pub mod directory;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod peer;
pub mod record;
pub mod session;
pub mod signaling;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod timer;
pub mod utils;

pub use config::CallConfig;
pub use error::{CallError, CallResult};
pub use logger::{CallEvent, EventEmitter};
pub use negotiation::{Negotiator, Platform};
pub use record::{CallRecord, CallRecordSink};
pub use session::{CallAgent, CallHandle, CallSessionManager, Services, Snapshot};
pub use signaling::{SignalingChannel, SignalingMessage};

use directory::Directory;
use peer::{Endpoint, RtcConnector, TrackDevices};
use record::{HttpSink, LogSink};
use signaling::WsSignaling;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Поднимает звонки поверх WebSocket-ретранслятора и webrtc-rs
pub async fn run(
    local: Endpoint,
    signaling_url: &str,
    directory: Arc<dyn Directory>,
    config: CallConfig,
) -> Result<(CallHandle, mpsc::UnboundedReceiver<CallEvent>, JoinHandle<()>), CallError> {
    logger::init(&config.log)?;
    config.validate()?;

    let signaling = WsSignaling::connect(signaling_url).await?;
    let records: Arc<dyn CallRecordSink> = match &config.records_url {
        Some(url) => Arc::new(HttpSink::new(url.clone(), None)),
        None => Arc::new(LogSink),
    };
    let services = Services {
        platform: Platform {
            signaling,
            devices: Arc::new(TrackDevices),
            connector: Arc::new(RtcConnector::new(&config)),
        },
        directory,
        records,
    };
    CallAgent::start(local, services, config).await
}
