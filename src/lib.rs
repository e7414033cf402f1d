//! Mesh-видеосвязь на N участников поверх pub/sub сигналинга
//!
//! Каждый узел держит по одному RTCPeerConnection на каждого удалённого
//! участника и договаривается с ним по схеме perfect negotiation.

pub mod config;
pub mod error;
pub mod liveness;
pub mod logger;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use liveness::{LivenessHandle, LivenessMonitor};
pub use media::{
    LocalMediaProvider, LocalMediaState, LocalTrack, MediaChange, RemoteRenderSink, SharedMedia,
    TrackCoordinator, VideoSource,
};
pub use peer::{
    ConnectionFactory, MediaConnection, NegotiationPhase, NegotiationSession, PeerId, PeerRegistry,
    PeerSession, RtcConnectionFactory,
};
pub use signaling::{MemoryBroker, MessageBody, SignalingMessage, SignalingTransport, Signaler};
pub use supervisor::{ConnectionSupervisor, RouteOutcome};

/// Версия библиотеки
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
