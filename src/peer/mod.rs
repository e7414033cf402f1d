pub mod connection;
pub mod negotiation;
pub mod registry;
pub mod session;
pub mod types;

pub use connection::{
    ConnectionEvent, ConnectionFactory, EventSink, MediaConnection, PeerEvent, RtcConnection,
    RtcConnectionFactory, TrackUpdate,
};
pub use negotiation::{NegotiationPhase, NegotiationSession, NegotiationState};
pub use registry::PeerRegistry;
pub use session::PeerSession;
pub use types::{
    ConnectionState, Direction, IceCandidate, PeerId, SdpType, ServerConfig, SessionDescription,
    SignalingState, TrackKind,
};
