use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalMediaState, LocalTrack};
use crate::peer::types::{
    ConnectionState, Direction, IceCandidate, PeerId, SdpType, SessionDescription, SignalingState,
    TrackKind,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// События соединения вместо колбэков
pub enum ConnectionEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    RemoteTrack(Arc<TrackRemote>),
}

pub struct PeerEvent {
    pub peer_id: PeerId,
    pub connection_id: u64,
    pub event: ConnectionEvent,
}

/// Отправитель событий, привязанный к конкретному соединению
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PeerEvent>,
    peer_id: PeerId,
    connection_id: u64,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<PeerEvent>, peer_id: PeerId, connection_id: u64) -> Self {
        Self {
            tx,
            peer_id,
            connection_id,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let event = PeerEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            event,
        };
        if self.tx.send(event).is_err() {
            debug!("Event for peer {} dropped: supervisor is gone", self.peer_id);
        }
    }
}

/// Результат замены исходящего трека
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackUpdate {
    pub direction: Direction,
    /// Соединение само не запустит переговоры, нужно вызвать их явно
    pub renegotiate: bool,
}

/// Согласуемое медиа-соединение с одним удалённым пиром
#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Отказ от неподтверждённого offer, своего или входящего
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn replace_track(&self, kind: TrackKind, track: Option<LocalTrack>) -> Result<TrackUpdate>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Новое соединение с уже подключёнными локальными треками
    async fn create(&self, events: EventSink, media: &LocalMediaState) -> Result<Arc<dyn MediaConnection>>;
}

/// ========== webrtc-rs ==========

pub struct RtcConnectionFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnectionFactory {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            ice_servers: config.rtc_ice_servers(),
        }
    }
}

fn build_api() -> Result<API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

/// Создает конфигурацию для peer connection
fn rtc_config(ice_servers: Vec<RTCIceServer>) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(&self, events: EventSink, media: &LocalMediaState) -> Result<Arc<dyn MediaConnection>> {
        let api = build_api()?;
        let pc = Arc::new(api.new_peer_connection(rtc_config(self.ice_servers.clone())).await?);
        info!(
            "RTCPeerConnection created for peer {} (connection {})",
            events.peer_id(),
            events.connection_id()
        );

        // локальные кандидаты уходят пиру через сигналинг
        pc.on_ice_candidate(Box::new({
            let events = events.clone();
            move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => {
                        dump_candidate("LOCAL", &c);
                        match c.to_json() {
                            Ok(init) => events.emit(ConnectionEvent::LocalCandidate(init.into())),
                            Err(e) => warn!("Failed to serialize local candidate: {e}"),
                        }
                    }
                    None => debug!(
                        "ICE candidate gathering completed for peer {}",
                        events.peer_id()
                    ),
                }
                Box::pin(async {})
            }
        }));

        pc.on_negotiation_needed(Box::new({
            let events = events.clone();
            move || {
                events.emit(ConnectionEvent::NegotiationNeeded);
                Box::pin(async {})
            }
        }));

        // слабая ссылка, чтобы обработчик не держал соединение
        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new({
            let events = events.clone();
            move |st: RTCPeerConnectionState| {
                info!("Connection state with peer {}: {st}", events.peer_id());
                if matches!(
                    st,
                    RTCPeerConnectionState::Connected | RTCPeerConnectionState::Failed
                ) {
                    if let Some(pc) = pc_stats.upgrade() {
                        let moment = if st == RTCPeerConnectionState::Connected {
                            "CONNECTED"
                        } else {
                            "BEFORE-FAIL"
                        };
                        tokio::spawn(async move { dump_selected_pair(&pc, moment).await });
                    }
                }
                events.emit(ConnectionEvent::StateChanged(st.into()));
                Box::pin(async {})
            }
        }));

        pc.on_track(Box::new({
            let events = events.clone();
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                debug!(
                    "Received remote {} track from peer {}",
                    track.kind(),
                    events.peer_id()
                );
                events.emit(ConnectionEvent::RemoteTrack(track));
                Box::pin(async {})
            }
        }));

        for (kind, track) in media.tracks() {
            debug!("Adding local {kind:?} track for peer {}", events.peer_id());
            pc.add_track(track).await?;
        }

        Ok(Arc::new(RtcConnection { pc }))
    }
}

pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(MeshError::negotiation(format!(
                "unexpected description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => {
                let Some(pending) = self.pc.pending_local_description().await else {
                    return Ok(());
                };
                self.pc.set_local_description(rollback_of(pending)?).await?;
            }
            RTCSignalingState::HaveRemoteOffer => {
                let Some(pending) = self.pc.pending_remote_description().await else {
                    return Ok(());
                };
                self.pc.set_remote_description(rollback_of(pending)?).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| MeshError::Candidate(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state().into()
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<LocalTrack>) -> Result<TrackUpdate> {
        let codec: RTPCodecType = kind.into();
        let direction = Direction::for_track(track.is_some());
        let wanted = match direction {
            Direction::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            Direction::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        };

        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() != codec {
                continue;
            }
            transceiver.sender().await.replace_track(track.clone()).await?;
            let changed = transceiver.direction() != wanted;
            if changed {
                transceiver.set_direction(wanted).await;
            }
            return Ok(TrackUpdate {
                direction,
                renegotiate: changed,
            });
        }

        // трансивера ещё нет: add_track сам поднимет negotiationneeded
        if let Some(track) = track {
            self.pc.add_track(track).await?;
        }
        Ok(TrackUpdate {
            direction,
            renegotiate: false,
        })
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// У RTCSessionDescription нет конструктора rollback, собираем через serde
fn rollback_of(pending: RTCSessionDescription) -> Result<RTCSessionDescription> {
    Ok(serde_json::from_value(serde_json::json!({
        "type": "rollback",
        "sdp": pending.sdp,
    }))?)
}
