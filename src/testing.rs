//! Подставные соединения и обвязка для тестов
//!
//! `FakeConnection` повторяет переходы signaling state настоящего
//! RTCPeerConnection, но без сети: SDP имеет вид `offer:<владелец>:<n>`.

use crate::error::{MeshError, Result};
use crate::media::{LocalMediaState, LocalTrack, RemoteRenderSink, SharedMedia};
use crate::peer::connection::{
    ConnectionEvent, ConnectionFactory, EventSink, MediaConnection, PeerEvent, TrackUpdate,
};
use crate::peer::registry::PeerRegistry;
use crate::peer::session::PeerSession;
use crate::peer::types::{
    Direction, IceCandidate, PeerId, SessionDescription, SignalingState, TrackKind,
};
use crate::signaling::{MemoryBroker, Signaler, SignalingTransport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub(crate) const TEST_TOPIC: &str = "webrtc/test";

pub(crate) fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub(crate) fn sample_track(kind: TrackKind, id: &str) -> LocalTrack {
    let codec = match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    };
    Arc::new(TrackLocalStaticSample::new(
        codec,
        id.to_owned(),
        "meshrtc-test".to_owned(),
    ))
}

/// Ждёт выполнения условия, опрашивая его с небольшим шагом
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[derive(Default)]
struct FakeState {
    signaling: Option<SignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    // remote description до входящего offer, для отката
    remote_before_offer: Option<SessionDescription>,
    offers: usize,
    answers: usize,
    rollbacks: usize,
    closes: usize,
    applied: Vec<String>,
    directions: HashMap<TrackKind, Direction>,
    fail_next_offer: bool,
    fail_next_answer: bool,
    fail_next_remote: bool,
}

pub(crate) struct FakeConnection {
    owner: String,
    state: Mutex<FakeState>,
}

impl FakeConnection {
    pub(crate) fn new(owner: &str) -> Self {
        Self::with_media(owner, &LocalMediaState::default())
    }

    pub(crate) fn with_media(owner: &str, media: &LocalMediaState) -> Self {
        let directions = [TrackKind::Audio, TrackKind::Video]
            .into_iter()
            .map(|kind| (kind, Direction::for_track(media.track(kind).is_some())))
            .collect();
        Self {
            owner: owner.to_owned(),
            state: Mutex::new(FakeState {
                directions,
                ..FakeState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local.clone()
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    pub(crate) fn offers_created(&self) -> usize {
        self.lock().offers
    }

    pub(crate) fn answers_created(&self) -> usize {
        self.lock().answers
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    pub(crate) fn closes(&self) -> usize {
        self.lock().closes
    }

    pub(crate) fn applied_candidates(&self) -> Vec<String> {
        self.lock().applied.clone()
    }

    pub(crate) fn direction(&self, kind: TrackKind) -> Option<Direction> {
        self.lock().directions.get(&kind).copied()
    }

    pub(crate) fn fail_next_offer(&self) {
        self.lock().fail_next_offer = true;
    }

    pub(crate) fn fail_next_answer(&self) {
        self.lock().fail_next_answer = true;
    }

    pub(crate) fn fail_next_remote(&self) {
        self.lock().fail_next_remote = true;
    }

    fn current(state: &FakeState) -> SignalingState {
        state.signaling.unwrap_or(SignalingState::Stable)
    }
}

fn invalid(what: &str, state: SignalingState) -> MeshError {
    MeshError::negotiation(format!("{what} in state {state:?}"))
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_offer) {
            return Err(MeshError::negotiation("offer creation failed"));
        }
        if state.closes > 0 {
            return Err(MeshError::Closed);
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer:{}:{}",
            self.owner, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.lock();
        let current = Self::current(&state);
        if current != SignalingState::HaveRemoteOffer {
            return Err(invalid("create answer", current));
        }
        if std::mem::take(&mut state.fail_next_answer) {
            return Err(MeshError::negotiation("answer creation failed"));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "answer:{}:{}",
            self.owner, state.answers
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.lock();
        let current = Self::current(&state);
        let next = match (desc.is_offer(), current) {
            (true, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (false, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            _ => return Err(invalid("set local description", current)),
        };
        state.signaling = Some(next);
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_remote) {
            return Err(MeshError::negotiation("malformed remote description"));
        }
        let current = Self::current(&state);
        let next = match (desc.is_offer(), current) {
            (true, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (false, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            _ => return Err(invalid("set remote description", current)),
        };
        state.signaling = Some(next);
        let previous = state.remote.replace(desc);
        if next == SignalingState::HaveRemoteOffer {
            state.remote_before_offer = previous;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.lock();
        match Self::current(&state) {
            SignalingState::HaveLocalOffer => state.local = None,
            SignalingState::HaveRemoteOffer => state.remote = state.remote_before_offer.take(),
            _ => return Ok(()),
        }
        state.signaling = Some(SignalingState::Stable);
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(MeshError::Candidate("no remote description".into()));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        let state = self.lock();
        if state.closes > 0 {
            SignalingState::Closed
        } else {
            Self::current(&state)
        }
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<LocalTrack>) -> Result<TrackUpdate> {
        let direction = Direction::for_track(track.is_some());
        let previous = self.lock().directions.insert(kind, direction);
        Ok(TrackUpdate {
            direction,
            renegotiate: previous != Some(direction),
        })
    }

    async fn close(&self) -> Result<()> {
        self.lock().closes += 1;
        Ok(())
    }
}

/// Фабрика, которая запоминает выданные соединения по id пира
pub(crate) struct FakeFactory {
    owner: String,
    connections: Mutex<HashMap<PeerId, (Arc<FakeConnection>, EventSink)>>,
    created: Mutex<usize>,
    gates: Mutex<HashMap<PeerId, Arc<Notify>>>,
    waiting: Mutex<HashSet<PeerId>>,
    fail_next_create: Mutex<bool>,
}

impl FakeFactory {
    pub(crate) fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_owned(),
            connections: Mutex::new(HashMap::new()),
            created: Mutex::new(0),
            gates: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashSet::new()),
            fail_next_create: Mutex::new(false),
        }
    }

    /// Следующее создание соединения с пиром ждёт `notify_one`
    pub(crate) fn hold(&self, peer: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(PeerId::from(peer), gate.clone());
        gate
    }

    /// Создание соединения с пиром остановлено на `hold`
    pub(crate) fn is_waiting(&self, peer: &str) -> bool {
        self.waiting.lock().unwrap().contains(&PeerId::from(peer))
    }

    pub(crate) fn fail_next_create(&self) {
        *self.fail_next_create.lock().unwrap() = true;
    }

    /// Последнее соединение, выданное для пира
    pub(crate) fn connection(&self, peer: &str) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[&PeerId::from(peer)].0.clone()
    }

    pub(crate) fn try_connection(&self, peer: &str) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .unwrap()
            .get(&PeerId::from(peer))
            .map(|(conn, _)| conn.clone())
    }

    /// Отправитель событий последнего соединения пира
    pub(crate) fn events(&self, peer: &str) -> EventSink {
        self.connections.lock().unwrap()[&PeerId::from(peer)].1.clone()
    }

    pub(crate) fn created(&self) -> usize {
        *self.created.lock().unwrap()
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(&self, events: EventSink, media: &LocalMediaState) -> Result<Arc<dyn MediaConnection>> {
        let peer_id = events.peer_id().clone();
        let gate = self.gates.lock().unwrap().remove(&peer_id);
        if let Some(gate) = gate {
            self.waiting.lock().unwrap().insert(peer_id.clone());
            gate.notified().await;
            self.waiting.lock().unwrap().remove(&peer_id);
        }
        if std::mem::take(&mut *self.fail_next_create.lock().unwrap()) {
            return Err(MeshError::negotiation("connection setup failed"));
        }
        let conn = Arc::new(FakeConnection::with_media(&self.owner, media));
        // как add_track у настоящего соединения
        if !media.tracks().is_empty() {
            events.emit(ConnectionEvent::NegotiationNeeded);
        }
        self.connections
            .lock()
            .unwrap()
            .insert(events.peer_id().clone(), (conn.clone(), events));
        *self.created.lock().unwrap() += 1;
        Ok(conn)
    }
}

/// Запоминает, чья отрисовка была снята
#[derive(Default)]
pub(crate) struct RecordingSink {
    detached: Mutex<Vec<PeerId>>,
}

impl RecordingSink {
    pub(crate) fn detached(&self) -> Vec<PeerId> {
        self.detached.lock().unwrap().clone()
    }
}

impl RemoteRenderSink for RecordingSink {
    fn attach(&self, _peer_id: &PeerId, _track: Arc<TrackRemote>) {}

    fn detach(&self, peer_id: &PeerId) {
        self.detached.lock().unwrap().push(peer_id.clone());
    }
}

/// Локальный пир без супервизора: реестр, фабрика и сигналинг в памяти
pub(crate) struct Harness {
    pub broker: MemoryBroker,
    pub signaler: Signaler,
    pub registry: Arc<PeerRegistry>,
    pub factory: Arc<FakeFactory>,
    pub sink: Arc<RecordingSink>,
    pub media: SharedMedia,
    pub events_tx: mpsc::UnboundedSender<PeerEvent>,
    _events_rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Harness {
    pub(crate) async fn new(local: &str) -> Self {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        transport.connect().await.unwrap();
        let signaler = Signaler::new(Arc::new(transport), TEST_TOPIC, PeerId::from(local));
        let sink = Arc::new(RecordingSink::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            signaler,
            registry: Arc::new(PeerRegistry::with_sink(sink.clone())),
            factory: Arc::new(FakeFactory::new(local)),
            sink,
            media: SharedMedia::default(),
            events_tx,
            _events_rx: events_rx,
        }
    }

    pub(crate) async fn add_peer(&self, peer: &str) -> Arc<PeerSession> {
        self.try_add_peer(peer).await.unwrap()
    }

    pub(crate) async fn try_add_peer(&self, peer: &str) -> Result<Arc<PeerSession>> {
        let peer_id = PeerId::from(peer);
        let media = self.media.read().await;
        let (session, _) = self
            .registry
            .get_or_try_insert_with(&peer_id, |connection_id| {
                PeerSession::open(
                    peer_id.clone(),
                    connection_id,
                    self.factory.as_ref(),
                    self.events_tx.clone(),
                    &media,
                    self.signaler.clone(),
                )
            })
            .await?;
        Ok(session)
    }

    pub(crate) async fn tap(&self) -> mpsc::UnboundedReceiver<String> {
        self.broker.tap(TEST_TOPIC).await
    }
}
