//! Управление встречей: вход, маршрутизация сигналов, выход
//!
//! Входящие сообщения обрабатываются одной задачей строго по очереди,
//! события соединений приходят через отдельный канал. Обе задачи держат
//! супервизор по слабой ссылке.

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::liveness::{LivenessHandle, LivenessMonitor};
use crate::media::{RemoteRenderSink, SharedMedia, TrackCoordinator};
use crate::peer::connection::{ConnectionEvent, ConnectionFactory, PeerEvent};
use crate::peer::registry::PeerRegistry;
use crate::peer::session::PeerSession;
use crate::peer::types::{PeerId, SessionDescription};
use crate::signaling::{MessageBody, SignalingMessage, SignalingTransport, Signaler};
use crate::utils::{random_peer_id, topic_for};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Что произошло с входящим сообщением
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Своё же сообщение, вернувшееся из канала
    SelfEcho,
    AddressedElsewhere,
    Handled,
    /// Кандидат от пира без сессии
    UnknownPeer,
}

/// Состояние активной встречи
struct Joined {
    meeting_id: String,
    signaler: Signaler,
    events: mpsc::UnboundedSender<PeerEvent>,
    liveness: LivenessHandle,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ConnectionSupervisor {
    local_id: PeerId,
    config: MeshConfig,
    transport: Arc<dyn SignalingTransport>,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<PeerRegistry>,
    media: SharedMedia,
    joined: Mutex<Option<Joined>>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: MeshConfig,
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn ConnectionFactory>,
        sink: Option<Arc<dyn RemoteRenderSink>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let local_id = config.local_id.clone().unwrap_or_else(random_peer_id);
        let registry = match sink {
            Some(sink) => PeerRegistry::with_sink(sink),
            None => PeerRegistry::new(),
        };
        info!("Mesh node {local_id} created");
        Ok(Arc::new(Self {
            local_id,
            config,
            transport,
            factory,
            registry: Arc::new(registry),
            media: SharedMedia::default(),
            joined: Mutex::new(None),
        }))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn media(&self) -> &SharedMedia {
        &self.media
    }

    /// Координатор локальных треков для всех сессий этого узла
    pub fn track_coordinator(&self) -> TrackCoordinator {
        TrackCoordinator::new(self.media.clone(), self.registry.clone())
    }

    pub async fn meeting_id(&self) -> Option<String> {
        self.joined.lock().await.as_ref().map(|j| j.meeting_id.clone())
    }

    pub async fn is_joined(&self) -> bool {
        self.joined.lock().await.is_some()
    }

    /// Вход во встречу: подписка, объявление себя, запуск heartbeat
    pub async fn join(self: &Arc<Self>, meeting_id: &str) -> Result<()> {
        let mut joined = self.joined.lock().await;
        if let Some(current) = joined.as_ref() {
            return Err(MeshError::AlreadyJoined(current.meeting_id.clone()));
        }

        self.transport.connect().await?;
        let topic = topic_for(&self.config.topic_prefix, meeting_id);
        let inbound = self.transport.subscribe(&topic).await?;
        let signaler = Signaler::new(self.transport.clone(), topic.as_str(), self.local_id.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(inbound_pump(Arc::downgrade(self), inbound)),
            tokio::spawn(event_pump(Arc::downgrade(self), events_rx)),
        ];

        if let Err(e) = signaler.broadcast(MessageBody::Announce).await {
            warn!("Announce on join failed: {e}");
        }
        let liveness =
            LivenessMonitor::new(self.registry.clone(), signaler.clone(), &self.config).spawn();

        *joined = Some(Joined {
            meeting_id: meeting_id.to_string(),
            signaler,
            events: events_tx,
            liveness,
            tasks,
        });
        info!("Peer {} joined meeting {meeting_id} on {topic}", self.local_id);
        Ok(())
    }

    /// Выход: уведомляет остальных и освобождает все сессии
    pub async fn leave(&self) -> Result<()> {
        let Some(joined) = self.joined.lock().await.take() else {
            return Err(MeshError::NotJoined);
        };
        joined.liveness.stop();
        // насосы останавливаются до очистки, иначе маршрутизация
        // успеет вернуть в реестр нового пира
        for task in &joined.tasks {
            task.abort();
        }
        for task in joined.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Signaling task ended abnormally: {e}");
                }
            }
        }

        if let Err(e) = joined.signaler.broadcast(MessageBody::Leave).await {
            warn!("Leave notice failed: {e}");
        }
        let closed = self.registry.clear().await;

        if let Err(e) = self.transport.unsubscribe(joined.signaler.topic()).await {
            warn!("Unsubscribe from {} failed: {e}", joined.signaler.topic());
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {e}");
        }
        info!(
            "Peer {} left meeting {} ({closed} sessions closed)",
            self.local_id, joined.meeting_id
        );
        Ok(())
    }

    /// Разбор одного входящего сообщения
    pub async fn route(&self, message: SignalingMessage) -> Result<RouteOutcome> {
        if message.sender == self.local_id {
            return Ok(RouteOutcome::SelfEcho);
        }
        if let Some(recipient) = &message.recipient {
            if recipient != &self.local_id {
                return Ok(RouteOutcome::AddressedElsewhere);
            }
        }

        let (signaler, events) = self.context().await?;
        let sender = message.sender;
        debug!("Received {} from peer {sender}", message.body.kind());

        if let Some(session) = self.registry.get(&sender).await {
            session.touch().await;
        }

        match message.body {
            MessageBody::Announce => {
                self.ensure_session(&sender, &signaler, events).await?;
                // ответ только на широковещательный announce, иначе эхо без конца
                if message.recipient.is_none() {
                    if let Err(e) = signaler.unicast(MessageBody::Announce, &sender).await {
                        debug!("Announce reply to peer {sender} not sent: {e}");
                    }
                }
            }
            MessageBody::Sdp { sdp_type, sdp } => {
                let session = self.ensure_session(&sender, &signaler, events).await?;
                session
                    .negotiation()
                    .on_remote_description(SessionDescription { sdp_type, sdp })
                    .await?;
            }
            MessageBody::Candidate { candidate } => match self.registry.get(&sender).await {
                Some(session) => session.negotiation().on_remote_candidate(candidate).await?,
                None => {
                    warn!("Dropped ICE candidate from unknown peer {sender}");
                    return Ok(RouteOutcome::UnknownPeer);
                }
            },
            MessageBody::Leave => {
                info!("Peer {sender} left the meeting");
                self.registry.remove(&sender).await;
            }
            MessageBody::Heartbeat => {}
        }
        Ok(RouteOutcome::Handled)
    }

    /// Событие от соединения конкретного пира
    pub async fn handle_event(&self, event: PeerEvent) {
        let PeerEvent {
            peer_id,
            connection_id,
            event,
        } = event;
        let Some(session) = self.registry.get(&peer_id).await else {
            debug!("Event for unknown peer {peer_id} ignored");
            return;
        };
        if session.connection_id() != connection_id {
            debug!("Event from stale connection {connection_id} of peer {peer_id} ignored");
            return;
        }

        match event {
            ConnectionEvent::NegotiationNeeded => {
                if let Err(e) = session.negotiation().on_negotiation_needed().await {
                    warn!("Negotiation with peer {peer_id} failed: {e}");
                }
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                if let Ok((signaler, _)) = self.context().await {
                    if let Err(e) = signaler
                        .unicast(MessageBody::Candidate { candidate }, &peer_id)
                        .await
                    {
                        debug!("Local candidate for peer {peer_id} not sent: {e}");
                    }
                }
            }
            ConnectionEvent::StateChanged(state) => {
                debug!("Connection with peer {peer_id} is {state:?}");
                if state.is_terminal() {
                    info!("Connection with peer {peer_id} ended ({state:?})");
                    self.registry.remove_connection(&peer_id, connection_id).await;
                }
            }
            ConnectionEvent::RemoteTrack(track) => {
                if let Some(sink) = self.registry.sink() {
                    sink.attach(&peer_id, track);
                }
            }
        }
    }

    async fn context(&self) -> Result<(Signaler, mpsc::UnboundedSender<PeerEvent>)> {
        self.joined
            .lock()
            .await
            .as_ref()
            .map(|j| (j.signaler.clone(), j.events.clone()))
            .ok_or(MeshError::NotJoined)
    }

    async fn ensure_session(
        &self,
        peer_id: &PeerId,
        signaler: &Signaler,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<PeerSession>> {
        // чтение держится до вставки: изменение медиа либо попадёт в
        // соединение при создании, либо застанет сессию в реестре
        let media = self.media.read().await;
        let (session, created) = self
            .registry
            .get_or_try_insert_with(peer_id, |connection_id| {
                PeerSession::open(
                    peer_id.clone(),
                    connection_id,
                    self.factory.as_ref(),
                    events,
                    &media,
                    signaler.clone(),
                )
            })
            .await?;
        if created {
            info!("Initiating connection with peer {peer_id}");
        }
        Ok(session)
    }
}

async fn inbound_pump(supervisor: Weak<ConnectionSupervisor>, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(raw) = inbound.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        let message = match SignalingMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropped malformed signaling message: {e}");
                continue;
            }
        };
        if let Err(e) = supervisor.route(message).await {
            warn!("Failed to handle signaling message: {e}");
        }
    }
    debug!("Inbound signaling stream ended");
}

async fn event_pump(supervisor: Weak<ConnectionSupervisor>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.handle_event(event).await;
    }
}
