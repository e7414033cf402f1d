use crate::error::Result;
use crate::media::LocalMediaState;
use crate::peer::connection::{ConnectionFactory, EventSink, PeerEvent};
use crate::peer::negotiation::NegotiationSession;
use crate::peer::types::PeerId;
use crate::signaling::Signaler;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

/// Всё, что известно об одном удалённом пире
pub struct PeerSession {
    peer_id: PeerId,
    connection_id: u64,
    negotiation: NegotiationSession,
    last_seen: Mutex<Instant>,
}

impl PeerSession {
    pub fn new(peer_id: PeerId, connection_id: u64, negotiation: NegotiationSession) -> Self {
        Self {
            peer_id,
            connection_id,
            negotiation,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Создаёт соединение через фабрику и оборачивает его в сессию
    pub async fn open(
        peer_id: PeerId,
        connection_id: u64,
        factory: &dyn ConnectionFactory,
        events: mpsc::UnboundedSender<PeerEvent>,
        media: &LocalMediaState,
        signaler: Signaler,
    ) -> Result<Self> {
        let sink = EventSink::new(events, peer_id.clone(), connection_id);
        let connection = factory.create(sink, media).await?;
        let negotiation = NegotiationSession::new(peer_id.clone(), connection, signaler);
        info!("Opened session with peer {peer_id} (connection {connection_id})");
        Ok(Self::new(peer_id, connection_id, negotiation))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn negotiation(&self) -> &NegotiationSession {
        &self.negotiation
    }

    /// Любое сообщение от пира продлевает его жизнь
    pub async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    pub async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    /// Молчит строго дольше `timeout`
    pub async fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen().await) > timeout
    }

    pub async fn close(&self) {
        if let Err(e) = self.negotiation.close().await {
            warn!("Error closing connection with peer {}: {e}", self.peer_id);
        }
    }
}
