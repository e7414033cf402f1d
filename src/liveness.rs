//! Heartbeat и вычистка молчащих пиров
//!
//! Таймер heartbeat и таймер вычистки независимы. Пир удаляется на первой
//! вычистке, когда с последнего сообщения от него прошло строго больше
//! таймаута.

use crate::config::MeshConfig;
use crate::peer::registry::PeerRegistry;
use crate::peer::types::PeerId;
use crate::signaling::{MessageBody, Signaler};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, info};

pub struct LivenessMonitor {
    registry: Arc<PeerRegistry>,
    signaler: Signaler,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<PeerRegistry>, signaler: Signaler, config: &MeshConfig) -> Self {
        Self {
            registry,
            signaler,
            heartbeat_interval: config.heartbeat_interval(),
            sweep_interval: config.sweep_interval(),
            timeout: config.peer_timeout(),
        }
    }

    /// Heartbeat каждому известному пиру; возвращает число отправленных
    pub async fn send_heartbeats(&self) -> usize {
        let mut sent = 0;
        for peer_id in self.registry.peer_ids().await {
            if self
                .signaler
                .unicast(MessageBody::Heartbeat, &peer_id)
                .await
                .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }

    pub async fn sweep(&self) -> Vec<PeerId> {
        self.sweep_at(Instant::now()).await
    }

    /// Удаляет пиров, молчащих дольше таймаута на момент `now`
    pub async fn sweep_at(&self, now: Instant) -> Vec<PeerId> {
        let mut removed = Vec::new();
        for session in self.registry.sessions().await {
            if !session.is_expired(now, self.timeout).await {
                continue;
            }
            let peer_id = session.peer_id().clone();
            // пир мог уйти сам, пока шла проверка
            if self
                .registry
                .remove_connection(&peer_id, session.connection_id())
                .await
            {
                info!("Peer {peer_id} timed out");
                removed.push(peer_id);
            }
        }
        removed
    }

    pub fn spawn(self) -> LivenessHandle {
        let monitor = Arc::new(self);

        let heartbeat = tokio::spawn({
            let monitor = monitor.clone();
            async move {
                let period = monitor.heartbeat_interval;
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let sent = monitor.send_heartbeats().await;
                    debug!("Heartbeat sent to {sent} peers");
                }
            }
        });

        let sweep = tokio::spawn({
            let monitor = monitor.clone();
            async move {
                let period = monitor.sweep_interval;
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    monitor.sweep().await;
                }
            }
        });

        LivenessHandle { heartbeat, sweep }
    }
}

/// Фоновые таймеры; останавливаются вручную или при drop
pub struct LivenessHandle {
    heartbeat: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl LivenessHandle {
    pub fn stop(&self) {
        self.heartbeat.abort();
        self.sweep.abort();
    }
}

impl Drop for LivenessHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
