//! Реестр удалённых пиров: не более одной сессии на id
//!
//! Общий замок берётся только на вставку и удаление ячейки. Сессия
//! создаётся внутри своей ячейки, поэтому открытие соединения с одним
//! пиром не задерживает остальных.

use crate::error::{MeshError, Result};
use crate::media::RemoteRenderSink;
use crate::peer::session::PeerSession;
use crate::peer::types::PeerId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

/// Ячейка пира; пуста, пока сессия открывается
type Slot = Arc<OnceCell<Arc<PeerSession>>>;

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Slot>>,
    next_connection_id: AtomicU64,
    sink: Option<Arc<dyn RemoteRenderSink>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Реестр, который снимает отрисовку при удалении пира
    pub fn with_sink(sink: Arc<dyn RemoteRenderSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    pub fn sink(&self) -> Option<&Arc<dyn RemoteRenderSink>> {
        self.sink.as_ref()
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub async fn contains(&self, peer_id: &PeerId) -> bool {
        self.get(peer_id).await.is_some()
    }

    /// Возвращает сессию пира, создавая её при отсутствии.
    /// Второй элемент: была ли сессия создана этим вызовом.
    /// Если пира удалили, пока сессия открывалась, она закрывается
    /// и возвращается `MeshError::Closed`.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        peer_id: &PeerId,
        open: F,
    ) -> Result<(Arc<PeerSession>, bool)>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<PeerSession>>,
    {
        let slot = {
            let existing = self.peers.read().await.get(peer_id).cloned();
            match existing {
                Some(slot) => slot,
                None => self
                    .peers
                    .write()
                    .await
                    .entry(peer_id.clone())
                    .or_default()
                    .clone(),
            }
        };

        let mut created = false;
        let opened = slot
            .get_or_try_init(|| {
                created = true;
                let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
                let fut = open(connection_id);
                async move { fut.await.map(Arc::new) }
            })
            .await
            .cloned();

        let registered = self
            .peers
            .read()
            .await
            .get(peer_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));

        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                if registered {
                    self.discard_empty(peer_id, &slot).await;
                }
                return Err(e);
            }
        };

        if !registered {
            debug!("Peer {peer_id} was removed while its session was opening");
            if created {
                self.release(&session).await;
            }
            return Err(MeshError::Closed);
        }
        if created {
            debug!("Registered peer {peer_id} ({} known)", self.len().await);
        }
        Ok((session, created))
    }

    /// Закрывает и забывает пира; повторное удаление ничего не делает
    pub async fn remove(&self, peer_id: &PeerId) -> bool {
        let removed = self.peers.write().await.remove(peer_id);
        match removed.and_then(|slot| slot.get().cloned()) {
            Some(session) => {
                self.release(&session).await;
                true
            }
            None => false,
        }
    }

    /// Удаляет пира, только если сессия принадлежит этому соединению
    pub async fn remove_connection(&self, peer_id: &PeerId, connection_id: u64) -> bool {
        let removed = {
            let mut peers = self.peers.write().await;
            let current = peers
                .get(peer_id)
                .and_then(|slot| slot.get())
                .map(|session| session.connection_id());
            match current {
                Some(id) if id == connection_id => peers.remove(peer_id),
                Some(_) => {
                    debug!("Ignoring stale connection {connection_id} of peer {peer_id}");
                    None
                }
                None => None,
            }
        };
        match removed.and_then(|slot| slot.get().cloned()) {
            Some(session) => {
                self.release(&session).await;
                true
            }
            None => false,
        }
    }

    /// Закрывает все сессии; возвращает их количество
    pub async fn clear(&self) -> usize {
        let drained: Vec<_> = self
            .peers
            .write()
            .await
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        for session in &drained {
            self.release(session).await;
        }
        drained.len()
    }

    pub async fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.peers
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self
            .peers
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Убирает ячейку, если открытие не удалось и её никто не заменил
    async fn discard_empty(&self, peer_id: &PeerId, slot: &Slot) {
        let mut peers = self.peers.write().await;
        let stale = peers
            .get(peer_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if stale {
            peers.remove(peer_id);
        }
    }

    async fn release(&self, session: &PeerSession) {
        session.close().await;
        if let Some(sink) = &self.sink {
            sink.detach(session.peer_id());
        }
        info!("Removed peer {}", session.peer_id());
    }
}
