//! Переговоры offer/answer с одним удалённым пиром
//!
//! Схема "perfect negotiation": при встречных offer (glare) polite-сторона
//! откатывает свой offer и отвечает на чужой, impolite-сторона игнорирует
//! входящий offer и ждёт ответа на свой. Все шаги для одного пира идут строго
//! по очереди под `inner`; флаг `making_offer` берётся до ожидания очереди,
//! поэтому одновременные триггеры склеиваются в один offer. Изменение,
//! пришедшее не в stable, запоминается и уходит новым offer после ответа.

use crate::error::Result;
use crate::media::LocalTrack;
use crate::peer::connection::MediaConnection;
use crate::peer::types::{IceCandidate, PeerId, SessionDescription, SignalingState, TrackKind};
use crate::signaling::Signaler;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Ни одного описания ещё не применено
    Idle,
    /// Свой offer выставлен, ответа нет
    OfferPending,
    Stable,
    Closed,
}

/// Снимок флагов переговоров
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationState {
    pub polite: bool,
    pub making_offer: bool,
    pub awaiting_answer: bool,
}

/// Захват makingOffer; сбрасывается ровно один раз при любом выходе
struct OfferGuard<'a>(&'a AtomicBool);

impl<'a> OfferGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| OfferGuard(flag))
    }
}

impl Drop for OfferGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    phase: NegotiationPhase,
    awaiting_answer: bool,
    remote_applied: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

pub struct NegotiationSession {
    remote_id: PeerId,
    polite: bool,
    connection: Arc<dyn MediaConnection>,
    signaler: Signaler,
    making_offer: AtomicBool,
    // нужен ещё один offer после возврата в stable
    renegotiation_pending: AtomicBool,
    closed: AtomicBool,
    inner: Mutex<Inner>,
}

impl NegotiationSession {
    pub fn new(remote_id: PeerId, connection: Arc<dyn MediaConnection>, signaler: Signaler) -> Self {
        let polite = signaler.local_id().is_polite_towards(&remote_id);
        debug!(
            "Negotiation with peer {remote_id}: local side is {}",
            if polite { "polite" } else { "impolite" }
        );
        Self {
            remote_id,
            polite,
            connection,
            signaler,
            making_offer: AtomicBool::new(false),
            renegotiation_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                phase: NegotiationPhase::Idle,
                awaiting_answer: false,
                remote_applied: false,
                pending_candidates: VecDeque::new(),
            }),
        }
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connection(&self) -> &Arc<dyn MediaConnection> {
        &self.connection
    }

    pub async fn phase(&self) -> NegotiationPhase {
        self.inner.lock().await.phase
    }

    pub async fn state(&self) -> NegotiationState {
        let inner = self.inner.lock().await;
        NegotiationState {
            polite: self.polite,
            making_offer: self.making_offer.load(Ordering::Acquire),
            awaiting_answer: inner.awaiting_answer,
        }
    }

    pub async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    /// Есть изменение, которое ещё не ушло в offer
    pub fn renegotiation_pending(&self) -> bool {
        self.renegotiation_pending.load(Ordering::Acquire)
    }

    /// Локальный состав медиа изменился: нужен новый offer
    pub async fn on_negotiation_needed(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let Some(guard) = OfferGuard::acquire(&self.making_offer) else {
            self.renegotiation_pending.store(true, Ordering::Release);
            debug!("Offer to peer {} already in progress, coalescing", self.remote_id);
            return Ok(());
        };

        let mut inner = self.inner.lock().await;
        let result = self.offer_locked(&mut inner).await;
        // флаг снимается, пока очередь ещё наша: следующий триггер
        // увидит состояние после этого offer
        drop(guard);
        result
    }

    /// Входящий offer или answer
    pub async fn on_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.is_closed() {
            debug!("Session with peer {} is closed, dropping description", self.remote_id);
            return Ok(());
        }
        self.apply_remote_description(desc).await?;

        if self.renegotiation_pending() && !self.is_closed() {
            debug!("Sending deferred offer to peer {}", self.remote_id);
            if let Err(e) = self.on_negotiation_needed().await {
                warn!("Deferred offer to peer {} failed: {e}", self.remote_id);
            }
        }
        Ok(())
    }

    /// Входящий кандидат: применяется сразу или ждёт remote description
    pub async fn on_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        if inner.remote_applied {
            self.apply_candidate(candidate).await;
        } else {
            inner.pending_candidates.push_back(candidate);
            debug!(
                "Buffered ICE candidate for peer {} ({} pending)",
                self.remote_id,
                inner.pending_candidates.len()
            );
        }
        Ok(())
    }

    /// Замена исходящего трека и, при необходимости, новый offer
    pub async fn update_track(&self, kind: TrackKind, track: Option<LocalTrack>) -> Result<()> {
        let update = {
            let _inner = self.inner.lock().await;
            if self.is_closed() {
                return Ok(());
            }
            self.connection.replace_track(kind, track).await?
        };
        debug!(
            "Replaced {kind:?} track for peer {}: direction={:?}",
            self.remote_id, update.direction
        );

        if update.renegotiate {
            self.on_negotiation_needed().await?;
        }
        Ok(())
    }

    /// Освобождает соединение; повторный вызов ничего не делает
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // закрытие обрывает шаг, который сейчас держит очередь
        let result = self.connection.close().await;

        let mut inner = self.inner.lock().await;
        inner.pending_candidates.clear();
        inner.phase = NegotiationPhase::Closed;
        info!("Closed session with peer {}", self.remote_id);
        result
    }

    async fn offer_locked(&self, inner: &mut Inner) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let signaling = self.connection.signaling_state();
        if signaling != SignalingState::Stable {
            self.renegotiation_pending.store(true, Ordering::Release);
            debug!(
                "Deferring offer to peer {}: signaling state is {signaling:?}",
                self.remote_id
            );
            return Ok(());
        }

        self.renegotiation_pending.store(false, Ordering::Release);
        let result = self.send_offer(inner).await;
        if result.is_err() {
            // повтор при следующем переходе в stable или следующем триггере
            self.renegotiation_pending.store(true, Ordering::Release);
        }
        result
    }

    async fn send_offer(&self, inner: &mut Inner) -> Result<()> {
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        let previous = std::mem::replace(&mut inner.phase, NegotiationPhase::OfferPending);
        info!("Created and set local offer for peer {}", self.remote_id);

        if let Err(e) = self.signaler.unicast(offer.into(), &self.remote_id).await {
            // offer, которого пир не увидит, не должен держать have-local-offer
            if let Err(rollback) = self.connection.rollback().await {
                warn!("Failed to roll back undelivered offer to peer {}: {rollback}", self.remote_id);
            }
            inner.phase = previous;
            return Err(e);
        }
        Ok(())
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        let signaling = self.connection.signaling_state();
        let collision = desc.is_offer()
            && (self.making_offer.load(Ordering::Acquire) || signaling != SignalingState::Stable);

        if collision && !self.polite {
            warn!(
                "Ignored an incoming offer from peer {} due to collision",
                self.remote_id
            );
            return Ok(());
        }

        if collision && signaling == SignalingState::HaveLocalOffer {
            // уступаем: свой offer отбрасываем
            self.connection.rollback().await?;
            inner.phase = if inner.remote_applied {
                NegotiationPhase::Stable
            } else {
                NegotiationPhase::Idle
            };
            info!("Rolled back local offer in favour of peer {}", self.remote_id);
        }

        let is_offer = desc.is_offer();
        inner.awaiting_answer = !is_offer;
        let applied = self.connection.set_remote_description(desc).await;
        inner.awaiting_answer = false;
        if let Err(e) = applied {
            warn!(
                "Error setting remote description for peer {}: {e}",
                self.remote_id
            );
            return Err(e);
        }

        if !is_offer {
            inner.remote_applied = true;
            inner.phase = NegotiationPhase::Stable;
            self.flush_candidates(&mut inner).await;
            debug!("Applied answer from peer {}", self.remote_id);
            return Ok(());
        }

        let answer = match self.create_local_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                // входящий offer снимается, соединение возвращается в stable
                warn!(
                    "Failed to answer offer from peer {}, rolling back: {e}",
                    self.remote_id
                );
                if let Err(rollback) = self.connection.rollback().await {
                    warn!("Failed to roll back offer from peer {}: {rollback}", self.remote_id);
                }
                return Err(e);
            }
        };
        inner.remote_applied = true;
        inner.phase = NegotiationPhase::Stable;
        self.flush_candidates(&mut inner).await;
        info!("Created and set local answer for peer {}", self.remote_id);

        // answer уже стоит локально: при сбое отправки откатывать нечего
        self.signaler.unicast(answer.into(), &self.remote_id).await?;
        Ok(())
    }

    async fn create_local_answer(&self) -> Result<SessionDescription> {
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn flush_candidates(&self, inner: &mut Inner) {
        if inner.pending_candidates.is_empty() {
            return;
        }
        debug!(
            "Adding {} buffered ICE candidates for peer {}",
            inner.pending_candidates.len(),
            self.remote_id
        );
        while let Some(candidate) = inner.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        match self.connection.add_ice_candidate(candidate).await {
            Ok(()) => debug!("Added ICE candidate for peer {}", self.remote_id),
            Err(e) => warn!("Error adding ICE candidate for peer {}: {e}", self.remote_id),
        }
    }
}
