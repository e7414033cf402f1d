//! Локальные медиа и их распространение по всем сессиям
//!
//! `LocalMediaState` читают все сессии, меняет только `TrackCoordinator`.
//! Захват камеры/экрана и отрисовка живут снаружи и видны ядру через
//! `LocalMediaProvider` и `RemoteRenderSink`.

use crate::error::Result;
use crate::peer::registry::PeerRegistry;
use crate::peer::types::{PeerId, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoSource {
    #[default]
    Camera,
    Screen,
}

/// Текущие исходящие треки
#[derive(Clone, Default)]
pub struct LocalMediaState {
    video: Option<LocalTrack>,
    audio: Option<LocalTrack>,
    source: VideoSource,
    // камера, отложенная на время демонстрации экрана
    parked_camera: Option<LocalTrack>,
}

impl LocalMediaState {
    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn source(&self) -> VideoSource {
        self.source
    }

    pub fn track(&self, kind: TrackKind) -> Option<LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.clone(),
            TrackKind::Video => self.video.clone(),
        }
    }

    /// Все присутствующие треки: аудио первым
    pub fn tracks(&self) -> Vec<(TrackKind, LocalTrack)> {
        [TrackKind::Audio, TrackKind::Video]
            .into_iter()
            .filter_map(|kind| self.track(kind).map(|t| (kind, t)))
            .collect()
    }

    /// Применяет изменение и возвращает затронутый вид трека
    fn apply(&mut self, change: MediaChange) -> Option<TrackKind> {
        match change {
            MediaChange::Audio(track) => {
                self.audio = track;
                Some(TrackKind::Audio)
            }
            MediaChange::Video(track) => {
                if self.source == VideoSource::Screen {
                    // камера включится после выхода из демонстрации
                    self.parked_camera = track;
                    return None;
                }
                self.video = track;
                Some(TrackKind::Video)
            }
            MediaChange::ScreenShareStarted(track) => {
                if self.source == VideoSource::Camera {
                    self.parked_camera = self.video.take();
                }
                self.source = VideoSource::Screen;
                self.video = Some(track);
                Some(TrackKind::Video)
            }
            MediaChange::ScreenShareStopped => {
                if self.source != VideoSource::Screen {
                    return None;
                }
                self.source = VideoSource::Camera;
                self.video = self.parked_camera.take();
                Some(TrackKind::Video)
            }
        }
    }
}

/// Изменение локальных медиа
#[derive(Clone)]
pub enum MediaChange {
    /// Камера включена (Some) или выключена (None)
    Video(Option<LocalTrack>),
    Audio(Option<LocalTrack>),
    ScreenShareStarted(LocalTrack),
    ScreenShareStopped,
}

impl std::fmt::Debug for MediaChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaChange::Video(t) => write!(f, "Video({})", if t.is_some() { "on" } else { "off" }),
            MediaChange::Audio(t) => write!(f, "Audio({})", if t.is_some() { "on" } else { "off" }),
            MediaChange::ScreenShareStarted(_) => f.write_str("ScreenShareStarted"),
            MediaChange::ScreenShareStopped => f.write_str("ScreenShareStopped"),
        }
    }
}

/// Общая ссылка на локальные медиа
#[derive(Clone, Default)]
pub struct SharedMedia(Arc<RwLock<LocalMediaState>>);

impl SharedMedia {
    pub async fn snapshot(&self) -> LocalMediaState {
        self.0.read().await.clone()
    }

    /// Держит изменения медиа, пока жив guard
    pub async fn read(&self) -> RwLockReadGuard<'_, LocalMediaState> {
        self.0.read().await
    }
}

/// Источник изменений локальных медиа (переключение устройств, экран)
#[async_trait]
pub trait LocalMediaProvider: Send {
    async fn next_change(&mut self) -> Option<MediaChange>;
}

#[async_trait]
impl LocalMediaProvider for mpsc::UnboundedReceiver<MediaChange> {
    async fn next_change(&mut self) -> Option<MediaChange> {
        self.recv().await
    }
}

/// Получатель входящих медиа (отрисовка)
pub trait RemoteRenderSink: Send + Sync {
    fn attach(&self, peer_id: &PeerId, track: Arc<TrackRemote>);

    fn detach(&self, peer_id: &PeerId);
}

#[derive(Clone)]
pub struct TrackCoordinator {
    media: SharedMedia,
    registry: Arc<PeerRegistry>,
}

impl TrackCoordinator {
    pub fn new(media: SharedMedia, registry: Arc<PeerRegistry>) -> Self {
        Self { media, registry }
    }

    pub fn media(&self) -> &SharedMedia {
        &self.media
    }

    /// Меняет локальные медиа и переносит изменение во все активные сессии
    pub async fn apply(&self, change: MediaChange) -> Result<()> {
        info!("Local media change: {change:?}");
        let (kind, track) = {
            let mut state = self.media.0.write().await;
            let Some(kind) = state.apply(change) else {
                debug!("Local media change does not affect outgoing tracks");
                return Ok(());
            };
            (kind, state.track(kind))
        };

        for session in self.registry.sessions().await {
            // ошибка одного пира не мешает остальным
            if let Err(e) = session.negotiation().update_track(kind, track.clone()).await {
                warn!(
                    "Failed to update {kind:?} track for peer {}: {e}",
                    session.peer_id()
                );
            }
        }
        Ok(())
    }

    /// Фоновая задача: применяет изменения от провайдера по порядку
    pub fn spawn<P>(self, mut provider: P) -> JoinHandle<()>
    where
        P: LocalMediaProvider + 'static,
    {
        tokio::spawn(async move {
            while let Some(change) = provider.next_change().await {
                if let Err(e) = self.apply(change).await {
                    warn!("Failed to apply local media change: {e}");
                }
            }
            debug!("Local media provider closed");
        })
    }
}
