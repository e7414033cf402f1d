//! Ошибки mesh-ядра
//!
//! Все ошибки локальны для одного пира: ни одна не роняет процесс.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    /// publish/subscribe отклонён транспортом
    #[error("Transport error: {0}")]
    Transport(String),

    /// Не удалось создать/применить offer или answer
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Candidate error: {0}")]
    Candidate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Peer session is closed")]
    Closed,

    #[error("Not joined to a meeting")]
    NotJoined,

    #[error("Already joined to meeting '{0}'")]
    AlreadyJoined(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

impl MeshError {
    pub fn transport(msg: impl Into<String>) -> Self {
        MeshError::Transport(msg.into())
    }

    pub fn negotiation(msg: impl Into<String>) -> Self {
        MeshError::Negotiation(msg.into())
    }

    /// Ошибка касается только одного пира (всё, кроме конфигурации)
    pub fn is_peer_scoped(&self) -> bool {
        !matches!(self, MeshError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
