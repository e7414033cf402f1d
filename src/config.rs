// Конфигурация mesh-узла
// Логирование можно отключить только в режиме разработки

use crate::error::{MeshError, Result};
use crate::peer::types::{PeerId, ServerConfig};
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Префикс топика: итоговый канал = префикс + id встречи
pub const DEFAULT_TOPIC_PREFIX: &str = "webrtc/";

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 30_000;

/// Настройки mesh-узла
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub topic_prefix: String,
    /// Собственный id; генерируется при старте, если не задан
    pub local_id: Option<PeerId>,
    pub heartbeat_interval_ms: u64,
    pub sweep_interval_ms: u64,
    /// Пир удаляется, если молчит строго дольше этого значения
    pub peer_timeout_ms: u64,
    pub ice_servers: Vec<ServerConfig>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            local_id: None,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            ice_servers: vec![ServerConfig {
                id: "default-stun".into(),
                r#type: "stun".into(),
                url: "stun:stun.l.google.com:19302".into(),
                username: None,
                credential: None,
            }],
        }
    }
}

impl MeshConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: MeshConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(MeshError::Config("intervals must be non-zero".into()));
        }
        if self.peer_timeout_ms == 0 {
            return Err(MeshError::Config("peer timeout must be non-zero".into()));
        }

        // Валидация серверов
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(MeshError::Config(format!(
                    "ICE server '{}' has an empty URL",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(MeshError::Config(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    /// ICE серверы в формате webrtc-rs
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|config| RTCIceServer {
                urls: vec![add_ice_url_scheme(config)],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            })
            .collect()
    }
}
