use crate::peer::types::{PeerId, ServerConfig};
use rand::Rng;

/// Размер пространства id: коллизии допустимы
pub const PEER_ID_SPACE: u32 = 1_000_000;

pub fn random_peer_id() -> PeerId {
    PeerId::from(rand::rng().random_range(0..PEER_ID_SPACE).to_string())
}

/// Топик встречи: префикс + id встречи
pub fn topic_for(prefix: &str, meeting_id: &str) -> String {
    format!("{prefix}{meeting_id}")
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
