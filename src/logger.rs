use tracing::{debug, info};
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

/// Временные метки в локальном времени, как в консоли приложения
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "[{}]", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Инициализация логирования; повторный вызов ничего не делает
pub fn init_logging() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    let _ = tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Тип кандидата по строке SDP: host / srflx / relay
pub fn candidate_kind(candidate: &str) -> &'static str {
    if candidate.contains("typ host") {
        "host"
    } else if candidate.contains("typ srflx") {
        "srflx"
    } else if candidate.contains("typ relay") {
        "relay"
    } else {
        "unknown"
    }
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            "Trickle {label}: kind={} candidate={} sdp_mid={:?} sdp_mline_index={:?}",
            candidate_kind(&init.candidate),
            init.candidate,
            init.sdp_mid,
            init.sdp_mline_index
        );
    }
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
