use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static COMMANDS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "teleop_commands_published_total",
            "Command records written to the session command slot",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EMERGENCY_STOP_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "teleop_emergency_stop_transitions_total",
            "Deadman latch transitions",
        ),
        &["transition"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CREDENTIAL_EXCHANGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "teleop_credential_exchanges_total",
            "Pairing code exchanges by outcome",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static REVOCATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "teleop_revocations_total",
            "Authority disconnect requests by verification outcome",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static VIDEO_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "teleop_video_reconnect_attempts_total",
            "Video rejoin attempts by trigger",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static VIDEO_FRAME_RATE: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new(
        "teleop_video_frame_rate",
        "Remote video frames per second over the last sample window",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static SESSION_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("teleop_session_active", "1 while a session is Active").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Prometheus text exposition of every registered metric.
pub fn render() -> String {
    Lazy::force(&COMMANDS_PUBLISHED);
    Lazy::force(&EMERGENCY_STOP_TRANSITIONS);
    Lazy::force(&CREDENTIAL_EXCHANGES);
    Lazy::force(&REVOCATIONS);
    Lazy::force(&VIDEO_RECONNECTS);
    Lazy::force(&VIDEO_FRAME_RATE);
    Lazy::force(&SESSION_ACTIVE);

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_families() {
        COMMANDS_PUBLISHED.with_label_values(&["ok"]).inc();
        let text = render();
        assert!(text.contains("teleop_commands_published_total"));
        assert!(text.contains("teleop_session_active"));
    }
}
