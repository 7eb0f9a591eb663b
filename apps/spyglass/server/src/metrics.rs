use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CONNECTIONS_ACCEPTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "spyglass_connections_accepted_total",
            "Connections classified by role tag",
        ),
        &["role"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ADMISSIONS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "spyglass_admissions_rejected_total",
            "Admissions refused, by role and reason",
        ),
        &["role", "reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PROTOCOL_VIOLATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "spyglass_protocol_violations_total",
            "Connections closed for malformed or unexpected input",
        ),
        &["role"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static LIVE_SESSIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("spyglass_live_sessions", "Registered primary sessions"),
        &["side"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static FRAMES_RELAYED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "spyglass_frames_relayed_total",
            "Frames forwarded to a peer, by component",
        ),
        &["component"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONTROL_EVENTS_QUEUED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "spyglass_control_events_queued_total",
        "Control events accepted from watchers",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
