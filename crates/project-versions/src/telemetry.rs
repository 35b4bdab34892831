use once_cell::sync::Lazy;
use prometheus::{opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SOURCE_UPLOAD_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("version_source_upload_bytes_total", "Total source bytes written to the artifact store").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static SOURCE_UPLOAD_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new("version_source_upload_duration_seconds", "Source upload+checksum duration seconds")).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});
pub static VERSIONS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("versions_created_total", "Project versions created").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static BUILDS_SCHEDULED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("version_builds_scheduled_total", "Build requests enqueued to the worker").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static BUILD_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("version_build_results_total", "Build callbacks applied"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static STALE_CALLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("version_build_callbacks_stale_total", "Build callbacks ignored because the request was no longer in flight").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static LEASES_ISSUED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("version_leases_issued_total", "Signed artifact leases issued"), &["artifact", "action"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static LEASE_SUBSTITUTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("version_lease_substitutions_total", "Dist read leases answered with the source artifact").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static DEPLOY_NOTIFY_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("version_deploy_notify_failures_total", "Deploy notifications that could not be delivered").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static DRAFTS_SWEPT: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("version_drafts_swept_total", "Abandoned unnumbered drafts removed by the sweep").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Text exposition of everything registered so far.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() { return String::new(); }
    String::from_utf8(buf).unwrap_or_default()
}
