use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay counters, sampled lock-free and rendered as a Prometheus text
/// exposition on demand.
#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    messages_queued: AtomicU64,
    messages_flushed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_flushed(&self, count: u64) {
        self.messages_flushed.fetch_add(count, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        let samples = [
            (
                "sotto_connections_active",
                "gauge",
                self.connections_active.load(Ordering::SeqCst),
            ),
            (
                "sotto_frames_ingress",
                "counter",
                self.frames_ingress.load(Ordering::SeqCst),
            ),
            (
                "sotto_frames_egress",
                "counter",
                self.frames_egress.load(Ordering::SeqCst),
            ),
            (
                "sotto_messages_queued",
                "counter",
                self.messages_queued.load(Ordering::SeqCst),
            ),
            (
                "sotto_messages_flushed",
                "counter",
                self.messages_flushed.load(Ordering::SeqCst),
            ),
        ];
        let mut exposition = String::new();
        for (name, kind, value) in samples {
            let _ = writeln!(exposition, "# TYPE {name} {kind}");
            let _ = writeln!(exposition, "{name} {value}");
        }
        exposition
    }
}
