use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

pub const STREAMS_ACCEPTED: &str = "rtun_streams_accepted_total";
pub const STREAMS_ROUTED: &str = "rtun_streams_routed_total";
pub const STREAMS_DROPPED: &str = "rtun_streams_dropped_total";
pub const REGISTRATIONS: &str = "rtun_registrations_total";
pub const FORWARDS: &str = "rtun_forwards_total";
pub const ACTIVE_FORWARDS: &str = "rtun_active_forwards";
pub const BYTES_INGRESS: &str = "rtun_bytes_ingress_total";
pub const BYTES_EGRESS: &str = "rtun_bytes_egress_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// Counts a stream the router had to drop, labelled by why.
pub fn stream_dropped(reason: &'static str) {
    metrics::counter!(STREAMS_DROPPED, "reason" => reason).increment(1);
}

/// Keeps `rtun_active_forwards` accurate for the lifetime of one forwarded connection.
pub struct ActiveForwardGuard;

impl ActiveForwardGuard {
    pub fn new(proxy: &str) -> Self {
        metrics::counter!(FORWARDS, "proxy" => proxy.to_string()).increment(1);
        metrics::gauge!(ACTIVE_FORWARDS).increment(1.0);
        Self
    }
}

impl Drop for ActiveForwardGuard {
    fn drop(&mut self) {
        metrics::gauge!(ACTIVE_FORWARDS).decrement(1.0);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardInfo {
    pub id: String,
    pub proxy: String,
    pub local_addr: String,
    pub started_at_unix_ms: u64,
}

/// Forwarded connections currently in flight, keyed by id.
#[derive(Debug, Default)]
pub struct ForwardRegistry {
    forwards: DashMap<String, ForwardInfo>,
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self {
            forwards: DashMap::new(),
        }
    }

    pub fn add(&self, f: ForwardInfo) {
        self.forwards.insert(f.id.clone(), f);
    }

    pub fn remove(&self, id: &str) {
        self.forwards.remove(id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    pub fn snapshot(&self) -> Vec<ForwardInfo> {
        let mut out = Vec::with_capacity(self.forwards.len());
        for f in self.forwards.iter() {
            out.push(f.value().clone());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_forward_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("f{n}")
}

pub type SharedForwards = Arc<ForwardRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
