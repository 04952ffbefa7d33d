//! Node metrics
//!
//! Counters for the write path, forwarding, local installs and healing,
//! rendered in Prometheus text format on `/metrics`. One registry per node so
//! several nodes can share a process.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct NodeMetrics {
    pub writes_total: Counter,
    pub writes_failed: Counter,
    pub writes_forwarded: Counter,
    pub local_installs: Counter,
    pub local_installs_unchanged: Counter,
    pub local_removals: Counter,
    pub heal_runs: Counter,
    pub heal_repairs: Counter,
    pub peer_failures: Counter,
    pub replication_pushes: Counter,
    pub installed_services: Gauge,
    start_time: Instant,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            writes_total: Counter::new(),
            writes_failed: Counter::new(),
            writes_forwarded: Counter::new(),
            local_installs: Counter::new(),
            local_installs_unchanged: Counter::new(),
            local_removals: Counter::new(),
            heal_runs: Counter::new(),
            heal_repairs: Counter::new(),
            peer_failures: Counter::new(),
            replication_pushes: Counter::new(),
            installed_services: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self, node_id: &str, is_leader: bool) -> String {
        let mut out = String::new();
        let counters: [(&str, &str, &Counter); 10] = [
            ("writes_total", "Mutating operations executed on this node", &self.writes_total),
            ("writes_failed_total", "Mutating operations that failed", &self.writes_failed),
            ("writes_forwarded_total", "Mutating operations forwarded to the leader", &self.writes_forwarded),
            ("local_installs_total", "Local installs that changed state", &self.local_installs),
            ("local_installs_unchanged_total", "Local installs skipped on matching content", &self.local_installs_unchanged),
            ("local_removals_total", "Local uninstalls", &self.local_removals),
            ("heal_runs_total", "Heal sweeps run", &self.heal_runs),
            ("heal_repairs_total", "Follower mounts repaired by heal", &self.heal_repairs),
            ("peer_failures_total", "Failed peer calls", &self.peer_failures),
            ("replication_pushes_total", "Replication batches pushed to followers", &self.replication_pushes),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP minisvc_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minisvc_{} counter", name);
            let _ = writeln!(out, "minisvc_{}{{node=\"{}\"}} {}", name, node_id, counter.get());
        }

        out.push_str("# HELP minisvc_installed_services Services installed on this node\n");
        out.push_str("# TYPE minisvc_installed_services gauge\n");
        let _ = writeln!(
            out,
            "minisvc_installed_services{{node=\"{}\"}} {}",
            node_id,
            self.installed_services.get()
        );

        out.push_str("# HELP minisvc_is_leader Whether this node currently leads writes\n");
        out.push_str("# TYPE minisvc_is_leader gauge\n");
        let _ = writeln!(
            out,
            "minisvc_is_leader{{node=\"{}\"}} {}",
            node_id,
            u8::from(is_leader)
        );

        out.push_str("# HELP minisvc_uptime_seconds Server uptime in seconds\n");
        out.push_str("# TYPE minisvc_uptime_seconds gauge\n");
        let _ = writeln!(out, "minisvc_uptime_seconds {}", self.uptime_seconds());

        out
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
