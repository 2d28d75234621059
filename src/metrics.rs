use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters for decisions taken by the security layer
#[derive(Clone)]
pub struct Metrics {
    pub injections_blocked: Arc<AtomicU64>,
    pub traversals_blocked: Arc<AtomicU64>,
    pub assets_served: Arc<AtomicU64>,
    pub csrf_issued: Arc<AtomicU64>,
    pub csrf_rejected: Arc<AtomicU64>,
    pub logins_succeeded: Arc<AtomicU64>,
    pub logins_failed: Arc<AtomicU64>,
    pub legacy_migrations: Arc<AtomicU64>,
    pub refresh_rotations: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            injections_blocked: Arc::new(AtomicU64::new(0)),
            traversals_blocked: Arc::new(AtomicU64::new(0)),
            assets_served: Arc::new(AtomicU64::new(0)),
            csrf_issued: Arc::new(AtomicU64::new(0)),
            csrf_rejected: Arc::new(AtomicU64::new(0)),
            logins_succeeded: Arc::new(AtomicU64::new(0)),
            logins_failed: Arc::new(AtomicU64::new(0)),
            legacy_migrations: Arc::new(AtomicU64::new(0)),
            refresh_rotations: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn inc_injections_blocked(&self) {
        self.injections_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_traversals_blocked(&self) {
        self.traversals_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_assets_served(&self) {
        self.assets_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_csrf_issued(&self) {
        self.csrf_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_csrf_rejected(&self) {
        self.csrf_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_logins_succeeded(&self) {
        self.logins_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_logins_failed(&self) {
        self.logins_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_legacy_migrations(&self) {
        self.legacy_migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refresh_rotations(&self) {
        self.refresh_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            injections_blocked: self.injections_blocked.load(Ordering::Relaxed),
            traversals_blocked: self.traversals_blocked.load(Ordering::Relaxed),
            assets_served: self.assets_served.load(Ordering::Relaxed),
            csrf_issued: self.csrf_issued.load(Ordering::Relaxed),
            csrf_rejected: self.csrf_rejected.load(Ordering::Relaxed),
            logins_succeeded: self.logins_succeeded.load(Ordering::Relaxed),
            logins_failed: self.logins_failed.load(Ordering::Relaxed),
            legacy_migrations: self.legacy_migrations.load(Ordering::Relaxed),
            refresh_rotations: self.refresh_rotations.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub injections_blocked: u64,
    pub traversals_blocked: u64,
    pub assets_served: u64,
    pub csrf_issued: u64,
    pub csrf_rejected: u64,
    pub logins_succeeded: u64,
    pub logins_failed: u64,
    pub legacy_migrations: u64,
    pub refresh_rotations: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Prometheus text exposition of the snapshot.
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, u64); 9] = [
            ("injections_blocked", "Requests rejected for query operator injection", self.injections_blocked),
            ("traversals_blocked", "Static asset requests rejected by the path guard", self.traversals_blocked),
            ("assets_served", "Static assets served", self.assets_served),
            ("csrf_issued", "Anti-CSRF tokens issued", self.csrf_issued),
            ("csrf_rejected", "State-changing requests rejected for a bad CSRF token", self.csrf_rejected),
            ("logins_succeeded", "Successful logins", self.logins_succeeded),
            ("logins_failed", "Failed logins", self.logins_failed),
            ("legacy_migrations", "Legacy password hashes migrated to bcrypt", self.legacy_migrations),
            ("refresh_rotations", "Refresh tokens rotated", self.refresh_rotations),
        ];
        let mut body = String::new();
        for (name, help, value) in counters {
            body.push_str(&format!(
                "# HELP storegate_{name} {help}\n# TYPE storegate_{name} counter\nstoregate_{name} {value}\n"
            ));
        }
        body.push_str(&format!(
            "# HELP storegate_uptime_seconds Uptime seconds\n# TYPE storegate_uptime_seconds gauge\nstoregate_uptime_seconds {}\n",
            self.uptime_seconds
        ));
        body
    }
}
