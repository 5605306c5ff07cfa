use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::camera::ConnectionState;
use crate::processing::frame_queue::FrameQueue;
use crate::recognition::IdentityMatcher;
use gatewatch_common::utils::format_duration;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub node_id: String,
    pub uptime_secs: u64,
    pub cameras: BTreeMap<String, String>,
    pub connected: usize,
    pub queue_depth: Option<usize>,
    pub queue_dropped: Option<u64>,
    pub identities: usize,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_degraded(&self) -> bool {
        self.connected < self.cameras.len()
    }
}

/// Periodically logs camera connection states, queue pressure and uptime.
pub struct HealthMonitor {
    node_id: String,
    expected: Vec<String>,
    states: Arc<DashMap<String, ConnectionState>>,
    queue: Option<Arc<FrameQueue>>,
    matcher: Arc<IdentityMatcher>,
    started_at: DateTime<Utc>,
}

impl HealthMonitor {
    pub fn new(
        node_id: impl Into<String>,
        expected: Vec<String>,
        states: Arc<DashMap<String, ConnectionState>>,
        queue: Option<Arc<FrameQueue>>,
        matcher: Arc<IdentityMatcher>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            expected,
            states,
            queue,
            matcher,
            started_at: Utc::now(),
        }
    }

    pub fn report(&self) -> HealthReport {
        let now = Utc::now();
        let cameras: BTreeMap<String, String> = self
            .expected
            .iter()
            .map(|code| {
                let state = self
                    .states
                    .get(code)
                    .map(|s| s.value().to_string())
                    .unwrap_or_else(|| "stopped".to_string());
                (code.clone(), state)
            })
            .collect();
        let connected = self
            .expected
            .iter()
            .filter(|code| self.states.get(*code).map_or(false, |s| *s.value() == ConnectionState::Connected))
            .count();

        HealthReport {
            node_id: self.node_id.clone(),
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            cameras,
            connected,
            queue_depth: self.queue.as_ref().map(|q| q.len()),
            queue_dropped: self.queue.as_ref().map(|q| q.dropped()),
            identities: self.matcher.len(),
            checked_at: now,
        }
    }

    pub async fn start(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            let report = self.report();
            let uptime = format_duration(Duration::from_secs(report.uptime_secs));
            if report.is_degraded() {
                warn!(
                    node = %report.node_id,
                    uptime = %uptime,
                    connected = report.connected,
                    cameras = ?report.cameras,
                    "Health check: degraded"
                );
            } else {
                info!(
                    node = %report.node_id,
                    uptime = %uptime,
                    connected = report.connected,
                    queue_depth = ?report.queue_depth,
                    identities = report.identities,
                    "Health check: ok"
                );
            }
        }
    }
}
