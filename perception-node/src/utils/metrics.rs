//! Prometheus counters for the perception node.

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

use crate::error::{PerceptionError, Result};
use crate::processing::frame_queue::FrameQueue;

/// Metric names as constants for consistency.
pub mod names {
    pub const FRAMES_CAPTURED_TOTAL: &str = "gatewatch_frames_captured_total";
    pub const FRAMES_PROCESSED_TOTAL: &str = "gatewatch_frames_processed_total";
    pub const FRAMES_REJECTED_TOTAL: &str = "gatewatch_frames_rejected_total";
    pub const DETECTIONS_TOTAL: &str = "gatewatch_detections_total";
    pub const TRACKS_CREATED_TOTAL: &str = "gatewatch_tracks_created_total";
    pub const TRACKS_LOST_TOTAL: &str = "gatewatch_tracks_lost_total";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "gatewatch_events_published_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "gatewatch_publish_failures_total";
    pub const RECONNECTS_TOTAL: &str = "gatewatch_reconnects_total";
    pub const QUEUE_DEPTH: &str = "gatewatch_queue_depth";
    pub const QUEUE_DROPPED: &str = "gatewatch_queue_dropped";
}

pub struct Metrics {
    registry: Registry,
    frames_captured: IntCounterVec,
    frames_processed: IntCounterVec,
    frames_rejected: IntCounterVec,
    detections: IntCounterVec,
    tracks_created: IntCounterVec,
    tracks_lost: IntCounterVec,
    events_published: IntCounterVec,
    publish_failures: IntCounterVec,
    reconnects: IntCounterVec,
    queue_depth: IntGauge,
    queue_dropped: IntGauge,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn total(vec: &IntCounterVec) -> u64 {
    vec.collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let camera = &["camera"];

        Ok(Self {
            frames_captured: counter_vec(&registry, names::FRAMES_CAPTURED_TOTAL, "Frames decoded and emitted by camera workers", camera)?,
            frames_processed: counter_vec(&registry, names::FRAMES_PROCESSED_TOTAL, "Frames run through a camera pipeline", camera)?,
            frames_rejected: counter_vec(&registry, names::FRAMES_REJECTED_TOTAL, "Frames dropped for out-of-order timestamps", camera)?,
            detections: counter_vec(&registry, names::DETECTIONS_TOTAL, "Detections kept after filtering and dedup", camera)?,
            tracks_created: counter_vec(&registry, names::TRACKS_CREATED_TOTAL, "Tracks started", camera)?,
            tracks_lost: counter_vec(&registry, names::TRACKS_LOST_TOTAL, "Tracks expired", camera)?,
            events_published: counter_vec(&registry, names::EVENTS_PUBLISHED_TOTAL, "Events handed to the sink", &["camera", "event"])?,
            publish_failures: counter_vec(&registry, names::PUBLISH_FAILURES_TOTAL, "Events the sink rejected", camera)?,
            reconnects: counter_vec(&registry, names::RECONNECTS_TOTAL, "Camera connection attempts that failed or dropped", camera)?,
            queue_depth: gauge(&registry, names::QUEUE_DEPTH, "Frames waiting in the shared queue")?,
            queue_dropped: gauge(&registry, names::QUEUE_DROPPED, "Frames evicted from the shared queue")?,
            registry,
        })
    }

    pub fn inc_frames_captured(&self, camera: &str) {
        self.frames_captured.with_label_values(&[camera]).inc();
    }

    pub fn inc_frames_processed(&self, camera: &str) {
        self.frames_processed.with_label_values(&[camera]).inc();
    }

    pub fn inc_frames_rejected(&self, camera: &str) {
        self.frames_rejected.with_label_values(&[camera]).inc();
    }

    pub fn add_detections(&self, camera: &str, count: usize) {
        self.detections.with_label_values(&[camera]).inc_by(count as u64);
    }

    pub fn inc_tracks_created(&self, camera: &str) {
        self.tracks_created.with_label_values(&[camera]).inc();
    }

    pub fn inc_tracks_lost(&self, camera: &str) {
        self.tracks_lost.with_label_values(&[camera]).inc();
    }

    pub fn inc_events_published(&self, camera: &str, event: &str) {
        self.events_published.with_label_values(&[camera, event]).inc();
    }

    pub fn inc_publish_failures(&self, camera: &str) {
        self.publish_failures.with_label_values(&[camera]).inc();
    }

    pub fn inc_reconnect(&self, camera: &str) {
        self.reconnects.with_label_values(&[camera]).inc();
    }

    pub fn observe_queue(&self, queue: &FrameQueue) {
        self.queue_depth.set(queue.len() as i64);
        self.queue_dropped.set(queue.dropped() as i64);
    }

    pub fn frames_captured(&self, camera: &str) -> u64 {
        self.frames_captured.with_label_values(&[camera]).get()
    }

    pub fn frames_processed(&self, camera: &str) -> u64 {
        self.frames_processed.with_label_values(&[camera]).get()
    }

    pub fn events_published(&self, camera: &str, event: &str) -> u64 {
        self.events_published.with_label_values(&[camera, event]).get()
    }

    pub fn publish_failures(&self, camera: &str) -> u64 {
        self.publish_failures.with_label_values(&[camera]).get()
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.get()
    }

    fn snapshot(&self) -> Totals {
        Totals {
            captured: total(&self.frames_captured),
            processed: total(&self.frames_processed),
            detections: total(&self.detections),
            events: total(&self.events_published),
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn gather_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| PerceptionError::SerializationError(e.to_string()))
    }

    /// Log throughput every `interval` until shutdown.
    pub async fn report_loop(self: Arc<Self>, interval: Duration, queue: Option<Arc<FrameQueue>>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut last = self.snapshot();
        let mut last_at = Instant::now();

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

            if let Some(queue) = &queue {
                self.observe_queue(queue);
            }
            let now = self.snapshot();
            let secs = last_at.elapsed().as_secs_f64().max(f64::EPSILON);
            info!(
                capture_fps = %format!("{:.1}", now.captured.saturating_sub(last.captured) as f64 / secs),
                process_fps = %format!("{:.1}", now.processed.saturating_sub(last.processed) as f64 / secs),
                detections_per_sec = %format!("{:.1}", now.detections.saturating_sub(last.detections) as f64 / secs),
                events = now.events,
                queue_depth = self.queue_depth.get(),
                queue_dropped = self.queue_dropped.get(),
                "Pipeline throughput"
            );
            last = now;
            last_at = Instant::now();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Totals {
    captured: u64,
    processed: u64,
    detections: u64,
    events: u64,
}
