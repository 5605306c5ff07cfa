use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ConnectionState, FrameMessage, VideoSource, VideoSourceFactory};
use crate::processing::frame_queue::FrameQueue;
use crate::utils::metrics::Metrics;
use gatewatch_common::utils::current_timestamp_secs;
use gatewatch_common::CameraConfig;

/// Exponential reconnect delay with up to one second of random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to sleep before the next attempt; doubles the base up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        let delay = self.current + Duration::from_secs_f64(jitter);
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Destination for frames a worker emits.
#[async_trait]
pub trait FrameHandler: Send {
    async fn handle_frame(&mut self, msg: FrameMessage);
}

#[async_trait]
impl FrameHandler for Arc<FrameQueue> {
    async fn handle_frame(&mut self, msg: FrameMessage) {
        self.push(msg);
    }
}

/// Owns one camera: connects, reconnects forever with backoff, throttles
/// decoding to the camera's target fps and hands frames to its handler.
pub struct CameraWorker<H: FrameHandler> {
    camera: CameraConfig,
    factory: Arc<dyn VideoSourceFactory>,
    handler: H,
    backoff: Backoff,
    states: Arc<DashMap<String, ConnectionState>>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
    sequence: u64,
    last_timestamp: f64,
}

impl<H: FrameHandler> CameraWorker<H> {
    pub fn new(
        camera: CameraConfig,
        factory: Arc<dyn VideoSourceFactory>,
        handler: H,
        backoff: Backoff,
        states: Arc<DashMap<String, ConnectionState>>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            camera,
            factory,
            handler,
            backoff,
            states,
            metrics,
            shutdown,
            sequence: 0,
            last_timestamp: 0.0,
        }
    }

    pub async fn run(mut self) {
        let code = self.camera.code.clone();
        info!(camera = %code, "Camera worker started");

        while !self.is_shutdown() {
            self.set_state(ConnectionState::Connecting);

            let mut source = match self.factory.open(&self.camera).await {
                Ok(source) => source,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(camera = %code, "Failed to open stream: {:#}. Retrying in {:.1}s", e, delay.as_secs_f64());
                    self.metrics.inc_reconnect(&code);
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnectionState::Connected);
            info!(camera = %code, "Connected");

            self.stream(source.as_mut()).await;
            source.release().await;

            if self.is_shutdown() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            let delay = self.backoff.next_delay();
            warn!(camera = %code, "Stream lost, reconnecting in {:.1}s", delay.as_secs_f64());
            self.metrics.inc_reconnect(&code);
            if self.sleep_or_shutdown(delay).await {
                break;
            }
        }

        self.states.remove(&code);
        info!(camera = %code, "Camera worker stopped");
    }

    /// Pull frames until the source fails or shutdown is requested.
    async fn stream(&mut self, source: &mut dyn VideoSource) {
        let interval = Duration::from_secs_f64(1.0 / self.camera.target_fps.max(1) as f64);
        let mut last_emitted: Option<Instant> = None;

        loop {
            if self.is_shutdown() {
                return;
            }
            if !source.grab().await {
                return;
            }

            let now = Instant::now();
            if last_emitted.map_or(false, |last| now.duration_since(last) < interval) {
                tokio::task::yield_now().await;
                continue;
            }

            let Some(frame) = source.retrieve().await else {
                debug!(camera = %self.camera.code, "Decode failed, skipping frame");
                continue;
            };
            // Healthy once the first frame arrives.
            if last_emitted.is_none() {
                self.backoff.reset();
            }
            last_emitted = Some(now);

            // Keep per-camera timestamps strictly increasing even if the wall clock steps back.
            let timestamp = current_timestamp_secs().max(self.last_timestamp + 1e-6);
            self.last_timestamp = timestamp;
            self.sequence += 1;

            self.metrics.inc_frames_captured(&self.camera.code);
            self.handler
                .handle_frame(FrameMessage {
                    camera_code: self.camera.code.clone(),
                    frame: Arc::new(frame),
                    timestamp,
                    sequence: self.sequence,
                })
                .await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.states.insert(self.camera.code.clone(), state);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Returns true if shutdown was requested while sleeping.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.is_shutdown(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}
