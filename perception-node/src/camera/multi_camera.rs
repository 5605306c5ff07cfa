use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::worker::{Backoff, CameraWorker, FrameHandler};
use super::{ConnectionState, VideoSourceFactory};
use crate::processing::frame_queue::FrameQueue;
use crate::processing::pipeline::{CameraPipeline, PipelineServices, PipelineSettings};
use crate::utils::metrics::Metrics;
use gatewatch_common::CameraConfig;

/// Spawns and tracks one worker task per camera.
pub struct MultiCameraManager {
    cameras: Vec<CameraConfig>,
    factory: Arc<dyn VideoSourceFactory>,
    backoff: Backoff,
    states: Arc<DashMap<String, ConnectionState>>,
    handles: DashMap<String, JoinHandle<()>>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
}

impl MultiCameraManager {
    pub fn new(
        cameras: Vec<CameraConfig>,
        factory: Arc<dyn VideoSourceFactory>,
        backoff: Backoff,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cameras,
            factory,
            backoff,
            states: Arc::new(DashMap::new()),
            handles: DashMap::new(),
            metrics,
            shutdown,
        }
    }

    pub fn list_cameras(&self) -> Vec<String> {
        self.cameras.iter().map(|c| c.code.clone()).collect()
    }

    pub fn states(&self) -> Arc<DashMap<String, ConnectionState>> {
        self.states.clone()
    }

    pub fn connection_state(&self, camera_code: &str) -> Option<ConnectionState> {
        self.states.get(camera_code).map(|s| *s.value())
    }

    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.value().is_finished()).count()
    }

    fn spawn<H: FrameHandler + 'static>(&self, camera: &CameraConfig, handler: H) {
        if self.handles.contains_key(&camera.code) {
            warn!(camera = %camera.code, "Worker already running");
            return;
        }
        let worker = CameraWorker::new(
            camera.clone(),
            self.factory.clone(),
            handler,
            self.backoff.clone(),
            self.states.clone(),
            self.metrics.clone(),
            self.shutdown.clone(),
        );
        self.handles.insert(camera.code.clone(), tokio::spawn(worker.run()));
    }

    /// Centralised shape: every worker feeds the shared queue.
    pub fn start_queued(&self, queue: Arc<FrameQueue>) {
        for camera in &self.cameras {
            self.spawn(camera, queue.clone());
        }
        info!("Started {} camera workers feeding the shared queue", self.cameras.len());
    }

    /// Inline shape: every worker owns its camera's pipeline.
    pub fn start_inline(&self, settings: &PipelineSettings, services: &PipelineServices) {
        for camera in &self.cameras {
            let pipeline = CameraPipeline::new(camera.clone(), settings.clone(), services.clone());
            self.spawn(camera, pipeline);
        }
        info!("Started {} camera workers with inline pipelines", self.cameras.len());
    }

    /// Wait up to `grace` for each worker to notice shutdown, aborting stragglers.
    pub async fn stop_all(&self, grace: Duration) {
        let codes: Vec<String> = self.handles.iter().map(|h| h.key().clone()).collect();
        for code in codes {
            let Some((_, mut handle)) = self.handles.remove(&code) else {
                continue;
            };
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(camera = %code, "Worker did not stop within {:?}, aborting", grace);
                handle.abort();
            }
        }
    }
}
