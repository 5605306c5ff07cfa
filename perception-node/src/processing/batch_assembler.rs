//! Micro-batching for the centralised inference deployment.

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::frame_queue::FrameQueue;
use super::pipeline::{CameraPipeline, PipelineServices, PipelineSettings};
use crate::camera::FrameMessage;
use gatewatch_common::CameraConfig;

pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(20);

/// Collects frames from the shared queue into batches of at most
/// `batch_size`, closing a batch early once `batch_timeout` has passed since
/// the window opened.
pub struct BatchAssembler {
    queue: Arc<FrameQueue>,
    batch_size: usize,
    batch_timeout: Duration,
}

impl BatchAssembler {
    pub fn new(queue: Arc<FrameQueue>, batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            queue,
            batch_size: batch_size.max(1),
            batch_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Next batch in arrival order, or `None` if the window closed empty.
    pub async fn next_batch(&self) -> Option<Vec<FrameMessage>> {
        let deadline = Instant::now() + self.batch_timeout;
        let mut batch = Vec::with_capacity(self.batch_size);

        while batch.len() < self.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.queue.pop(remaining).await {
                Some(msg) => batch.push(msg),
                None => break,
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

/// Drives detection for batches and routes every frame to its camera's
/// pipeline. Pipelines are created on first use and live for the process.
pub struct BatchProcessor {
    assembler: BatchAssembler,
    cameras: HashMap<String, CameraConfig>,
    pipelines: DashMap<String, Arc<Mutex<CameraPipeline>>>,
    settings: PipelineSettings,
    services: PipelineServices,
}

impl BatchProcessor {
    pub fn new(assembler: BatchAssembler, cameras: &[CameraConfig], settings: PipelineSettings, services: PipelineServices) -> Self {
        Self {
            assembler,
            cameras: cameras.iter().map(|c| (c.code.clone(), c.clone())).collect(),
            pipelines: DashMap::new(),
            settings,
            services,
        }
    }

    /// Pipeline for `camera_code`, created if needed. The map entry is only
    /// locked for the lookup.
    pub fn pipeline(&self, camera_code: &str) -> Option<Arc<Mutex<CameraPipeline>>> {
        if let Some(existing) = self.pipelines.get(camera_code) {
            return Some(existing.clone());
        }
        let camera = self.cameras.get(camera_code)?;
        let entry = self.pipelines.entry(camera_code.to_string()).or_insert_with(|| {
            debug!(camera = %camera_code, "Creating camera pipeline");
            Arc::new(Mutex::new(CameraPipeline::new(
                camera.clone(),
                self.settings.clone(),
                self.services.clone(),
            )))
        });
        Some(entry.value().clone())
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Detect on every frame of the batch concurrently, then hand results to
    /// the pipelines in arrival order.
    pub async fn process_batch(&self, batch: Vec<FrameMessage>) {
        let detector = self.services.detector.clone();
        let results = join_all(batch.iter().map(|msg| detector.detect(&msg.frame))).await;

        for (msg, result) in batch.iter().zip(results) {
            let detections = match result {
                Ok(detections) => detections,
                Err(e) => {
                    warn!(camera = %msg.camera_code, "Detector failed, treating frame as empty: {}", e);
                    Vec::new()
                }
            };
            let Some(pipeline) = self.pipeline(&msg.camera_code) else {
                warn!(camera = %msg.camera_code, "Frame from unknown camera dropped");
                continue;
            };
            pipeline.lock().await.process_detections(msg, detections).await;
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.assembler.batch_size,
            timeout_ms = self.assembler.batch_timeout.as_millis() as u64,
            "Batch processor started"
        );
        while !*shutdown.borrow() {
            let Some(batch) = self.assembler.next_batch().await else {
                continue;
            };
            debug!(size = batch.len(), "Batch assembled");
            self.process_batch(batch).await;
            self.services.metrics.observe_queue(self.assembler.queue());
        }
        info!("Batch processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Frame;
    use crate::error::Result;
    use crate::inference::Detector;
    use crate::messaging::LogPublisher;
    use crate::recognition::IdentityMatcher;
    use crate::utils::metrics::Metrics;
    use async_trait::async_trait;
    use gatewatch_common::{BBox, Detection};

    fn message(camera: &str, sequence: u64) -> FrameMessage {
        FrameMessage {
            camera_code: camera.to_string(),
            frame: Arc::new(Frame::blank(64, 64)),
            timestamp: sequence as f64,
            sequence,
        }
    }

    #[tokio::test]
    async fn test_batch_closes_at_size() {
        let queue = Arc::new(FrameQueue::new(32));
        for seq in 1..=10 {
            queue.push(message("cam1", seq));
        }
        let assembler = BatchAssembler::new(queue.clone(), DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT);

        let first = assembler.next_batch().await.unwrap();
        assert_eq!(first.iter().map(|m| m.sequence).collect::<Vec<_>>(), (1..=8).collect::<Vec<_>>());
        let second = assembler.next_batch().await.unwrap();
        assert_eq!(second.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![9, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_closes_at_timeout() {
        let queue = Arc::new(FrameQueue::new(32));
        let producer = queue.clone();
        tokio::spawn(async move {
            producer.push(message("cam1", 1));
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.push(message("cam2", 1));
            tokio::time::sleep(Duration::from_millis(100)).await;
            producer.push(message("cam1", 2));
        });

        let assembler = BatchAssembler::new(queue, 8, Duration::from_millis(20));
        let started = Instant::now();
        let batch = assembler.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].camera_code, "cam2");
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_yields_none() {
        let assembler = BatchAssembler::new(Arc::new(FrameQueue::new(4)), 8, Duration::from_millis(20));
        assert!(assembler.next_batch().await.is_none());
    }

    struct OnePerson;

    #[async_trait]
    impl Detector for OnePerson {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(vec![Detection::person("", 0.0, BBox::new(10.0, 10.0, 30.0, 50.0), 0.9)])
        }
    }

    #[tokio::test]
    async fn test_routes_frames_to_camera_pipelines() {
        let services = PipelineServices {
            detector: Arc::new(OnePerson),
            embedder: None,
            matcher: Arc::new(IdentityMatcher::default()),
            publisher: Arc::new(LogPublisher),
            metrics: Arc::new(Metrics::new().unwrap()),
        };
        let cameras = vec![
            CameraConfig::new("cam1", "rtsp://10.0.0.5/live"),
            CameraConfig::new("cam2", "rtsp://10.0.0.6/live"),
        ];
        let assembler = BatchAssembler::new(Arc::new(FrameQueue::new(8)), 8, DEFAULT_BATCH_TIMEOUT);
        let processor = BatchProcessor::new(assembler, &cameras, PipelineSettings::default(), services.clone());

        processor
            .process_batch(vec![message("cam1", 1), message("cam2", 1), message("cam1", 2), message("cam9", 1)])
            .await;

        assert_eq!(processor.pipeline_count(), 2);
        let cam1 = processor.pipeline("cam1").unwrap();
        let cam1 = cam1.lock().await;
        assert_eq!(cam1.tracker().get(1).unwrap().hits, 2);
        assert_eq!(services.metrics.frames_processed("cam1"), 2);
        assert_eq!(services.metrics.frames_processed("cam2"), 1);
        assert!(processor.pipeline("cam9").is_none());
    }
}
