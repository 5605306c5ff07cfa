//! Per-camera processing context: detections in, lifecycle events out.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::dedup::deduplicate;
use super::lifecycle::TrackLifecycle;
use super::tracker::{IouTracker, TrackerConfig, TrackerUpdate};
use crate::camera::worker::FrameHandler;
use crate::camera::{Frame, FrameMessage};
use crate::config::PerceptionConfig;
use crate::inference::{Detector, FaceEmbedder, FaceEmbedding};
use crate::messaging::EventPublisher;
use crate::recognition::IdentityMatcher;
use crate::utils::metrics::Metrics;
use gatewatch_common::{BBox, CameraConfig, Detection};

pub const DEFAULT_PERSON_ROI_PADDING: f32 = 40.0;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub dedup_threshold: f32,
    pub person_roi_padding: f32,
    pub recognition_enabled: bool,
    pub match_threshold: f32,
    pub tracker: TrackerConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dedup_threshold: super::dedup::DEFAULT_DEDUP_THRESHOLD,
            person_roi_padding: DEFAULT_PERSON_ROI_PADDING,
            recognition_enabled: true,
            match_threshold: crate::recognition::DEFAULT_MATCH_THRESHOLD,
            tracker: TrackerConfig::default(),
        }
    }
}

impl From<&PerceptionConfig> for PipelineSettings {
    fn from(config: &PerceptionConfig) -> Self {
        Self {
            dedup_threshold: config.processing.dedup_iou_threshold,
            person_roi_padding: config.processing.person_roi_padding,
            recognition_enabled: config.recognition.enabled,
            match_threshold: config.recognition.match_threshold,
            tracker: TrackerConfig::from(&config.tracking),
        }
    }
}

/// Handles shared by every camera pipeline.
#[derive(Clone)]
pub struct PipelineServices {
    pub detector: Arc<dyn Detector>,
    pub embedder: Option<Arc<dyn FaceEmbedder>>,
    pub matcher: Arc<IdentityMatcher>,
    pub publisher: Arc<dyn EventPublisher>,
    pub metrics: Arc<Metrics>,
}

/// Pad a track box, clip it to the frame and crop. Returns the crop together
/// with the region it was cut from, or `None` when the region is empty.
pub fn person_roi(frame: &Frame, bbox: &BBox, padding: f32) -> Option<(Frame, BBox)> {
    let region = bbox.expand(padding, frame.width, frame.height);
    if !region.is_valid() {
        return None;
    }
    let crop = frame.crop(&region)?;
    Some((crop, region))
}

/// Owns one camera's tracker and lifecycle records. Frames must arrive in
/// capture order; a frame whose timestamp does not advance is dropped.
pub struct CameraPipeline {
    camera: CameraConfig,
    settings: PipelineSettings,
    services: PipelineServices,
    tracker: IouTracker,
    lifecycle: TrackLifecycle,
    last_timestamp: Option<f64>,
}

impl CameraPipeline {
    pub fn new(camera: CameraConfig, settings: PipelineSettings, services: PipelineServices) -> Self {
        let tracker = IouTracker::new(settings.tracker.clone());
        let lifecycle = TrackLifecycle::new(camera.code.clone(), services.publisher.clone(), services.metrics.clone());
        Self {
            camera,
            settings,
            services,
            tracker,
            lifecycle,
            last_timestamp: None,
        }
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn tracker(&self) -> &IouTracker {
        &self.tracker
    }

    pub fn lifecycle(&self) -> &TrackLifecycle {
        &self.lifecycle
    }

    fn in_order(&self, msg: &FrameMessage) -> bool {
        match self.last_timestamp {
            Some(last) if msg.timestamp <= last => {
                warn!(
                    camera = %self.camera.code,
                    sequence = msg.sequence,
                    "Dropping out-of-order frame ({:.3} <= {:.3})",
                    msg.timestamp,
                    last
                );
                self.services.metrics.inc_frames_rejected(&self.camera.code);
                false
            }
            _ => true,
        }
    }

    /// Run the detector on the frame and process the result. Detector
    /// failures count as an empty frame.
    #[instrument(skip(self, msg), fields(camera = %msg.camera_code, sequence = msg.sequence), level = "debug")]
    pub async fn process_frame(&mut self, msg: &FrameMessage) -> Option<TrackerUpdate> {
        if !self.in_order(msg) {
            return None;
        }
        let detections = match self.services.detector.detect(&msg.frame).await {
            Ok(detections) => detections,
            Err(e) => {
                warn!(camera = %self.camera.code, "Detector failed, treating frame as empty: {}", e);
                Vec::new()
            }
        };
        self.process_detections(msg, detections).await
    }

    /// Filter, deduplicate, track and emit lifecycle events for one frame's
    /// detections. Returns `None` if the frame was rejected as out of order.
    #[instrument(skip(self, msg, detections), fields(camera = %msg.camera_code, sequence = msg.sequence), level = "debug")]
    pub async fn process_detections(&mut self, msg: &FrameMessage, detections: Vec<Detection>) -> Option<TrackerUpdate> {
        if !self.in_order(msg) {
            return None;
        }
        self.last_timestamp = Some(msg.timestamp);
        let metrics = self.services.metrics.clone();
        metrics.inc_frames_processed(&self.camera.code);

        let (faces, persons) = self.prepare(msg, detections);
        metrics.add_detections(&self.camera.code, faces.len() + persons.len());

        let boxes: Vec<BBox> = persons.iter().map(|d| d.bbox).collect();
        let update = self.tracker.update(&boxes, msg.timestamp);

        for &id in &update.lost {
            self.lifecycle.track_lost(id).await;
        }
        for &(id, bbox) in &update.active {
            self.lifecycle.observe(id, bbox, msg.timestamp).await;
        }

        let mut with_face = Vec::new();
        let mut seen = HashSet::new();
        for face in &faces {
            let (cx, cy) = face.bbox.center();
            if let Some(&(id, bbox)) = update.active.iter().find(|(_, b)| b.contains_point(cx, cy)) {
                self.lifecycle.face_detected(id).await;
                if seen.insert(id) {
                    with_face.push((id, bbox));
                }
            }
        }

        if self.settings.recognition_enabled {
            for (id, bbox) in with_face {
                self.recognize(&msg.frame, id, bbox).await;
            }
        }

        debug!(
            camera = %self.camera.code,
            persons = persons.len(),
            faces = faces.len(),
            active = update.active.len(),
            lost = update.lost.len(),
            "Frame processed"
        );
        Some(update)
    }

    /// Stamp, clip, ROI-filter and deduplicate. Returns `(faces, persons)`.
    fn prepare(&self, msg: &FrameMessage, detections: Vec<Detection>) -> (Vec<Detection>, Vec<Detection>) {
        let (width, height) = (msg.frame.width, msg.frame.height);
        let mut kept = Vec::with_capacity(detections.len());

        for mut det in detections {
            det.camera_code = self.camera.code.clone();
            det.timestamp = msg.timestamp;
            det.frame_seq = msg.sequence;
            det.bbox = det.bbox.clip(width, height);

            if !det.bbox.is_valid() {
                debug!(camera = %self.camera.code, bbox = ?det.bbox, "Dropping degenerate box");
                continue;
            }
            if let Some(roi) = &self.camera.roi {
                let (cx, cy) = det.bbox.center();
                if !roi.contains(cx, cy) {
                    continue;
                }
            }
            kept.push(det);
        }

        let (faces, persons): (Vec<Detection>, Vec<Detection>) = kept.into_iter().partition(|d| d.is_face());
        (
            deduplicate(faces, self.settings.dedup_threshold),
            deduplicate(persons, self.settings.dedup_threshold),
        )
    }

    async fn recognize(&mut self, frame: &Frame, track_id: u64, bbox: BBox) {
        let Some(embedder) = self.services.embedder.clone() else {
            return;
        };
        if self.lifecycle.record(track_id).map_or(true, |r| r.recognized) {
            return;
        }
        self.lifecycle.recognition_pending(track_id).await;

        let Some((crop, region)) = person_roi(frame, &bbox, self.settings.person_roi_padding) else {
            debug!(camera = %self.camera.code, track_id, "Empty person crop, skipping recognition");
            return;
        };

        let faces = match embedder.embed(&crop).await {
            Ok(faces) => faces,
            Err(e) => {
                warn!(camera = %self.camera.code, track_id, "Embedding failed: {}", e);
                return;
            }
        };

        // Faces come back in crop coordinates.
        let inside: Vec<FaceEmbedding> = faces
            .into_iter()
            .map(|mut f| {
                f.bbox = f.bbox.translate(region.x1, region.y1);
                f
            })
            .filter(|f| {
                let (cx, cy) = f.bbox.center();
                bbox.contains_point(cx, cy)
            })
            .collect();
        let Some(face) = FaceEmbedding::best(&inside) else {
            debug!(camera = %self.camera.code, track_id, "No usable face in person crop");
            return;
        };

        match self.services.matcher.find_match(&face.embedding, self.settings.match_threshold) {
            Some(identity) => {
                self.lifecycle.recognition_confirmed(track_id, identity).await;
            }
            None => debug!(camera = %self.camera.code, track_id, "No identity above threshold"),
        }
    }
}

#[async_trait]
impl FrameHandler for CameraPipeline {
    async fn handle_frame(&mut self, msg: FrameMessage) {
        self.process_frame(&msg).await;
    }
}
