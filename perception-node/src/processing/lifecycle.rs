//! Per-track flags and exactly-once lifecycle events for one camera.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::messaging::EventPublisher;
use crate::utils::metrics::Metrics;
use gatewatch_common::{BBox, Event, EventKind, IdentityMatch};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub face_seen: bool,
    pub recognition_started: bool,
    pub recognized: bool,
    pub first_seen: f64,
    pub last_seen: f64,
    pub bbox: BBox,
    pub identity: Option<IdentityMatch>,
}

impl TrackRecord {
    fn new(bbox: BBox, timestamp: f64) -> Self {
        Self {
            face_seen: false,
            recognition_started: false,
            recognized: false,
            first_seen: timestamp,
            last_seen: timestamp,
            bbox,
            identity: None,
        }
    }
}

/// Owns the records of one camera's tracks. Every operation returns whether it
/// emitted an event; guarded events fire at most once per track lifetime.
/// Operations on an unknown track id do nothing.
pub struct TrackLifecycle {
    camera: String,
    records: HashMap<u64, TrackRecord>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<Metrics>,
}

impl TrackLifecycle {
    pub fn new(camera: impl Into<String>, publisher: Arc<dyn EventPublisher>, metrics: Arc<Metrics>) -> Self {
        Self {
            camera: camera.into(),
            records: HashMap::new(),
            publisher,
            metrics,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn record(&self, track_id: u64) -> Option<&TrackRecord> {
        self.records.get(&track_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Create the record on first sight, otherwise refresh it.
    pub async fn observe(&mut self, track_id: u64, bbox: BBox, timestamp: f64) -> bool {
        let kind = match self.records.get_mut(&track_id) {
            Some(record) => {
                record.last_seen = timestamp;
                record.bbox = bbox;
                EventKind::TrackUpdated
            }
            None => {
                self.records.insert(track_id, TrackRecord::new(bbox, timestamp));
                self.metrics.inc_tracks_created(&self.camera);
                info!(camera = %self.camera, track_id, "Track created");
                EventKind::TrackCreated
            }
        };
        self.emit(Event::new(kind, timestamp, &self.camera, track_id).with_bbox(bbox))
            .await;
        true
    }

    pub async fn face_detected(&mut self, track_id: u64) -> bool {
        let Some(record) = self.records.get_mut(&track_id) else {
            return self.missing(track_id, EventKind::FaceDetected);
        };
        if record.face_seen {
            return false;
        }
        record.face_seen = true;
        let event = Event::new(EventKind::FaceDetected, record.last_seen, &self.camera, track_id).with_bbox(record.bbox);
        self.emit(event).await;
        true
    }

    pub async fn recognition_pending(&mut self, track_id: u64) -> bool {
        let Some(record) = self.records.get_mut(&track_id) else {
            return self.missing(track_id, EventKind::RecognitionPending);
        };
        if record.recognition_started {
            return false;
        }
        record.recognition_started = true;
        let event = Event::new(EventKind::RecognitionPending, record.last_seen, &self.camera, track_id);
        self.emit(event).await;
        true
    }

    pub async fn recognition_confirmed(&mut self, track_id: u64, identity: IdentityMatch) -> bool {
        let Some(record) = self.records.get_mut(&track_id) else {
            return self.missing(track_id, EventKind::RecognitionConfirmed);
        };
        if record.recognized {
            return false;
        }
        record.recognized = true;
        record.identity = Some(identity.clone());
        info!(
            camera = %self.camera,
            track_id,
            employee_id = %identity.employee_id,
            similarity = identity.similarity,
            "Identity confirmed"
        );
        let event = Event::new(EventKind::RecognitionConfirmed, record.last_seen, &self.camera, track_id)
            .with_bbox(record.bbox)
            .with_identity(identity);
        self.emit(event).await;
        true
    }

    /// Drop the record. Guards reset with it, so a later record under the same
    /// id would start fresh; the tracker never reuses ids.
    pub async fn track_lost(&mut self, track_id: u64) -> bool {
        let Some(record) = self.records.remove(&track_id) else {
            return self.missing(track_id, EventKind::TrackLost);
        };
        self.metrics.inc_tracks_lost(&self.camera);
        info!(
            camera = %self.camera,
            track_id,
            duration_secs = record.last_seen - record.first_seen,
            recognized = record.recognized,
            "Track lost"
        );
        let mut event = Event::new(EventKind::TrackLost, record.last_seen, &self.camera, track_id).with_bbox(record.bbox);
        if let Some(identity) = record.identity {
            event = event.with_identity(identity);
        }
        self.emit(event).await;
        true
    }

    fn missing(&self, track_id: u64, kind: EventKind) -> bool {
        debug!(camera = %self.camera, track_id, event = %kind, "No record for track, ignoring");
        false
    }

    async fn emit(&self, event: Event) {
        match self.publisher.publish(&event).await {
            Ok(()) => self.metrics.inc_events_published(&self.camera, event.event.as_str()),
            Err(e) => {
                warn!(camera = %self.camera, track_id = event.data.track_id, event = %event.event, "Failed to publish event: {}", e);
                self.metrics.inc_publish_failures(&self.camera);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PerceptionError, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        fail: bool,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|e| e.event).collect()
        }
    }

    #[async_trait]
    impl EventPublisher for Recorder {
        async fn publish(&self, event: &Event) -> Result<()> {
            if self.fail {
                return Err(PerceptionError::MessagingError("broker down".to_string()));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn lifecycle(recorder: Arc<Recorder>) -> (TrackLifecycle, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        (TrackLifecycle::new("cam1", recorder, metrics.clone()), metrics)
    }

    fn identity() -> IdentityMatch {
        IdentityMatch {
            employee_id: "E-17".to_string(),
            name: "Dana".to_string(),
            similarity: 0.82,
        }
    }

    #[tokio::test]
    async fn test_face_detected_fires_once() {
        let recorder = Arc::new(Recorder::default());
        let (mut lifecycle, _) = lifecycle(recorder.clone());
        let bbox = BBox::new(10.0, 10.0, 50.0, 90.0);

        assert!(lifecycle.observe(7, bbox, 1.0).await);
        assert!(lifecycle.face_detected(7).await);
        assert!(!lifecycle.face_detected(7).await);
        assert!(!lifecycle.face_detected(7).await);

        assert_eq!(recorder.kinds(), vec![EventKind::TrackCreated, EventKind::FaceDetected]);
        assert!(lifecycle.record(7).unwrap().face_seen);
    }

    #[tokio::test]
    async fn test_full_lifetime_event_order() {
        let recorder = Arc::new(Recorder::default());
        let (mut lifecycle, metrics) = lifecycle(recorder.clone());
        let bbox = BBox::new(10.0, 10.0, 50.0, 90.0);

        lifecycle.observe(3, bbox, 1.0).await;
        lifecycle.observe(3, bbox, 1.1).await;
        lifecycle.face_detected(3).await;
        assert!(lifecycle.recognition_pending(3).await);
        assert!(!lifecycle.recognition_pending(3).await);
        assert!(lifecycle.recognition_confirmed(3, identity()).await);
        assert!(!lifecycle.recognition_confirmed(3, identity()).await);
        assert!(lifecycle.track_lost(3).await);
        assert!(!lifecycle.track_lost(3).await);

        assert_eq!(
            recorder.kinds(),
            vec![
                EventKind::TrackCreated,
                EventKind::TrackUpdated,
                EventKind::FaceDetected,
                EventKind::RecognitionPending,
                EventKind::RecognitionConfirmed,
                EventKind::TrackLost,
            ]
        );
        let events = recorder.events.lock().unwrap();
        assert_eq!(events[4].data.identity.as_ref().unwrap().employee_id, "E-17");
        assert_eq!(events[5].timestamp, 1.1);
        assert!(lifecycle.is_empty());
        assert_eq!(metrics.events_published("cam1", "track_lost"), 1);
    }

    #[tokio::test]
    async fn test_operations_on_unknown_track_are_noops() {
        let recorder = Arc::new(Recorder::default());
        let (mut lifecycle, _) = lifecycle(recorder.clone());

        assert!(!lifecycle.face_detected(99).await);
        assert!(!lifecycle.recognition_pending(99).await);
        assert!(!lifecycle.recognition_confirmed(99, identity()).await);
        assert!(!lifecycle.track_lost(99).await);
        assert!(recorder.kinds().is_empty());
        assert!(lifecycle.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_state() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let (mut lifecycle, metrics) = lifecycle(recorder);

        assert!(lifecycle.observe(1, BBox::new(0.0, 0.0, 10.0, 10.0), 0.5).await);
        assert!(lifecycle.face_detected(1).await);
        assert!(!lifecycle.face_detected(1).await);
        assert_eq!(lifecycle.len(), 1);
        assert_eq!(metrics.publish_failures("cam1"), 2);
    }
}
