use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::utils::validate_url;

/// Axis-aligned bounding box in pixel coordinates (x1, y1) top-left, (x2, y2) bottom-right.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area, or zero for inverted boxes.
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.x2 > self.x1 && self.y2 > self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    /// Clamp the box to a `width` x `height` frame.
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Grow the box by `pad` pixels on every side, then clip to the frame.
    pub fn expand(&self, pad: f32, width: u32, height: u32) -> Self {
        Self::new(self.x1 - pad, self.y1 - pad, self.x2 + pad, self.y2 + pad).clip(width, height)
    }

    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    /// Intersection over union. Degenerate boxes yield 0.
    pub fn iou(&self, other: &BBox) -> f32 {
        let area_a = self.area();
        let area_b = other.area();
        if area_a <= 0.0 || area_b <= 0.0 {
            return 0.0;
        }

        let inter_w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let inter_h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = inter_w * inter_h;

        let union = area_a + area_b - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

/// Head pose in degrees.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Pose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    #[default]
    Person,
    Face,
}

/// A single detector hit. Read-only once produced.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Detection {
    pub camera_code: String,
    pub timestamp: f64,
    /// Sequence number of the frame this detection came from.
    pub frame_seq: u64,
    #[serde(default)]
    pub kind: DetectionKind,
    pub bbox: BBox,
    pub score: f32,
    #[serde(default)]
    pub landmarks: Option<Vec<[f32; 2]>>,
    #[serde(default)]
    pub pose: Option<Pose>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<Gender>,
}

impl Detection {
    pub fn new(camera_code: impl Into<String>, timestamp: f64, kind: DetectionKind, bbox: BBox, score: f32) -> Self {
        Self {
            camera_code: camera_code.into(),
            timestamp,
            frame_seq: 0,
            kind,
            bbox,
            score,
            landmarks: None,
            pose: None,
            age: None,
            gender: None,
        }
    }

    pub fn person(camera_code: impl Into<String>, timestamp: f64, bbox: BBox, score: f32) -> Self {
        Self::new(camera_code, timestamp, DetectionKind::Person, bbox, score)
    }

    pub fn face(camera_code: impl Into<String>, timestamp: f64, bbox: BBox, score: f32) -> Self {
        Self::new(camera_code, timestamp, DetectionKind::Face, bbox, score)
    }

    pub fn with_landmarks(mut self, landmarks: Vec<[f32; 2]>) -> Self {
        self.landmarks = Some(landmarks);
        self
    }

    pub fn with_frame_seq(mut self, frame_seq: u64) -> Self {
        self.frame_seq = frame_seq;
        self
    }

    /// Faces are either tagged as such or carry facial landmarks.
    pub fn is_face(&self) -> bool {
        self.kind == DetectionKind::Face || self.landmarks.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateType {
    Entry,
    Exit,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let (x0, y0) = (self.x as f32, self.y as f32);
        x >= x0 && y >= y0 && x <= x0 + self.width as f32 && y <= y0 + self.height as f32
    }
}

/// Per-camera settings, immutable once loaded.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Validate)]
pub struct CameraConfig {
    #[validate(length(min = 1))]
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gate_type: GateType,
    #[validate(custom = "validate_stream_url")]
    pub stream_url: String,
    #[serde(default = "default_target_fps")]
    #[validate(range(min = 1, max = 120))]
    pub target_fps: u32,
    #[serde(default)]
    pub roi: Option<RegionOfInterest>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_target_fps() -> u32 {
    10
}

fn default_enabled() -> bool {
    true
}

fn validate_stream_url(url: &str) -> Result<(), ValidationError> {
    validate_url(url).map_err(|_| ValidationError::new("stream_url"))
}

impl CameraConfig {
    pub fn new(code: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: String::new(),
            gate_type: GateType::Unknown,
            stream_url: stream_url.into(),
            target_fps: default_target_fps(),
            roi: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TrackCreated,
    TrackUpdated,
    FaceDetected,
    RecognitionPending,
    RecognitionConfirmed,
    TrackLost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TrackCreated => "track_created",
            EventKind::TrackUpdated => "track_updated",
            EventKind::FaceDetected => "face_detected",
            EventKind::RecognitionPending => "recognition_pending",
            EventKind::RecognitionConfirmed => "recognition_confirmed",
            EventKind::TrackLost => "track_lost",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best registry entry for a face embedding.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IdentityMatch {
    pub employee_id: String,
    pub name: String,
    pub similarity: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventPayload {
    pub camera: String,
    pub track_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityMatch>,
}

/// Lifecycle event as it goes out on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub event: EventKind,
    /// Unix seconds.
    pub timestamp: f64,
    pub data: EventPayload,
}

impl Event {
    pub fn new(event: EventKind, timestamp: f64, camera: impl Into<String>, track_id: u64) -> Self {
        Self {
            event,
            timestamp,
            data: EventPayload {
                camera: camera.into(),
                track_id,
                bbox: None,
                identity: None,
            },
        }
    }

    pub fn with_bbox(mut self, bbox: BBox) -> Self {
        self.data.bbox = Some(bbox.to_array());
        self
    }

    pub fn with_identity(mut self, identity: IdentityMatch) -> Self {
        self.data.identity = Some(identity);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_partial_overlap() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        // 25 / (100 + 100 - 25)
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_and_disjoint() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(a.iou(&BBox::new(5.0, 5.0, 5.0, 20.0)), 0.0);
        assert_eq!(a.iou(&BBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_and_expand() {
        let b = BBox::new(-5.0, 10.0, 700.0, 500.0).clip(640, 480);
        assert_eq!(b, BBox::new(0.0, 10.0, 640.0, 480.0));

        let e = BBox::new(20.0, 20.0, 100.0, 100.0).expand(40.0, 120, 120);
        assert_eq!(e, BBox::new(0.0, 0.0, 120.0, 120.0));
    }

    #[test]
    fn test_camera_config_validation() {
        let ok = CameraConfig::new("cam1", "rtsp://10.0.0.5/stream1");
        assert!(ok.validate().is_ok());

        let mut bad = CameraConfig::new("", "ftp://nope");
        bad.target_fps = 0;
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("code"));
        assert!(fields.contains_key("stream_url"));
        assert!(fields.contains_key("target_fps"));
    }

    #[test]
    fn test_gate_type_falls_back_to_unknown() {
        let gate: GateType = serde_json::from_str("\"SIDE_DOOR\"").unwrap();
        assert_eq!(gate, GateType::Unknown);
        let gate: GateType = serde_json::from_str("\"ENTRY\"").unwrap();
        assert_eq!(gate, GateType::Entry);
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = Event::new(EventKind::TrackCreated, 12.5, "cam1", 7)
            .with_bbox(BBox::new(100.0, 100.0, 160.0, 200.0));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "track_created");
        assert_eq!(json["data"]["camera"], "cam1");
        assert_eq!(json["data"]["track_id"], 7);
        assert_eq!(json["data"]["bbox"][3], 200.0);
        assert!(json["data"].get("identity").is_none());
    }
}
