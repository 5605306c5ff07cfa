//! Client for an out-of-process inference service.
//!
//! Frames are JPEG-encoded and POSTed as `image/jpeg`:
//! * `POST {endpoint}/detect` answers `{ "detections": [{ "kind", "bbox": [x1,y1,x2,y2], "score", "landmarks"? }] }`
//! * `POST {endpoint}/embed` answers `{ "faces": [{ "bbox", "score", "landmarks"?, "embedding": [f32] }] }`

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::{Detector, FaceEmbedder, FaceEmbedding};
use crate::camera::Frame;
use crate::config::InferenceConfig;
use crate::error::{PerceptionError, Result};
use gatewatch_common::{BBox, Detection, DetectionKind, Gender, Pose};

pub struct HttpInferenceClient {
    client: reqwest::Client,
    endpoint: String,
    jpeg_quality: u8,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RemoteDetection>,
}

#[derive(Debug, Deserialize)]
struct RemoteDetection {
    #[serde(default)]
    kind: DetectionKind,
    bbox: [f32; 4],
    #[serde(default)]
    score: f32,
    #[serde(default)]
    landmarks: Option<Vec<[f32; 2]>>,
    #[serde(default)]
    pose: Option<Pose>,
    #[serde(default)]
    age: Option<u32>,
    #[serde(default)]
    gender: Option<Gender>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    faces: Vec<FaceEmbedding>,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
        })
    }

    async fn post_jpeg<T: serde::de::DeserializeOwned>(&self, route: &str, frame: &Frame) -> Result<T> {
        let body = encode_jpeg(frame, self.jpeg_quality)?;
        let response = self
            .client
            .post(format!("{}/{}", self.endpoint, route))
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await
            .map_err(inference_error)?
            .error_for_status()
            .map_err(inference_error)?;
        response.json().await.map_err(inference_error)
    }
}

fn inference_error(e: reqwest::Error) -> PerceptionError {
    if e.is_timeout() {
        PerceptionError::Timeout(e.to_string())
    } else {
        PerceptionError::InferenceError(e.to_string())
    }
}

/// BGR24 frame to JPEG bytes.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let expected = Frame::byte_len(frame.width, frame.height);
    if frame.data.len() != expected || expected == 0 {
        return Err(PerceptionError::InferenceError(format!(
            "frame buffer is {} bytes, expected {} for {}x{}",
            frame.data.len(),
            expected,
            frame.width,
            frame.height
        )));
    }

    let mut rgb = frame.data.clone();
    for px in rgb.chunks_exact_mut(Frame::CHANNELS) {
        px.swap(0, 2);
    }

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(&rgb, frame.width, frame.height, ColorType::Rgb8)?;
    Ok(out)
}

#[async_trait]
impl Detector for HttpInferenceClient {
    #[instrument(skip(self, frame), fields(width = frame.width, height = frame.height), level = "debug")]
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let started = Instant::now();
        let response: DetectResponse = self.post_jpeg("detect", frame).await?;
        debug!(count = response.detections.len(), elapsed_ms = started.elapsed().as_millis() as u64, "Detections received");

        Ok(response
            .detections
            .into_iter()
            .map(|d| {
                let mut det = Detection::new(String::new(), 0.0, d.kind, BBox::from(d.bbox), d.score);
                det.landmarks = d.landmarks;
                det.pose = d.pose;
                det.age = d.age;
                det.gender = d.gender;
                det
            })
            .collect())
    }
}

#[async_trait]
impl FaceEmbedder for HttpInferenceClient {
    #[instrument(skip(self, frame), fields(width = frame.width, height = frame.height), level = "debug")]
    async fn embed(&self, frame: &Frame) -> Result<Vec<FaceEmbedding>> {
        let response: EmbedResponse = self.post_jpeg("embed", frame).await?;
        Ok(response.faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(endpoint: String) -> HttpInferenceClient {
        HttpInferenceClient::new(&InferenceConfig {
            endpoint,
            timeout_ms: 2000,
            jpeg_quality: 80,
        })
        .unwrap()
    }

    #[test]
    fn test_encode_jpeg_rejects_short_buffer() {
        let frame = Frame::new(vec![0; 10], 4, 4);
        assert!(encode_jpeg(&frame, 85).is_err());

        let jpeg = encode_jpeg(&Frame::blank(8, 8), 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_detect_parses_people_and_faces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .and(header("content-type", "image/jpeg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "detections": [
                    { "kind": "person", "bbox": [10.0, 20.0, 60.0, 200.0], "score": 0.91 },
                    { "kind": "face", "bbox": [20.0, 25.0, 40.0, 50.0], "score": 0.88,
                      "landmarks": [[25.0, 30.0], [35.0, 30.0], [30.0, 38.0], [26.0, 44.0], [34.0, 44.0]] }
                ]
            })))
            .mount(&server)
            .await;

        let detections = client(server.uri()).detect(&Frame::blank(64, 64)).await.unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].kind, DetectionKind::Person);
        assert_eq!(detections[0].bbox, BBox::new(10.0, 20.0, 60.0, 200.0));
        assert!(detections[1].is_face());
        assert_eq!(detections[1].landmarks.as_ref().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_embed_and_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "faces": [{ "bbox": { "x1": 1.0, "y1": 2.0, "x2": 11.0, "y2": 14.0 }, "score": 0.7, "embedding": [0.1, 0.2] }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client(format!("{}/", server.uri()));
        let faces = client.embed(&Frame::blank(16, 16)).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].embedding, vec![0.1, 0.2]);

        let err = client.detect(&Frame::blank(16, 16)).await.unwrap_err();
        assert!(matches!(err, PerceptionError::InferenceError(_)));
    }
}
