use gatewatch_common::Detection;

pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.8;

/// Collapse duplicate hits on the same object coming from several detector
/// passes or overlapping regions.
///
/// Detections are visited in the given order and a detection is kept only if
/// its IoU with every already-kept detection is `<= threshold`. The first of
/// two overlapping boxes always wins; callers that want the highest score to
/// win should sort by score first.
pub fn deduplicate(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) <= threshold) {
            kept.push(det);
        }
    }
    kept
}
