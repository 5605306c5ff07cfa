//! Per-camera greedy IoU tracker.
//!
//! Association order is explicit: detections are matched in the order they are
//! given, each one claiming the still-unclaimed live track with the highest IoU
//! strictly above the threshold. Equal IoUs resolve to the older track.

use gatewatch_common::BBox;

use crate::config::TrackingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Seen fewer than `min_hits` times.
    Tentative,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: u64,
    pub bbox: BBox,
    pub created_at: f64,
    pub last_seen: f64,
    pub hits: u32,
    /// Update cycles survived.
    pub age: u32,
}

impl Track {
    fn new(id: u64, bbox: BBox, timestamp: f64) -> Self {
        Self {
            id,
            bbox,
            created_at: timestamp,
            last_seen: timestamp,
            hits: 1,
            age: 0,
        }
    }

    fn mark_matched(&mut self, bbox: BBox, timestamp: f64) {
        self.bbox = bbox;
        self.last_seen = timestamp;
        self.hits += 1;
    }

    pub fn state(&self, min_hits: u32) -> TrackState {
        if self.hits >= min_hits {
            TrackState::Confirmed
        } else {
            TrackState::Tentative
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    /// Seconds without a match before a track is dropped.
    pub max_age: f64,
    pub min_hits: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age: 2.0,
            min_hits: 3,
        }
    }
}

impl From<&TrackingConfig> for TrackerConfig {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
            max_age: config.max_age_secs,
            min_hits: config.min_hits,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerUpdate {
    /// Tracks matched or created this cycle, in detection order.
    pub active: Vec<(u64, BBox)>,
    /// Tracks removed this cycle.
    pub lost: Vec<u64>,
}

pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn update(&mut self, boxes: &[BBox], timestamp: f64) -> TrackerUpdate {
        let max_age = self.config.max_age;
        let live: Vec<bool> = self
            .tracks
            .iter()
            .map(|t| timestamp - t.last_seen < max_age)
            .collect();
        let mut claimed = vec![false; self.tracks.len()];

        let mut assigned: Vec<Option<usize>> = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let mut best: Option<(usize, f32)> = None;
            for (i, track) in self.tracks.iter().enumerate() {
                if claimed[i] || !live[i] {
                    continue;
                }
                let iou = track.bbox.iou(bbox);
                if iou > self.config.iou_threshold && best.map_or(true, |(_, b)| iou > b) {
                    best = Some((i, iou));
                }
            }
            if let Some((i, _)) = best {
                claimed[i] = true;
                self.tracks[i].mark_matched(*bbox, timestamp);
            }
            assigned.push(best.map(|(i, _)| i));
        }

        for track in self.tracks.iter_mut() {
            track.age += 1;
        }

        let mut active = Vec::with_capacity(boxes.len());
        for (bbox, slot) in boxes.iter().zip(assigned) {
            match slot {
                Some(i) => active.push((self.tracks[i].id, self.tracks[i].bbox)),
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track::new(id, *bbox, timestamp));
                    active.push((id, *bbox));
                }
            }
        }

        let mut lost = Vec::new();
        self.tracks.retain(|t| {
            let keep = timestamp - t.last_seen < max_age;
            if !keep {
                lost.push(t.id);
            }
            keep
        });

        TrackerUpdate { active, lost }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn state_of(&self, id: u64) -> Option<TrackState> {
        self.get(id).map(|t| t.state(self.config.min_hits))
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(update: &TrackerUpdate) -> Vec<u64> {
        update.active.iter().map(|(id, _)| *id).collect()
    }

    #[test]
    fn test_id_persists_while_box_drifts() {
        let mut tracker = IouTracker::default();
        let mut first_id = None;
        for i in 0..10 {
            let dx = i as f32 * 4.0;
            let bbox = BBox::new(100.0 + dx, 100.0, 160.0 + dx, 200.0);
            let update = tracker.update(&[bbox], i as f64 * 0.1);
            assert_eq!(update.active.len(), 1);
            assert!(update.lost.is_empty());
            let id = update.active[0].0;
            assert_eq!(*first_id.get_or_insert(id), id);
        }
        let track = tracker.get(1).unwrap();
        assert_eq!(track.hits, 10);
        assert_eq!(track.age, 10);
        assert_eq!(tracker.state_of(1), Some(TrackState::Confirmed));
    }

    #[test]
    fn test_expiry_reports_lost_once_and_never_reuses_ids() {
        let mut tracker = IouTracker::default();
        let bbox = BBox::new(100.0, 100.0, 160.0, 200.0);

        assert_eq!(ids(&tracker.update(&[bbox], 0.0)), vec![1]);
        assert_eq!(tracker.state_of(1), Some(TrackState::Tentative));

        let quiet = tracker.update(&[], 1.0);
        assert!(quiet.active.is_empty());
        assert!(quiet.lost.is_empty());

        let back = tracker.update(&[bbox], 2.5);
        assert_eq!(back.lost, vec![1]);
        assert_eq!(ids(&back), vec![2]);

        let again = tracker.update(&[], 2.6);
        assert!(again.lost.is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_expires_without_new_detections() {
        let mut tracker = IouTracker::default();
        tracker.update(&[BBox::new(0.0, 0.0, 50.0, 50.0)], 10.0);
        assert_eq!(tracker.update(&[], 12.0).lost, vec![1]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_low_overlap_spawns_new_track() {
        let mut tracker = IouTracker::default();
        tracker.update(&[BBox::new(0.0, 0.0, 100.0, 100.0)], 0.0);
        // IoU = 2500 / 17500 ~= 0.14
        let update = tracker.update(&[BBox::new(50.0, 50.0, 150.0, 150.0)], 0.1);
        assert_eq!(ids(&update), vec![2]);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_detection_order_decides_contested_track() {
        let mut tracker = IouTracker::default();
        tracker.update(&[BBox::new(0.0, 0.0, 100.0, 100.0)], 0.0);

        // Both overlap track 1; the first detection claims it even though the
        // second overlaps more.
        let weaker = BBox::new(20.0, 0.0, 120.0, 100.0);
        let stronger = BBox::new(5.0, 0.0, 105.0, 100.0);
        let update = tracker.update(&[weaker, stronger], 0.1);
        assert_eq!(update.active, vec![(1, weaker), (2, stronger)]);
    }

    #[test]
    fn test_detection_picks_highest_iou_track() {
        let mut tracker = IouTracker::default();
        tracker.update(&[BBox::new(0.0, 0.0, 100.0, 100.0), BBox::new(40.0, 0.0, 140.0, 100.0)], 0.0);

        let update = tracker.update(&[BBox::new(35.0, 0.0, 135.0, 100.0)], 0.1);
        assert_eq!(ids(&update), vec![2]);
    }

    #[test]
    fn test_equal_iou_prefers_older_track() {
        let mut tracker = IouTracker::default();
        let left = BBox::new(0.0, 0.0, 100.0, 100.0);
        let right = BBox::new(100.0, 0.0, 200.0, 100.0);
        tracker.update(&[left, right], 0.0);

        let middle = BBox::new(50.0, 0.0, 150.0, 100.0);
        assert_eq!(left.iou(&middle), right.iou(&middle));
        let update = tracker.update(&[middle], 0.1);
        assert_eq!(ids(&update), vec![1]);
    }
}
