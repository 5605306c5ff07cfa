//! Bounded, drop-oldest frame buffer between capture and processing.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::camera::FrameMessage;

pub const DEFAULT_CAPACITY: usize = 250;

/// Always holds the most recent `capacity` messages. `push` never blocks:
/// when full, the oldest buffered message is evicted first.
pub struct FrameQueue {
    inner: ArrayQueue<FrameMessage>,
    available: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
            available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, msg: FrameMessage) {
        if self.inner.force_push(msg).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
    }

    /// Next message in FIFO order, or `None` once `timeout` has passed.
    pub async fn pop(&self, timeout: Duration) -> Option<FrameMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.inner.pop() {
                return Some(msg);
            }
            let notified = self.available.notified();
            // A push between the first check and here leaves a stored permit.
            if let Some(msg) = self.inner.pop() {
                return Some(msg);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Messages evicted to make room since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Frame;
    use std::sync::Arc;

    fn message(camera: &str, sequence: u64) -> FrameMessage {
        FrameMessage {
            camera_code: camera.to_string(),
            frame: Arc::new(Frame::blank(2, 2)),
            timestamp: sequence as f64,
            sequence,
        }
    }

    #[tokio::test]
    async fn test_overflow_keeps_most_recent_in_order() {
        let queue = FrameQueue::new(5);
        for seq in 1..=8 {
            queue.push(message("cam1", seq));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.dropped(), 3);

        let mut seen = Vec::new();
        while let Some(msg) = queue.pop(Duration::from_millis(1)).await {
            seen.push(msg.sequence);
        }
        assert_eq!(seen, vec![4, 5, 6, 7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out_when_empty() {
        let queue = FrameQueue::new(4);
        let started = Instant::now();
        assert!(queue.pop(Duration::from_millis(100)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_from_another_task() {
        let queue = Arc::new(FrameQueue::new(4));
        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(message("cam2", 42));
        });

        let msg = queue.pop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(msg.camera_code, "cam2");
        assert_eq!(msg.sequence, 42);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_mixes_cameras_fifo() {
        let queue = FrameQueue::default();
        assert_eq!(queue.capacity(), DEFAULT_CAPACITY);
        queue.push(message("cam1", 1));
        queue.push(message("cam2", 1));
        queue.push(message("cam1", 2));

        let mut order = Vec::new();
        while let Some(m) = queue.pop(Duration::from_millis(1)).await {
            order.push((m.camera_code, m.sequence));
        }
        assert_eq!(
            order,
            vec![("cam1".to_string(), 1), ("cam2".to_string(), 1), ("cam1".to_string(), 2)]
        );
    }
}
