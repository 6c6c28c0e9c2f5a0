//! Hand-off of decoded frames from the hardware path to the state machine.
//!
//! Pushes never block. When the queue is full the newest frame is dropped and
//! counted; the frame counter gap is then also visible downstream as missing
//! frames.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::image::Image;

/// Bounded lock-free queue of frames awaiting the state machine.
#[derive(Debug)]
pub struct PendingFrameQueue {
    queue: ArrayQueue<Image>,
    lost: AtomicU64,
}

impl PendingFrameQueue {
    /// Queue holding at most `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            lost: AtomicU64::new(0),
        }
    }

    /// Queue a frame. Returns `false` if it was dropped.
    pub fn push(&self, image: Image) -> bool {
        match self.queue.push(image) {
            Ok(()) => true,
            Err(dropped) => {
                let lost = self.lost.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    frame = dropped.frame_number,
                    capacity = self.queue.capacity(),
                    lost,
                    "pending frame queue full, frame dropped"
                );
                false
            }
        }
    }

    /// Oldest queued frame.
    pub fn pop(&self) -> Option<Image> {
        self.queue.pop()
    }

    /// Drop every queued frame, returning how many were discarded.
    pub fn discard(&self) -> usize {
        let mut discarded = 0;
        while self.queue.pop().is_some() {
            discarded += 1;
        }
        discarded
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no frame is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of queued frames.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Frames dropped on a full queue since creation.
    pub fn lost_frames(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::DataType;
    use tracing_test::traced_test;

    fn frame(n: u32) -> Image {
        let mut image = Image::new(1, 1, DataType::U16, None);
        image.frame_number = n;
        image
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let queue = PendingFrameQueue::new(2);
        assert!(queue.push(frame(1)));
        assert!(queue.push(frame(2)));
        assert!(!queue.push(frame(3)));
        assert_eq!(queue.lost_frames(), 1);
        assert_eq!(queue.pop().map(|i| i.frame_number), Some(1));
        assert_eq!(queue.pop().map(|i| i.frame_number), Some(2));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn discard_empties_queue() {
        let queue = PendingFrameQueue::new(4);
        queue.push(frame(1));
        queue.push(frame(2));
        assert_eq!(queue.discard(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.lost_frames(), 0);
    }

    #[test]
    #[traced_test]
    fn overflow_is_logged() {
        let queue = PendingFrameQueue::new(1);
        queue.push(frame(1));
        queue.push(frame(2));
        assert!(logs_contain("pending frame queue full, frame dropped"));
    }
}
