//! Output side of the pipeline.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::image::Image;

/// Receives finished images in delivery order, on the state machine thread.
pub trait ImageSink: Send {
    fn deliver(&mut self, image: Image);
}

impl<F> ImageSink for F
where
    F: FnMut(Image) + Send,
{
    fn deliver(&mut self, image: Image) {
        self(image)
    }
}

/// Fans images out to any number of async subscribers.
///
/// Slow subscribers lag and lose the oldest images; the driver never waits.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<Image>>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Image>> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl ImageSink for BroadcastSink {
    fn deliver(&mut self, image: Image) {
        let id = image.unique_id;
        // Err only means nobody is listening
        if self.tx.send(Arc::new(image)).is_err() {
            trace!(id, "image delivered with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::DataType;

    #[test]
    fn closures_are_sinks() {
        let mut ids = Vec::new();
        {
            let mut sink = |image: Image| ids.push(image.unique_id);
            let mut image = Image::new(1, 1, DataType::U16, None);
            image.unique_id = 7;
            ImageSink::deliver(&mut sink, image);
        }
        assert_eq!(ids, vec![7]);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let mut sink = BroadcastSink::new(4);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        let mut image = Image::new(2, 2, DataType::U16, None);
        image.unique_id = 3;
        sink.deliver(image);
        assert_eq!(a.recv().await.unwrap().unique_id, 3);
        assert_eq!(b.recv().await.unwrap().unique_id, 3);
    }

    #[test]
    fn delivery_without_subscribers_is_fine() {
        let mut sink = BroadcastSink::new(1);
        sink.deliver(Image::new(1, 1, DataType::U16, None));
        assert_eq!(sink.receiver_count(), 0);
    }
}
