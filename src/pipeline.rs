//! Frame reception pipeline.
//!
//! Runs on the state machine thread inside the image handling actions. Raw
//! frames arrive on the pending frame queue already copied out of the
//! hardware buffers. For each one the pipeline:
//!
//! 1. reads the camera frame counter (BCD stamp, or dead reckoning), counting
//!    gaps and adopting the camera's number either way;
//! 2. applies the software ROI, binning, reversal and type conversion;
//! 3. sums multi-exposure frames into an accumulator;
//! 4. stamps finished images and hands them to the gang boundary or the sink.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

use crate::bcd::BcdDecoder;
use crate::gang::{GangRole, Offer};
use crate::geometry::GeometryPlan;
use crate::image::{AttributeValue, Image, PixelData};
use crate::sdk::{ImageMode, TimestampMode, TriggerMode};
use crate::sink::ImageSink;
use crate::status::{PerfEvent, Settings, Shared};
use crate::timing::AchievedTiming;

/// Where finished images go.
pub struct Outputs {
    pub sink: Box<dyn ImageSink>,
    pub gang: GangRole,
}

impl Outputs {
    pub fn new(sink: impl ImageSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            gang: GangRole::None,
        }
    }

    pub fn with_gang(mut self, gang: GangRole) -> Self {
        self.gang = gang;
        self
    }
}

/// Per-arm acquisition state. Created on arm, reset when acquisition starts,
/// dropped on disarm.
#[derive(Debug)]
pub struct AcquisitionContext {
    pub trigger_mode: TriggerMode,
    pub timestamp_mode: TimestampMode,
    pub image_mode: ImageMode,
    pub geometry: GeometryPlan,
    pub timing: AchievedTiming,
    pub num_images: u32,
    pub num_exposures: u32,
    pub images_counter: u32,
    pub exposures_counter: u32,
    pub last_frame_number: u32,
    pub missing_frames: u64,
    /// Output sequence id of the next completed image.
    pub array_counter: u64,
    convert: bool,
    bcd: BcdDecoder,
    accumulator: Option<Image>,
    attributes: BTreeMap<String, AttributeValue>,
}

impl AcquisitionContext {
    pub fn new(
        settings: &Settings,
        geometry: GeometryPlan,
        timing: AchievedTiming,
        bcd: BcdDecoder,
    ) -> Self {
        Self {
            trigger_mode: settings.trigger_mode,
            timestamp_mode: settings.timestamp_mode,
            image_mode: settings.image_mode,
            convert: geometry.conversion_required(),
            geometry,
            timing,
            num_images: settings.num_images,
            num_exposures: settings.num_exposures.max(1),
            images_counter: 0,
            exposures_counter: 0,
            last_frame_number: 0,
            missing_frames: 0,
            array_counter: 0,
            bcd,
            accumulator: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Reset the counters for a new acquisition run.
    pub fn start(&mut self, settings: &Settings, array_counter: u64) {
        self.num_images = match self.image_mode {
            ImageMode::Single => 1,
            _ => settings.num_images,
        };
        self.num_exposures = settings.num_exposures.max(1);
        self.images_counter = 0;
        self.exposures_counter = 0;
        self.missing_frames = 0;
        self.array_counter = array_counter;
        self.accumulator = None;
    }

    /// Metadata copied onto every finished image.
    pub fn set_attributes(&mut self, attributes: BTreeMap<String, AttributeValue>) {
        self.attributes = attributes;
    }

    pub fn is_complete(&self) -> bool {
        self.image_mode != ImageMode::Continuous && self.images_counter >= self.num_images
    }

    pub fn has_accumulator(&self) -> bool {
        self.accumulator.is_some()
    }

    fn wants_more(&self) -> bool {
        self.image_mode == ImageMode::Continuous || self.images_counter < self.num_images
    }

    /// Drain the pending frame queue. Returns `true` when the acquisition is
    /// complete.
    pub fn receive_images(&mut self, shared: &Shared, outputs: &mut Outputs) -> bool {
        while self.wants_more() {
            let Some(raw) = shared.frames.pop() else {
                break;
            };
            self.receive_one(raw, shared, outputs);
        }
        self.publish(shared);
        self.is_complete()
    }

    fn receive_one(&mut self, raw: Image, shared: &Shared, outputs: &mut Outputs) {
        let expected = self.last_frame_number.wrapping_add(1);
        let (number, stamp) = match (&raw.data, self.timestamp_mode.has_binary()) {
            (PixelData::U16(pixels), true) => (
                self.bcd.frame_number(pixels).unwrap_or(expected),
                self.bcd.timestamp(pixels),
            ),
            _ => (expected, None),
        };
        if number != expected {
            self.missing_frames += 1;
            shared.count(PerfEvent::MissingFrame);
            warn!(got = number, expected, missing = self.missing_frames, "missing frame");
        }
        self.last_frame_number = number;

        let mut frame = if self.convert {
            let Some(lease) = shared.pool.lease() else {
                shared.count(PerfEvent::OutOfArrays);
                warn!(frame = number, "image pool exhausted, converted frame dropped");
                return;
            };
            raw.convert(&self.geometry.conversion, Some(lease))
        } else {
            raw
        };
        frame.frame_number = number;

        self.exposures_counter += 1;
        let finished = match self.accumulator.take() {
            Some(mut sum) => {
                if !sum.accumulate(&frame) {
                    warn!(frame = number, "frame shape changed mid-exposure, restarting sum");
                    sum = frame;
                    self.exposures_counter = 1;
                }
                sum.frame_number = number;
                sum
            }
            None => frame,
        };
        if self.exposures_counter < self.num_exposures {
            self.accumulator = Some(finished);
            return;
        }
        self.exposures_counter = 0;
        self.finish(finished, stamp, shared, outputs);
    }

    fn finish(
        &mut self,
        mut image: Image,
        stamp: Option<DateTime<Utc>>,
        shared: &Shared,
        outputs: &mut Outputs,
    ) {
        image.timestamp = Some(stamp.unwrap_or_else(Utc::now));
        image.attributes = self.attributes.clone();
        image.set_attribute("FrameNumber", AttributeValue::Int(i64::from(image.frame_number)));

        let index = self.images_counter;
        outputs.gang.forward(&image, index);
        match outputs.gang.offer(index, image) {
            Offer::Consumed => trace!(index, "image taken by gang coordinator"),
            Offer::Declined(image) => self.complete(image, shared, outputs.sink.as_mut()),
        }
    }

    /// Number and deliver a finished image.
    fn complete(&mut self, mut image: Image, shared: &Shared, sink: &mut dyn ImageSink) {
        image.unique_id = self.array_counter;
        self.array_counter += 1;
        self.images_counter += 1;
        shared.count(PerfEvent::GoodFrame);
        debug!(
            id = image.unique_id,
            frame = image.frame_number,
            images = self.images_counter,
            "image complete"
        );
        sink.deliver(image);
    }

    /// Collect images the gang coordinator has finished. Returns `true` when
    /// the acquisition is complete; always `false` without a coordinator.
    pub fn make_images(&mut self, shared: &Shared, outputs: &mut Outputs) -> bool {
        if !outputs.gang.is_coordinator() {
            return false;
        }
        let Outputs { sink, gang } = outputs;
        gang.make_complete_images(&mut |image: Image| self.complete(image, shared, sink.as_mut()));
        self.publish(shared);
        self.is_complete()
    }

    fn publish(&self, shared: &Shared) {
        shared.update_status(|s| {
            s.counters.exposures_counter = self.exposures_counter;
            s.counters.images_counter = self.images_counter;
            s.counters.last_frame_number = self.last_frame_number;
            s.counters.missing_frames = self.missing_frames;
            s.counters.array_counter = self.array_counter;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gang::GangCoordinator;
    use crate::geometry::{self, RequestedGeometry};
    use crate::image::DataType;
    use crate::mock::MockCamera;
    use crate::sdk::CameraSdk;
    use std::sync::{Arc, Mutex};

    type Delivered = Arc<Mutex<Vec<Image>>>;

    fn collector() -> (Outputs, Delivered) {
        let delivered: Delivered = Arc::default();
        let sink = Arc::clone(&delivered);
        (
            Outputs::new(move |image: Image| sink.lock().unwrap().push(image)),
            delivered,
        )
    }

    fn context(settings: &Settings, width: u32, height: u32) -> AcquisitionContext {
        let desc = MockCamera::small(width, height).describe().unwrap();
        let plan = geometry::plan(&desc, &settings.geometry);
        let mut ctx =
            AcquisitionContext::new(settings, plan, AchievedTiming::default(), BcdDecoder::default());
        ctx.start(settings, 0);
        ctx
    }

    fn stamped(number: u32, value: u16) -> Image {
        let mut pixels = vec![value; 16 * 2];
        BcdDecoder::default().stamp(&mut pixels, number, Utc::now());
        Image::from_u16(16, 2, &pixels, None)
    }

    #[test]
    fn frame_gaps_are_counted_and_adopted() {
        let settings = Settings {
            num_images: 10,
            ..Settings::default()
        };
        let shared = Shared::new(1, 8, 0);
        let mut ctx = context(&settings, 16, 2);
        let (mut outputs, delivered) = collector();
        for n in [1, 2, 4, 5] {
            shared.frames.push(stamped(n, 0));
        }

        assert!(!ctx.receive_images(&shared, &mut outputs));
        assert_eq!(ctx.missing_frames, 1);
        assert_eq!(ctx.last_frame_number, 5);
        let ids: Vec<_> = delivered.lock().unwrap().iter().map(|i| i.unique_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(shared.status().counters.missing_frames, 1);
        let performance = shared.status().performance;
        assert_eq!(performance.good_frames, 4);
        assert_eq!(performance.missing_frames, 1);
        assert_eq!(performance.faults, 1);
    }

    #[test]
    fn dead_reckoning_without_binary_stamp() {
        let settings = Settings {
            num_images: 2,
            timestamp_mode: TimestampMode::None,
            ..Settings::default()
        };
        let shared = Shared::new(1, 8, 0);
        let mut ctx = context(&settings, 16, 2);
        let (mut outputs, delivered) = collector();
        shared.frames.push(stamped(40, 0));
        shared.frames.push(stamped(90, 0));

        assert!(ctx.receive_images(&shared, &mut outputs));
        assert_eq!(ctx.missing_frames, 0);
        assert_eq!(ctx.last_frame_number, 2);
        assert_eq!(delivered.lock().unwrap().len(), 2);
    }

    #[test]
    fn exposures_are_summed_into_one_image() {
        let settings = Settings {
            num_images: 1,
            num_exposures: 3,
            timestamp_mode: TimestampMode::None,
            ..Settings::default()
        };
        let shared = Shared::new(1, 8, 0);
        let mut ctx = context(&settings, 3, 1);
        let (mut outputs, delivered) = collector();
        for _ in 0..3 {
            shared.frames.push(Image::from_u16(3, 1, &[10, 10, 10], None));
        }

        assert!(ctx.receive_images(&shared, &mut outputs));
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data, PixelData::U16(vec![30, 30, 30]));
        assert!(!ctx.has_accumulator());
        assert_eq!(ctx.exposures_counter, 0);
    }

    #[test]
    fn stops_at_target_and_leaves_the_rest_queued() {
        let settings = Settings {
            num_images: 2,
            timestamp_mode: TimestampMode::None,
            ..Settings::default()
        };
        let shared = Shared::new(1, 8, 0);
        let mut ctx = context(&settings, 16, 2);
        let (mut outputs, _) = collector();
        for n in 1..=3 {
            shared.frames.push(stamped(n, 0));
        }
        assert!(ctx.receive_images(&shared, &mut outputs));
        assert_eq!(shared.frames.len(), 1);
    }

    #[test]
    fn continuous_mode_never_completes() {
        let settings = Settings {
            num_images: 1,
            image_mode: ImageMode::Continuous,
            timestamp_mode: TimestampMode::None,
            ..Settings::default()
        };
        let shared = Shared::new(1, 8, 0);
        let mut ctx = context(&settings, 16, 2);
        let (mut outputs, delivered) = collector();
        for n in 1..=3 {
            shared.frames.push(stamped(n, 0));
        }
        assert!(!ctx.receive_images(&shared, &mut outputs));
        assert_eq!(delivered.lock().unwrap().len(), 3);
    }

    #[test]
    fn software_roi_is_applied() {
        let settings = Settings {
            num_images: 1,
            timestamp_mode: TimestampMode::None,
            geometry: RequestedGeometry {
                min_x: 1,
                size_x: 2,
                data_type: DataType::U32,
                ..RequestedGeometry::default()
            },
            ..Settings::default()
        };
        let shared = Shared::new(1, 8, 4);
        let mut ctx = context(&settings, 4, 1);
        let (mut outputs, delivered) = collector();
        shared.frames.push(Image::from_u16(2, 1, &[5, 6], None));

        assert!(ctx.receive_images(&shared, &mut outputs));
        let delivered = delivered.lock().unwrap();
        // hardware ROI already starts at x = 1, software crops nothing
        assert_eq!(delivered[0].data, PixelData::U32(vec![5, 6]));
        assert!(delivered[0].is_pooled());
    }

    #[test]
    fn exhausted_pool_drops_converted_frames() {
        let settings = Settings {
            num_images: 1,
            timestamp_mode: TimestampMode::None,
            geometry: RequestedGeometry {
                reverse_x: true,
                ..RequestedGeometry::default()
            },
            ..Settings::default()
        };
        let shared = Shared::new(1, 8, 1);
        let _held = shared.pool.lease();
        let mut ctx = context(&settings, 2, 1);
        let (mut outputs, delivered) = collector();
        shared.frames.push(Image::from_u16(2, 1, &[1, 2], None));

        assert!(!ctx.receive_images(&shared, &mut outputs));
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(shared.status().counters.out_of_arrays, 1);
    }

    struct HoldAll(Vec<Image>);

    impl GangCoordinator for HoldAll {
        fn offer(&mut self, _index: u32, image: Image) -> Offer {
            self.0.push(image);
            Offer::Consumed
        }

        fn make_complete_images(&mut self, deliver: &mut dyn FnMut(Image)) {
            self.0.drain(..).for_each(deliver);
        }
    }

    #[test]
    fn coordinator_images_complete_through_make_images() {
        let settings = Settings {
            num_images: 2,
            timestamp_mode: TimestampMode::None,
            ..Settings::default()
        };
        let shared = Shared::new(1, 8, 0);
        let mut ctx = context(&settings, 16, 2);
        let (outputs, delivered) = collector();
        let mut outputs = outputs.with_gang(GangRole::Coordinator(Box::new(HoldAll(Vec::new()))));
        shared.frames.push(stamped(1, 0));
        shared.frames.push(stamped(2, 0));

        assert!(!ctx.receive_images(&shared, &mut outputs));
        assert!(delivered.lock().unwrap().is_empty());
        assert!(ctx.make_images(&shared, &mut outputs));
        assert_eq!(delivered.lock().unwrap().len(), 2);
    }
}
