//! Shared driver state.
//!
//! [`Shared`] is the one object both sides of the driver see: the state machine
//! thread, the hardware notification path and the user-facing handle. It
//! holds:
//!
//! - user settings and observable status under a single coarse mutex, held
//!   only for field updates and never across SDK calls;
//! - a tokio `watch` channel republishing the status after every change;
//! - the pending frame queue, buffer arena and image pool of the hardware path;
//! - counters bumped from the hardware path without taking the status lock;
//! - lifetime performance counters that survive reconnects and new acquisitions
//!   until explicitly reset.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::info;

use crate::buffers::BufferArena;
use crate::frame_queue::PendingFrameQueue;
use crate::geometry::{GeometryPlan, RequestedGeometry};
use crate::pool::ArrayPool;
use crate::sdk::{
    BitAlignment, CameraType, ImageMode, StorageMode, Temperatures, TimestampMode, TriggerMode,
};
use crate::timing::{AchievedTiming, TimingRequest};

/// Acquisition settings written by the user and read at arm time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Requested binning, ROI and reversal.
    pub geometry: RequestedGeometry,
    /// Requested exposure, period and delay in seconds.
    pub timing: TimingRequest,
    pub trigger_mode: TriggerMode,
    pub timestamp_mode: TimestampMode,
    pub image_mode: ImageMode,
    /// Images per acquisition in `Multiple` mode.
    pub num_images: u32,
    /// Exposures summed into each image.
    pub num_exposures: u32,
    /// 0 keeps the camera's current rate.
    pub pixel_rate: u32,
    /// ADCs used for readout, limited to what the camera has.
    pub adc_count: u32,
    pub bit_alignment: BitAlignment,
    /// Sensor cooling target in degrees Celsius; `None` keeps the camera
    /// default. Ignored by cameras without cooling.
    pub cooling_setpoint: Option<i16>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            geometry: RequestedGeometry::default(),
            timing: TimingRequest {
                exposure: 0.01,
                period: 0.0,
                delay: 0.0,
            },
            trigger_mode: TriggerMode::Auto,
            timestamp_mode: TimestampMode::Binary,
            image_mode: ImageMode::Multiple,
            num_images: 1,
            num_exposures: 1,
            pixel_rate: 0,
            adc_count: 1,
            bit_alignment: BitAlignment::Lsb,
            cooling_setpoint: None,
        }
    }
}

/// Static facts about the connected camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub camera_type: CameraType,
    pub serial_number: u32,
    /// Sensor size in pixels.
    pub max_width: u32,
    pub max_height: u32,
    /// Significant bits per sample.
    pub dynamic_resolution: u32,
}

/// Data integrity and throughput counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameCounters {
    /// Gaps in the camera frame counter.
    pub missing_frames: u64,
    /// Frames dropped because the pending queue was full.
    pub lost_frames: u64,
    /// Frames dropped because the image pool was exhausted.
    pub out_of_arrays: u64,
    /// Ready notifications for slots that were not filled.
    pub misplaced_buffers: u64,
    /// SDK calls on the hardware path that failed.
    pub driver_library_errors: u64,
    /// Raw frames copied out of hardware buffers.
    pub frames_received: u64,
    /// Pooled images currently alive anywhere in the process.
    pub outstanding_arrays: u64,
    /// Output sequence counter; the id of the next delivered image.
    pub array_counter: u64,
    /// Images completed in the current acquisition.
    pub images_counter: u32,
    /// Exposures summed into the image being built.
    pub exposures_counter: u32,
    pub last_frame_number: u32,
}

/// Counters accumulated over the life of the driver. Only
/// [`Shared::reset_performance`] zeroes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub reboots: u64,
    pub connects: u64,
    pub arms: u64,
    /// Acquisitions started.
    pub starts: u64,
    /// Images delivered.
    pub good_frames: u64,
    pub missing_frames: u64,
    pub out_of_arrays: u64,
    pub driver_errors: u64,
    /// Every counted event that indicates a problem.
    pub faults: u64,
}

/// Something worth counting in the performance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfEvent {
    Reboot,
    Connect,
    Arm,
    Start,
    GoodFrame,
    MissingFrame,
    OutOfArrays,
    DriverError,
}

impl PerfEvent {
    fn is_fault(self) -> bool {
        matches!(
            self,
            PerfEvent::MissingFrame | PerfEvent::OutOfArrays | PerfEvent::DriverError
        )
    }
}

/// What the driver reports about itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Status {
    /// Current lifecycle state name.
    pub state: String,
    /// Last executed transition as `From --Event--> To`.
    pub last_transition: String,
    pub connected: bool,
    pub armed: bool,
    pub acquiring: bool,
    /// Last error or progress message; empty when all is well.
    pub message: String,
    pub camera: Option<CameraInfo>,
    pub counters: FrameCounters,
    pub performance: PerformanceCounters,
    /// Geometry applied at the last arm.
    pub geometry: Option<GeometryPlan>,
    pub timing: AchievedTiming,
    pub pixel_rate: u32,
    /// ADCs and bit alignment applied at the last arm.
    pub adc_count: u32,
    pub bit_alignment: BitAlignment,
    /// Cooling setpoint read back from the camera, when it has cooling.
    pub cooling_setpoint: Option<i16>,
    pub temperatures: Temperatures,
    pub storage_mode: Option<StorageMode>,
    pub ram_used_percent: f64,
}

#[derive(Debug, Default)]
struct Observed {
    settings: Settings,
    status: Status,
}

#[derive(Debug, Default)]
pub(crate) struct HardwareCounters {
    pub(crate) out_of_arrays: AtomicU64,
    pub(crate) misplaced_buffers: AtomicU64,
    pub(crate) driver_library_errors: AtomicU64,
    pub(crate) frames_received: AtomicU64,
}

#[derive(Debug, Default)]
struct Performance {
    reboots: AtomicU64,
    connects: AtomicU64,
    arms: AtomicU64,
    starts: AtomicU64,
    good_frames: AtomicU64,
    missing_frames: AtomicU64,
    out_of_arrays: AtomicU64,
    driver_errors: AtomicU64,
    faults: AtomicU64,
}

impl Performance {
    fn counter(&self, event: PerfEvent) -> &AtomicU64 {
        match event {
            PerfEvent::Reboot => &self.reboots,
            PerfEvent::Connect => &self.connects,
            PerfEvent::Arm => &self.arms,
            PerfEvent::Start => &self.starts,
            PerfEvent::GoodFrame => &self.good_frames,
            PerfEvent::MissingFrame => &self.missing_frames,
            PerfEvent::OutOfArrays => &self.out_of_arrays,
            PerfEvent::DriverError => &self.driver_errors,
        }
    }

    fn snapshot(&self) -> PerformanceCounters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PerformanceCounters {
            reboots: load(&self.reboots),
            connects: load(&self.connects),
            arms: load(&self.arms),
            starts: load(&self.starts),
            good_frames: load(&self.good_frames),
            missing_frames: load(&self.missing_frames),
            out_of_arrays: load(&self.out_of_arrays),
            driver_errors: load(&self.driver_errors),
            faults: load(&self.faults),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.reboots,
            &self.connects,
            &self.arms,
            &self.starts,
            &self.good_frames,
            &self.missing_frames,
            &self.out_of_arrays,
            &self.driver_errors,
            &self.faults,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl HardwareCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.out_of_arrays.store(0, Ordering::Relaxed);
        self.misplaced_buffers.store(0, Ordering::Relaxed);
        self.driver_library_errors.store(0, Ordering::Relaxed);
        self.frames_received.store(0, Ordering::Relaxed);
    }
}

/// State shared by the state machine thread, the hardware path and handles.
pub struct Shared {
    observed: Mutex<Observed>,
    publish: watch::Sender<Status>,
    pub(crate) frames: PendingFrameQueue,
    pub(crate) arena: Mutex<BufferArena>,
    pub(crate) pool: ArrayPool,
    pub(crate) counters: HardwareCounters,
    performance: Performance,
    /// Frames lost before the last counter reset.
    lost_baseline: AtomicU64,
}

impl Shared {
    /// Empty shared state sized for one driver.
    pub fn new(hardware_buffers: usize, frame_queue_capacity: usize, max_arrays: usize) -> Self {
        let (publish, _) = watch::channel(Status::default());
        Self {
            observed: Mutex::new(Observed::default()),
            publish,
            frames: PendingFrameQueue::new(frame_queue_capacity),
            arena: Mutex::new(BufferArena::new(hardware_buffers)),
            pool: ArrayPool::new(max_arrays),
            counters: HardwareCounters::default(),
            performance: Performance::default(),
            lost_baseline: AtomicU64::new(0),
        }
    }

    /// Copy of the current settings.
    pub fn settings(&self) -> Settings {
        self.observed.lock().settings.clone()
    }

    /// Edit the settings in place.
    pub fn update_settings(&self, update: impl FnOnce(&mut Settings)) {
        update(&mut self.observed.lock().settings);
    }

    /// Snapshot of the status with live counters folded in.
    pub fn status(&self) -> Status {
        let mut status = self.observed.lock().status.clone();
        self.fold_counters(&mut status);
        status
    }

    /// Apply `update` and republish.
    pub fn update_status(&self, update: impl FnOnce(&mut Status)) {
        let mut status = {
            let mut observed = self.observed.lock();
            update(&mut observed.status);
            observed.status.clone()
        };
        self.fold_counters(&mut status);
        self.publish.send_replace(status);
    }

    /// Receiver that sees every republished status.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.publish.subscribe()
    }

    /// Zero the counters of one acquisition run.
    pub(crate) fn reset_counters(&self) {
        self.counters.reset();
        self.lost_baseline
            .store(self.frames.lost_frames(), Ordering::Relaxed);
        self.update_status(|s| {
            s.counters = FrameCounters {
                array_counter: s.counters.array_counter,
                ..FrameCounters::default()
            }
        });
    }

    /// Count one occurrence in the performance record. Events with a session
    /// counter on the hardware path bump that too.
    pub fn count(&self, event: PerfEvent) {
        self.performance
            .counter(event)
            .fetch_add(1, Ordering::Relaxed);
        if event.is_fault() {
            self.performance.faults.fetch_add(1, Ordering::Relaxed);
        }
        match event {
            PerfEvent::OutOfArrays => HardwareCounters::bump(&self.counters.out_of_arrays),
            PerfEvent::DriverError => {
                HardwareCounters::bump(&self.counters.driver_library_errors)
            }
            _ => {}
        }
    }

    /// Zero the performance record and the session counters.
    pub fn reset_performance(&self) {
        self.performance.reset();
        self.reset_counters();
        info!("performance counters reset");
    }

    /// Forget the last recorded transition.
    pub fn clear_state_record(&self) {
        self.update_status(|s| s.last_transition.clear());
    }

    fn fold_counters(&self, status: &mut Status) {
        status.performance = self.performance.snapshot();
        let counters = &mut status.counters;
        let c = &self.counters;
        counters.out_of_arrays = c.out_of_arrays.load(Ordering::Relaxed);
        counters.misplaced_buffers = c.misplaced_buffers.load(Ordering::Relaxed);
        counters.driver_library_errors = c.driver_library_errors.load(Ordering::Relaxed);
        counters.frames_received = c.frames_received.load(Ordering::Relaxed);
        counters.outstanding_arrays = self.pool.outstanding() as u64;
        counters.lost_frames = self
            .frames
            .lost_frames()
            .saturating_sub(self.lost_baseline.load(Ordering::Relaxed));
    }
}
