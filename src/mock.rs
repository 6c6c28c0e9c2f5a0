//! Mock camera SDK
//!
//! An in-memory [`CameraSdk`] for tests and the `pco-sim` binary. It keeps the
//! settings it is given, hands out buffer handles, and records every call.
//! Failures can be injected per operation, either once or until cleared, and
//! the software trigger can be told to report "not accepted".
//!
//! Frame delivery is not simulated here: the hardware path is driven through
//! [`crate::driver::FrameReceiver`], and [`MockCamera::frame`] builds raw
//! frames carrying a BCD stamp.

use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::bcd::BcdDecoder;
use crate::error::SdkError;
use crate::sdk::{
    AcquireMode, BinningStepping, BitAlignment, BufferHandle, CameraDescription, CameraSdk,
    CameraType, DelayExposure, HardwareRoi, RamUsage, SdkResult, Sizes, StorageMode, Temperatures,
    TimestampMode, TriggerMode,
};

/// Error code reported for injected failures.
pub const INJECTED_FAILURE: u32 = 0x8000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Once,
    Always,
    /// Succeed this many more times, then fail once.
    After(usize),
}

#[derive(Debug)]
struct MockState {
    description: CameraDescription,
    open: bool,
    recording: bool,
    armed: bool,
    binning: (u32, u32),
    roi: HardwareRoi,
    trigger_mode: TriggerMode,
    timestamp_mode: TimestampMode,
    acquire_mode: AcquireMode,
    pixel_rate: u32,
    times: DelayExposure,
    storage_mode: StorageMode,
    adc_count: u32,
    bit_alignment: BitAlignment,
    cooling_setpoint: i16,
    clock: Option<NaiveDateTime>,
    buffers: HashMap<i16, usize>,
    next_handle: i16,
    submitted: Vec<BufferHandle>,
    trigger_accepted: bool,
    temperatures: Temperatures,
    ram: RamUsage,
    failures: HashMap<&'static str, Failure>,
    calls: Vec<&'static str>,
}

/// Scriptable in-memory camera.
#[derive(Debug)]
pub struct MockCamera {
    state: Mutex<MockState>,
}

impl MockCamera {
    /// A 2560 x 2160 pco.edge lookalike.
    pub fn new() -> Self {
        Self::with_description(Self::edge_description())
    }

    pub fn with_description(description: CameraDescription) -> Self {
        let roi = HardwareRoi {
            x0: 1,
            y0: 1,
            x1: description.max_width,
            y1: description.max_height,
        };
        let pixel_rate = description.pixel_rates.first().copied().unwrap_or(0);
        let bit_alignment = description.bit_alignment;
        let cooling_setpoint = description.default_cooling_setpoint;
        Self {
            state: Mutex::new(MockState {
                description,
                open: false,
                recording: false,
                armed: false,
                binning: (1, 1),
                roi,
                trigger_mode: TriggerMode::Auto,
                timestamp_mode: TimestampMode::None,
                acquire_mode: AcquireMode::Auto,
                pixel_rate,
                times: DelayExposure::default(),
                storage_mode: StorageMode::Fifo,
                adc_count: 1,
                bit_alignment,
                cooling_setpoint,
                clock: None,
                buffers: HashMap::new(),
                next_handle: 0,
                submitted: Vec::new(),
                trigger_accepted: true,
                temperatures: Temperatures {
                    sensor: 5.0,
                    camera: 32.5,
                    power_supply: 38.0,
                },
                ram: RamUsage::default(),
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn edge_description() -> CameraDescription {
        CameraDescription {
            camera_type: CameraType::Edge,
            serial_number: 4242,
            max_width: 2560,
            max_height: 2160,
            dynamic_resolution: 16,
            max_bin_horizontal: 4,
            bin_stepping_horizontal: BinningStepping::PowerOfTwo,
            max_bin_vertical: 4,
            bin_stepping_vertical: BinningStepping::PowerOfTwo,
            roi_step_horizontal: 4,
            roi_step_vertical: 1,
            num_adcs: 1,
            pixel_rates: vec![95_333_333, 272_250_000],
            min_exposure: 1e-5,
            max_exposure: 2.0,
            min_delay: 0.0,
            max_delay: 1.0,
            supports_timestamp: true,
            supports_ascii_timestamp: true,
            bit_alignment: BitAlignment::Lsb,
            min_cooling_setpoint: -15,
            max_cooling_setpoint: 20,
            default_cooling_setpoint: 5,
        }
    }

    /// A small sensor, handy when tests build whole frames.
    pub fn small(width: u32, height: u32) -> Self {
        Self::with_description(CameraDescription {
            max_width: width,
            max_height: height,
            roi_step_horizontal: 1,
            ..Self::edge_description()
        })
    }

    /// Fail the next call of `operation` only.
    pub fn fail_once(&self, operation: &'static str) {
        self.state.lock().failures.insert(operation, Failure::Once);
    }

    /// Let `operation` succeed `successes` more times, then fail it once.
    pub fn fail_after(&self, operation: &'static str, successes: usize) {
        self.state
            .lock()
            .failures
            .insert(operation, Failure::After(successes));
    }

    /// Fail every call of `operation` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, operation: &'static str) {
        self.state.lock().failures.insert(operation, Failure::Always);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn set_trigger_accepted(&self, accepted: bool) {
        self.state.lock().trigger_accepted = accepted;
    }

    pub fn set_ram_usage(&self, ram: RamUsage) {
        self.state.lock().ram = ram;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == operation).count()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn allocated_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn submitted_buffers(&self) -> Vec<BufferHandle> {
        self.state.lock().submitted.clone()
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.state.lock().trigger_mode
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        self.state.lock().timestamp_mode
    }

    pub fn clock(&self) -> Option<NaiveDateTime> {
        self.state.lock().clock
    }

    /// A raw frame of the current hardware ROI filled with `value`, carrying a
    /// BCD stamp when the binary timestamp mode is on.
    pub fn frame(&self, frame_number: u32, value: u16) -> (u32, u32, Vec<u16>) {
        let state = self.state.lock();
        let width = state.roi.width();
        let height = state.roi.height();
        let mut pixels = vec![value; (width * height) as usize];
        if state.timestamp_mode.has_binary() {
            let bcd = BcdDecoder::new(state.description.dynamic_resolution, state.bit_alignment);
            bcd.stamp(&mut pixels, frame_number, Utc::now());
        }
        (width, height, pixels)
    }

    /// Record the call and apply any injected failure.
    fn call(&self, operation: &'static str) -> SdkResult<parking_lot::MutexGuard<'_, MockState>> {
        let mut state = self.state.lock();
        state.calls.push(operation);
        match state.failures.get(operation).copied() {
            Some(Failure::Once) => {
                state.failures.remove(operation);
                Err(injected(operation))
            }
            Some(Failure::Always) => Err(injected(operation)),
            Some(Failure::After(0)) => {
                state.failures.remove(operation);
                Err(injected(operation))
            }
            Some(Failure::After(n)) => {
                state.failures.insert(operation, Failure::After(n - 1));
                Ok(state)
            }
            None => Ok(state),
        }
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(operation: &'static str) -> SdkError {
    SdkError::new(operation, INJECTED_FAILURE, "injected failure")
}

impl CameraSdk for MockCamera {
    fn open(&self) -> SdkResult<()> {
        self.call("open")?.open = true;
        Ok(())
    }

    fn close(&self) -> SdkResult<()> {
        let mut state = self.call("close")?;
        state.open = false;
        state.recording = false;
        state.armed = false;
        Ok(())
    }

    fn reboot(&self) -> SdkResult<()> {
        self.call("reboot")?.open = false;
        Ok(())
    }

    fn describe(&self) -> SdkResult<CameraDescription> {
        Ok(self.call("describe")?.description.clone())
    }

    fn sizes(&self) -> SdkResult<Sizes> {
        let state = self.call("sizes")?;
        Ok(Sizes {
            width: state.roi.width(),
            height: state.roi.height(),
            max_width: state.description.max_width / state.binning.0.max(1),
            max_height: state.description.max_height / state.binning.1.max(1),
        })
    }

    fn reset_settings(&self) -> SdkResult<()> {
        let mut state = self.call("reset_settings")?;
        state.binning = (1, 1);
        state.roi = HardwareRoi {
            x0: 1,
            y0: 1,
            x1: state.description.max_width,
            y1: state.description.max_height,
        };
        state.trigger_mode = TriggerMode::Auto;
        Ok(())
    }

    fn set_binning(&self, horizontal: u32, vertical: u32) -> SdkResult<()> {
        self.call("set_binning")?.binning = (horizontal, vertical);
        Ok(())
    }

    fn binning(&self) -> SdkResult<(u32, u32)> {
        Ok(self.call("binning")?.binning)
    }

    fn set_roi(&self, roi: HardwareRoi) -> SdkResult<()> {
        let mut state = self.call("set_roi")?;
        let max_x = state.description.max_width / state.binning.0.max(1);
        let max_y = state.description.max_height / state.binning.1.max(1);
        if roi.x0 == 0 || roi.y0 == 0 || roi.x1 > max_x || roi.y1 > max_y || roi.x0 > roi.x1 || roi.y0 > roi.y1 {
            return Err(SdkError::new("set_roi", 0x8000_0002, format!("ROI {roi:?} out of range")));
        }
        state.roi = roi;
        Ok(())
    }

    fn roi(&self) -> SdkResult<HardwareRoi> {
        Ok(self.call("roi")?.roi)
    }

    fn set_trigger_mode(&self, mode: TriggerMode) -> SdkResult<()> {
        self.call("set_trigger_mode")?.trigger_mode = mode;
        Ok(())
    }

    fn set_timestamp_mode(&self, mode: TimestampMode) -> SdkResult<()> {
        self.call("set_timestamp_mode")?.timestamp_mode = mode;
        Ok(())
    }

    fn set_acquire_mode(&self, mode: AcquireMode) -> SdkResult<()> {
        self.call("set_acquire_mode")?.acquire_mode = mode;
        Ok(())
    }

    fn set_pixel_rate(&self, hz: u32) -> SdkResult<()> {
        self.call("set_pixel_rate")?.pixel_rate = hz;
        Ok(())
    }

    fn pixel_rate(&self) -> SdkResult<u32> {
        Ok(self.call("pixel_rate")?.pixel_rate)
    }

    fn set_delay_exposure(&self, times: DelayExposure) -> SdkResult<()> {
        self.call("set_delay_exposure")?.times = times;
        Ok(())
    }

    fn delay_exposure(&self) -> SdkResult<DelayExposure> {
        Ok(self.call("delay_exposure")?.times)
    }

    fn storage_mode(&self) -> SdkResult<StorageMode> {
        Ok(self.call("storage_mode")?.storage_mode)
    }

    fn set_adc_operation(&self, adcs: u32) -> SdkResult<()> {
        self.call("set_adc_operation")?.adc_count = adcs;
        Ok(())
    }

    fn adc_operation(&self) -> SdkResult<u32> {
        Ok(self.call("adc_operation")?.adc_count)
    }

    fn set_bit_alignment(&self, alignment: BitAlignment) -> SdkResult<()> {
        self.call("set_bit_alignment")?.bit_alignment = alignment;
        Ok(())
    }

    fn bit_alignment(&self) -> SdkResult<BitAlignment> {
        Ok(self.call("bit_alignment")?.bit_alignment)
    }

    fn set_cooling_setpoint(&self, celsius: i16) -> SdkResult<()> {
        self.call("set_cooling_setpoint")?.cooling_setpoint = celsius;
        Ok(())
    }

    fn cooling_setpoint(&self) -> SdkResult<i16> {
        Ok(self.call("cooling_setpoint")?.cooling_setpoint)
    }

    fn set_date_time(&self, now: NaiveDateTime) -> SdkResult<()> {
        self.call("set_date_time")?.clock = Some(now);
        Ok(())
    }

    fn set_recording(&self, on: bool) -> SdkResult<()> {
        self.call("set_recording")?.recording = on;
        Ok(())
    }

    fn is_recording(&self) -> SdkResult<bool> {
        Ok(self.call("is_recording")?.recording)
    }

    fn arm(&self) -> SdkResult<()> {
        self.call("arm")?.armed = true;
        Ok(())
    }

    fn force_trigger(&self) -> SdkResult<bool> {
        Ok(self.call("force_trigger")?.trigger_accepted)
    }

    fn allocate_buffer(&self, bytes: usize) -> SdkResult<BufferHandle> {
        let mut state = self.call("allocate_buffer")?;
        let handle = state.next_handle;
        state.next_handle = state.next_handle.wrapping_add(1);
        state.buffers.insert(handle, bytes);
        Ok(BufferHandle(handle))
    }

    fn submit_buffer(&self, handle: BufferHandle, _width: u32, _height: u32) -> SdkResult<()> {
        let mut state = self.call("submit_buffer")?;
        if !state.buffers.contains_key(&handle.0) {
            return Err(SdkError::new("submit_buffer", 0x8000_0003, "unknown buffer"));
        }
        state.submitted.push(handle);
        Ok(())
    }

    fn free_buffer(&self, handle: BufferHandle) -> SdkResult<()> {
        let mut state = self.call("free_buffer")?;
        state.buffers.remove(&handle.0);
        state.submitted.retain(|h| *h != handle);
        Ok(())
    }

    fn cancel_images(&self) -> SdkResult<()> {
        self.call("cancel_images")?.submitted.clear();
        Ok(())
    }

    fn temperatures(&self) -> SdkResult<Temperatures> {
        Ok(self.call("temperatures")?.temperatures)
    }

    fn ram_usage(&self) -> SdkResult<RamUsage> {
        Ok(self.call("ram_usage")?.ram)
    }
}
