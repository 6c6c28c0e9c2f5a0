//! Camera SDK boundary.
//!
//! [`CameraSdk`] is the only way the driver talks to hardware. Every call is
//! synchronous and may fail with an [`SdkError`]; the lifecycle controller
//! turns failures into transition outcomes. Implementations must be usable from
//! the state machine thread and from the hardware notification path at once,
//! so all methods take `&self`.
//!
//! Units follow the vendor conventions: ROIs are 1-based and inclusive, times
//! are integer counts of a [`Timebase`], temperatures are degrees Celsius.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SdkError;

pub type SdkResult<T> = std::result::Result<T, SdkError>;

/// Camera families whose behaviour differs in the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraType {
    Edge,
    Dimax,
    Pixelfly,
    Other(u16),
}

impl CameraType {
    pub fn is_edge(self) -> bool {
        matches!(self, CameraType::Edge)
    }

    pub fn is_dimax(self) -> bool {
        matches!(self, CameraType::Dimax)
    }
}

impl fmt::Display for CameraType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraType::Edge => f.write_str("pco.edge"),
            CameraType::Dimax => f.write_str("pco.dimax"),
            CameraType::Pixelfly => f.write_str("pco.pixelfly"),
            CameraType::Other(code) => write!(f, "pco camera {code:#06x}"),
        }
    }
}

/// How the valid binning values of one axis are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinningStepping {
    /// 1, 2, 3, ... max
    Linear,
    /// 1, 2, 4, 8, ... max
    PowerOfTwo,
}

impl BinningStepping {
    /// Valid binning values up to and including `max`.
    pub fn values(self, max: u32) -> Vec<u32> {
        let max = max.max(1);
        match self {
            BinningStepping::Linear => (1..=max).collect(),
            BinningStepping::PowerOfTwo => std::iter::successors(Some(1u32), |b| b.checked_mul(2))
                .take_while(|b| *b <= max)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TriggerMode {
    /// The camera exposes continuously as fast as timing allows.
    #[default]
    Auto,
    /// Each exposure is started by a software trigger.
    Software,
    /// Exposures start on an external edge; software triggers are also accepted.
    External,
    /// Exposures start on an external edge only.
    ExternalOnly,
}

impl TriggerMode {
    /// Modes in which the driver forces the first exposure itself.
    pub fn needs_forced_trigger(self) -> bool {
        matches!(self, TriggerMode::Software | TriggerMode::External)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimestampMode {
    None,
    /// BCD frame counter and time in the first 14 pixels.
    #[default]
    Binary,
    BinaryAndAscii,
    Ascii,
}

impl TimestampMode {
    /// Whether frames carry the binary frame counter.
    pub fn has_binary(self) -> bool {
        matches!(self, TimestampMode::Binary | TimestampMode::BinaryAndAscii)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageMode {
    Single,
    #[default]
    Multiple,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcquireMode {
    #[default]
    Auto,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageMode {
    #[default]
    Recorder,
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Timebase {
    Nanoseconds,
    Microseconds,
    #[default]
    Milliseconds,
}

impl Timebase {
    /// Seconds per count.
    pub fn seconds(self) -> f64 {
        match self {
            Timebase::Nanoseconds => 1e-9,
            Timebase::Microseconds => 1e-6,
            Timebase::Milliseconds => 1e-3,
        }
    }
}

/// Bit alignment of the pixel samples within each 16-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BitAlignment {
    /// Samples occupy the most significant bits.
    Msb,
    #[default]
    Lsb,
}

/// Static capabilities of the connected camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDescription {
    pub camera_type: CameraType,
    pub serial_number: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Significant bits per sample.
    pub dynamic_resolution: u32,
    pub max_bin_horizontal: u32,
    pub bin_stepping_horizontal: BinningStepping,
    pub max_bin_vertical: u32,
    pub bin_stepping_vertical: BinningStepping,
    pub roi_step_horizontal: u32,
    pub roi_step_vertical: u32,
    pub num_adcs: u32,
    /// Supported pixel rates in Hz.
    pub pixel_rates: Vec<u32>,
    pub min_exposure: f64,
    pub max_exposure: f64,
    pub min_delay: f64,
    pub max_delay: f64,
    pub supports_timestamp: bool,
    pub supports_ascii_timestamp: bool,
    pub bit_alignment: BitAlignment,
    /// Cooling setpoint range in degrees Celsius. Both 0 means no cooling.
    pub min_cooling_setpoint: i16,
    pub max_cooling_setpoint: i16,
    pub default_cooling_setpoint: i16,
}

impl CameraDescription {
    /// Whether readout uses more than one ADC, which forces a symmetric ROI.
    pub fn dual_adc(&self) -> bool {
        self.num_adcs > 1
    }

    pub fn has_cooling(&self) -> bool {
        self.min_cooling_setpoint != 0 || self.max_cooling_setpoint != 0
    }

    /// `requested` limited to the supported setpoint range.
    pub fn clamp_cooling_setpoint(&self, requested: i16) -> i16 {
        let (low, high) = (
            self.min_cooling_setpoint.min(self.max_cooling_setpoint),
            self.min_cooling_setpoint.max(self.max_cooling_setpoint),
        );
        requested.clamp(low, high)
    }

    /// `requested` ADC count limited to what the camera has.
    pub fn clamp_adc_count(&self, requested: u32) -> u32 {
        requested.clamp(1, self.num_adcs.max(1))
    }
}

/// Sensor and hardware ROI sizes currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sizes {
    pub width: u32,
    pub height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

/// Hardware region of interest, 1-based and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardwareRoi {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl HardwareRoi {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0) + 1
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0) + 1
    }
}

/// Exposure and delay as timebase counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DelayExposure {
    pub delay: u32,
    pub delay_base: Timebase,
    pub exposure: u32,
    pub exposure_base: Timebase,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Temperatures {
    pub sensor: f64,
    pub camera: f64,
    pub power_supply: f64,
}

/// Camera internal memory usage, for cameras with on-board RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RamUsage {
    pub images_stored: u32,
    pub max_images: u32,
}

impl RamUsage {
    pub fn percent_used(&self) -> f64 {
        if self.max_images == 0 {
            0.0
        } else {
            100.0 * f64::from(self.images_stored) / f64::from(self.max_images)
        }
    }
}

/// SDK-side identifier of an allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub i16);

/// Blocking interface to one camera.
pub trait CameraSdk: Send + Sync {
    fn open(&self) -> SdkResult<()>;
    fn close(&self) -> SdkResult<()>;
    fn reboot(&self) -> SdkResult<()>;

    fn describe(&self) -> SdkResult<CameraDescription>;
    fn sizes(&self) -> SdkResult<Sizes>;
    fn reset_settings(&self) -> SdkResult<()>;

    fn set_binning(&self, horizontal: u32, vertical: u32) -> SdkResult<()>;
    fn binning(&self) -> SdkResult<(u32, u32)>;
    fn set_roi(&self, roi: HardwareRoi) -> SdkResult<()>;
    fn roi(&self) -> SdkResult<HardwareRoi>;

    fn set_trigger_mode(&self, mode: TriggerMode) -> SdkResult<()>;
    fn set_timestamp_mode(&self, mode: TimestampMode) -> SdkResult<()>;
    fn set_acquire_mode(&self, mode: AcquireMode) -> SdkResult<()>;
    fn set_pixel_rate(&self, hz: u32) -> SdkResult<()>;
    fn pixel_rate(&self) -> SdkResult<u32>;
    fn set_delay_exposure(&self, times: DelayExposure) -> SdkResult<()>;
    fn delay_exposure(&self) -> SdkResult<DelayExposure>;
    fn storage_mode(&self) -> SdkResult<StorageMode>;
    /// Number of ADCs used for readout.
    fn set_adc_operation(&self, adcs: u32) -> SdkResult<()>;
    fn adc_operation(&self) -> SdkResult<u32>;
    fn set_bit_alignment(&self, alignment: BitAlignment) -> SdkResult<()>;
    fn bit_alignment(&self) -> SdkResult<BitAlignment>;
    fn set_cooling_setpoint(&self, celsius: i16) -> SdkResult<()>;
    fn cooling_setpoint(&self) -> SdkResult<i16>;
    fn set_date_time(&self, now: NaiveDateTime) -> SdkResult<()>;

    fn set_recording(&self, on: bool) -> SdkResult<()>;
    fn is_recording(&self) -> SdkResult<bool>;
    fn arm(&self) -> SdkResult<()>;
    /// Returns whether the camera accepted the trigger.
    fn force_trigger(&self) -> SdkResult<bool>;

    fn allocate_buffer(&self, bytes: usize) -> SdkResult<BufferHandle>;
    fn submit_buffer(&self, handle: BufferHandle, width: u32, height: u32) -> SdkResult<()>;
    fn free_buffer(&self, handle: BufferHandle) -> SdkResult<()>;
    fn cancel_images(&self) -> SdkResult<()>;

    fn temperatures(&self) -> SdkResult<Temperatures>;
    fn ram_usage(&self) -> SdkResult<RamUsage>;
}
