//! Exposure, delay and period planning.
//!
//! The camera takes exposure and delay as integer counts of a timebase. A zero
//! configured delay means "derive the delay from the acquisition period".

use serde::{Deserialize, Serialize};

use crate::sdk::{CameraDescription, DelayExposure, Timebase};

/// Requested times in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimingRequest {
    pub exposure: f64,
    pub period: f64,
    /// 0 derives the delay from `period`.
    pub delay: f64,
}

/// Times the camera actually applied, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AchievedTiming {
    pub exposure: f64,
    /// The configured delay: unchanged when it was 0, the applied value otherwise.
    pub delay: f64,
    pub period: f64,
}

/// Smallest timebase that can represent `seconds` without overflow.
pub fn timebase_for(seconds: f64) -> Timebase {
    if seconds < 1e-3 {
        Timebase::Nanoseconds
    } else if seconds < 1.0 {
        Timebase::Microseconds
    } else {
        Timebase::Milliseconds
    }
}

fn to_counts(seconds: f64, base: Timebase) -> u32 {
    // float -> int `as` saturates
    (seconds / base.seconds()).round() as u32
}

fn from_counts(counts: u32, base: Timebase) -> f64 {
    f64::from(counts) * base.seconds()
}

/// Clamp the request to the camera's limits and encode it.
pub fn plan(description: &CameraDescription, request: &TimingRequest) -> DelayExposure {
    let delay = if request.delay == 0.0 {
        (request.period - request.exposure).max(0.0)
    } else {
        request.delay
    };
    let delay = delay.clamp(description.min_delay, description.max_delay.max(description.min_delay));
    let exposure = request.exposure.clamp(
        description.min_exposure,
        description.max_exposure.max(description.min_exposure),
    );

    let delay_base = timebase_for(delay);
    let exposure_base = timebase_for(exposure);
    DelayExposure {
        delay: to_counts(delay, delay_base),
        delay_base,
        exposure: to_counts(exposure, exposure_base),
        exposure_base,
    }
}

/// Interpret the values read back from the camera.
pub fn achieved(request: &TimingRequest, readback: &DelayExposure) -> AchievedTiming {
    let exposure = from_counts(readback.exposure, readback.exposure_base);
    let delay = from_counts(readback.delay, readback.delay_base);
    AchievedTiming {
        exposure,
        delay: if request.delay == 0.0 { 0.0 } else { delay },
        period: exposure + delay,
    }
}
