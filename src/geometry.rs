//! Splitting requested binning and ROI between camera and software.
//!
//! The camera can only bin by the factors in its description and only place
//! ROI edges on step boundaries, sometimes symmetrically about the sensor
//! centre. The plan asks the hardware for the smallest legal region that
//! covers the request, then describes the crop, binning and reversal the
//! pipeline must apply in software to each frame.
//!
//! Requested coordinates are zero based and in hardware-binned pixels.

use serde::{Deserialize, Serialize};

use crate::image::{Conversion, DataType};
use crate::sdk::{CameraDescription, CameraType, HardwareRoi};

/// Binning and ROI as requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedGeometry {
    pub bin_x: u32,
    pub bin_y: u32,
    pub min_x: u32,
    pub min_y: u32,
    /// 0 extends the region to the sensor edge.
    pub size_x: u32,
    pub size_y: u32,
    pub reverse_x: bool,
    pub reverse_y: bool,
    pub data_type: DataType,
}

impl Default for RequestedGeometry {
    fn default() -> Self {
        Self {
            bin_x: 1,
            bin_y: 1,
            min_x: 0,
            min_y: 0,
            size_x: 0,
            size_y: 0,
            reverse_x: false,
            reverse_y: false,
            data_type: DataType::U16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryPlan {
    pub hardware_bin_x: u32,
    pub hardware_bin_y: u32,
    pub hardware_roi: HardwareRoi,
    /// Size of the frames the camera will deliver.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Correction applied to every frame in software.
    pub conversion: Conversion,
    /// The requested ROI after clamping to the binned sensor.
    pub effective_min_x: u32,
    pub effective_min_y: u32,
    pub effective_size_x: u32,
    pub effective_size_y: u32,
}

impl GeometryPlan {
    /// Whether frames need conversion at all.
    pub fn conversion_required(&self) -> bool {
        let c = &self.conversion;
        c.offset_x != 0
            || c.offset_y != 0
            || c.width != self.frame_width
            || c.height != self.frame_height
            || c.bin_x != 1
            || c.bin_y != 1
            || c.reverse_x
            || c.reverse_y
            || c.data_type != DataType::U16
    }

    /// Size of the images leaving the pipeline.
    pub fn output_size(&self) -> (u32, u32) {
        self.conversion.output_size()
    }
}

/// Split a requested binning into (hardware, software) factors.
fn split_binning(requested: u32, valid: &[u32]) -> (u32, u32) {
    let requested = requested.max(1);
    if valid.contains(&requested) {
        (requested, 1)
    } else {
        (1, requested)
    }
}

/// One axis of the hardware ROI: zero based start, exclusive end.
struct Axis {
    start: u32,
    end: u32,
}

impl Axis {
    fn make_symmetric(&mut self, size: u32) {
        if self.start <= size - self.end {
            self.end = size - self.start;
        } else {
            self.start = size - self.end;
        }
    }

    fn align(&mut self, step: u32, size: u32) {
        let step = step.max(1);
        self.start = self.start / step * step;
        self.end = (self.end.div_ceil(step) * step).min(size);
    }
}

pub fn plan(description: &CameraDescription, requested: &RequestedGeometry) -> GeometryPlan {
    let (hw_bin_x, sw_bin_x) = split_binning(
        requested.bin_x,
        &description
            .bin_stepping_horizontal
            .values(description.max_bin_horizontal),
    );
    let (hw_bin_y, sw_bin_y) = split_binning(
        requested.bin_y,
        &description
            .bin_stepping_vertical
            .values(description.max_bin_vertical),
    );

    let cam_x = (description.max_width / hw_bin_x).max(1);
    let cam_y = (description.max_height / hw_bin_y).max(1);

    let min_x = requested.min_x.min(cam_x - 1);
    let min_y = requested.min_y.min(cam_y - 1);
    let size_x = match requested.size_x {
        0 => cam_x - min_x,
        n => n.min(cam_x - min_x),
    };
    let size_y = match requested.size_y {
        0 => cam_y - min_y,
        n => n.min(cam_y - min_y),
    };

    let mut x = Axis {
        start: min_x,
        end: min_x + size_x,
    };
    let mut y = Axis {
        start: min_y,
        end: min_y + size_y,
    };

    let dimax = description.camera_type.is_dimax();
    if description.dual_adc() || dimax {
        x.make_symmetric(cam_x);
    }
    if matches!(description.camera_type, CameraType::Edge) || dimax {
        y.make_symmetric(cam_y);
    }
    x.align(description.roi_step_horizontal, cam_x);
    y.align(description.roi_step_vertical, cam_y);

    let frame_width = x.end - x.start;
    let frame_height = y.end - y.start;

    GeometryPlan {
        hardware_bin_x: hw_bin_x,
        hardware_bin_y: hw_bin_y,
        hardware_roi: HardwareRoi {
            x0: x.start + 1,
            y0: y.start + 1,
            x1: x.end,
            y1: y.end,
        },
        frame_width,
        frame_height,
        conversion: Conversion {
            offset_x: min_x - x.start,
            offset_y: min_y - y.start,
            width: size_x,
            height: size_y,
            bin_x: sw_bin_x,
            bin_y: sw_bin_y,
            reverse_x: requested.reverse_x,
            reverse_y: requested.reverse_y,
            data_type: requested.data_type,
        },
        effective_min_x: min_x,
        effective_min_y: min_y,
        effective_size_x: size_x,
        effective_size_y: size_y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCamera;
    use crate::sdk::BinningStepping;

    fn pixelfly(width: u32, height: u32) -> CameraDescription {
        CameraDescription {
            camera_type: CameraType::Pixelfly,
            max_width: width,
            max_height: height,
            roi_step_horizontal: 1,
            roi_step_vertical: 1,
            ..MockCamera::edge_description()
        }
    }

    #[test]
    fn full_frame_needs_no_conversion() {
        let desc = pixelfly(640, 480);
        let plan = plan(&desc, &RequestedGeometry::default());
        assert_eq!(plan.hardware_roi, HardwareRoi { x0: 1, y0: 1, x1: 640, y1: 480 });
        assert_eq!((plan.frame_width, plan.frame_height), (640, 480));
        assert!(!plan.conversion_required());
    }

    #[test]
    fn unsupported_binning_moves_to_software() {
        let desc = pixelfly(640, 480);
        let request = RequestedGeometry {
            bin_x: 3,
            bin_y: 2,
            ..Default::default()
        };
        let plan = plan(&desc, &request);
        // power-of-two camera: 3 is software, 2 is hardware
        assert_eq!((plan.hardware_bin_x, plan.conversion.bin_x), (1, 3));
        assert_eq!((plan.hardware_bin_y, plan.conversion.bin_y), (2, 1));
        assert_eq!(plan.frame_height, 240);
        assert!(plan.conversion_required());
    }

    #[test]
    fn linear_stepping_accepts_any_factor_up_to_max() {
        let desc = CameraDescription {
            bin_stepping_horizontal: BinningStepping::Linear,
            ..pixelfly(600, 400)
        };
        let request = RequestedGeometry {
            bin_x: 3,
            ..Default::default()
        };
        let plan = plan(&desc, &request);
        assert_eq!(plan.hardware_bin_x, 3);
        assert_eq!(plan.frame_width, 200);
    }

    #[test]
    fn roi_is_rounded_to_steps_and_cropped_in_software() {
        let desc = CameraDescription {
            roi_step_horizontal: 32,
            ..pixelfly(640, 480)
        };
        let request = RequestedGeometry {
            min_x: 40,
            size_x: 50,
            min_y: 10,
            size_y: 20,
            ..Default::default()
        };
        let plan = plan(&desc, &request);
        assert_eq!(plan.hardware_roi, HardwareRoi { x0: 33, y0: 11, x1: 96, y1: 30 });
        assert_eq!(plan.frame_width, 64);
        assert_eq!(plan.conversion.offset_x, 8);
        assert_eq!(plan.conversion.width, 50);
        assert_eq!(plan.conversion.offset_y, 0);
        assert!(plan.conversion_required());
    }

    #[test]
    fn edge_roi_is_vertically_symmetric() {
        let desc = CameraDescription {
            roi_step_horizontal: 1,
            ..MockCamera::edge_description()
        };
        let request = RequestedGeometry {
            min_y: 100,
            size_y: 200,
            ..Default::default()
        };
        let plan = plan(&desc, &request);
        // 2160 rows: 100..300 becomes 100..2060
        assert_eq!(plan.hardware_roi.y0, 101);
        assert_eq!(plan.hardware_roi.y1, 2060);
        assert_eq!(plan.conversion.offset_y, 0);
        assert_eq!(plan.conversion.height, 200);
    }

    #[test]
    fn dual_adc_roi_is_horizontally_symmetric() {
        let desc = CameraDescription {
            num_adcs: 2,
            ..pixelfly(100, 10)
        };
        let request = RequestedGeometry {
            min_x: 70,
            size_x: 20,
            ..Default::default()
        };
        let plan = plan(&desc, &request);
        // 70..90 mirrors to 10..90
        assert_eq!((plan.hardware_roi.x0, plan.hardware_roi.x1), (11, 90));
        assert_eq!(plan.conversion.offset_x, 60);
    }

    #[test]
    fn out_of_range_request_is_clamped() {
        let desc = pixelfly(64, 32);
        let request = RequestedGeometry {
            min_x: 100,
            size_x: 10,
            min_y: 30,
            size_y: 10,
            ..Default::default()
        };
        let plan = plan(&desc, &request);
        assert_eq!(plan.effective_min_x, 63);
        assert_eq!(plan.effective_size_x, 1);
        assert_eq!(plan.effective_size_y, 2);
    }

    #[test]
    fn reversal_or_type_change_requires_conversion() {
        let desc = pixelfly(64, 32);
        let reversed = RequestedGeometry {
            reverse_x: true,
            ..Default::default()
        };
        assert!(plan(&desc, &reversed).conversion_required());
        let widened = RequestedGeometry {
            data_type: DataType::U32,
            ..Default::default()
        };
        assert!(plan(&desc, &widened).conversion_required());
    }
}
