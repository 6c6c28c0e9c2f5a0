//! Image buffers handed through the pipeline.
//!
//! An [`Image`] is a 2D array of one of six integer sample types plus the
//! metadata the driver attaches on completion. Pixel storage is a typed
//! `Vec` inside [`PixelData`]; the pool lease travels with the image and is
//! released when it drops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::pool::ArrayLease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    U8,
    I8,
    #[default]
    U16,
    I16,
    U32,
    I32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
}

/// Integer sample with the wrapping arithmetic used by accumulation and binning.
trait Sample: Copy + Default {
    fn wrapping_sum(self, other: Self) -> Self;
    fn to_i64(self) -> i64;
    /// Two's complement truncation, like an `as` cast.
    fn from_i64(value: i64) -> Self;
}

macro_rules! impl_sample {
    ($($t:ty),*) => {
        $(impl Sample for $t {
            fn wrapping_sum(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            fn to_i64(self) -> i64 {
                i64::from(self)
            }
            fn from_i64(value: i64) -> Self {
                value as $t
            }
        })*
    };
}

impl_sample!(u8, i8, u16, i16, u32, i32);

/// Apply `$body` to the inner vector whatever its sample type.
macro_rules! with_samples {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            PixelData::U8($v) => $body,
            PixelData::I8($v) => $body,
            PixelData::U16($v) => $body,
            PixelData::I16($v) => $body,
            PixelData::U32($v) => $body,
            PixelData::I32($v) => $body,
        }
    };
}

impl PixelData {
    pub fn zeroed(data_type: DataType, len: usize) -> Self {
        match data_type {
            DataType::U8 => PixelData::U8(vec![0; len]),
            DataType::I8 => PixelData::I8(vec![0; len]),
            DataType::U16 => PixelData::U16(vec![0; len]),
            DataType::I16 => PixelData::I16(vec![0; len]),
            DataType::U32 => PixelData::U32(vec![0; len]),
            DataType::I32 => PixelData::I32(vec![0; len]),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            PixelData::U8(_) => DataType::U8,
            PixelData::I8(_) => DataType::I8,
            PixelData::U16(_) => DataType::U16,
            PixelData::I16(_) => DataType::I16,
            PixelData::U32(_) => DataType::U32,
            PixelData::I32(_) => DataType::I32,
        }
    }

    pub fn len(&self) -> usize {
        with_samples!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `index` widened to `i64`.
    pub fn get(&self, index: usize) -> Option<i64> {
        with_samples!(self, v => v.get(index).map(|s| s.to_i64()))
    }

    /// Element-wise wrapping sum. `false` if type or length differ.
    fn accumulate(&mut self, other: &PixelData) -> bool {
        fn add<T: Sample>(acc: &mut [T], src: &[T]) {
            acc.iter_mut().zip(src).for_each(|(a, s)| *a = a.wrapping_sum(*s));
        }
        if self.len() != other.len() {
            return false;
        }
        match (self, other) {
            (PixelData::U8(a), PixelData::U8(b)) => add(a, b),
            (PixelData::I8(a), PixelData::I8(b)) => add(a, b),
            (PixelData::U16(a), PixelData::U16(b)) => add(a, b),
            (PixelData::I16(a), PixelData::I16(b)) => add(a, b),
            (PixelData::U32(a), PixelData::U32(b)) => add(a, b),
            (PixelData::I32(a), PixelData::I32(b)) => add(a, b),
            _ => return false,
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Text(v) => f.write_str(v),
        }
    }
}

/// Software ROI, binning, reversal and output type applied to a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
    pub bin_x: u32,
    pub bin_y: u32,
    pub reverse_x: bool,
    pub reverse_y: bool,
    pub data_type: DataType,
}

impl Conversion {
    /// The identity conversion for a `width` x `height` u16 frame.
    pub fn identity(width: u32, height: u32) -> Self {
        Self {
            offset_x: 0,
            offset_y: 0,
            width,
            height,
            bin_x: 1,
            bin_y: 1,
            reverse_x: false,
            reverse_y: false,
            data_type: DataType::U16,
        }
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.width / self.bin_x.max(1), self.height / self.bin_y.max(1))
    }
}

pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: PixelData,
    /// Output sequence number, assigned when the image is completed.
    pub unique_id: u64,
    /// Camera frame counter of the last contributing frame.
    pub frame_number: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub attributes: BTreeMap<String, AttributeValue>,
    lease: Option<ArrayLease>,
}

impl Image {
    pub fn new(width: u32, height: u32, data_type: DataType, lease: Option<ArrayLease>) -> Self {
        Self::with_data(
            width,
            height,
            PixelData::zeroed(data_type, width as usize * height as usize),
            lease,
        )
    }

    pub fn with_data(width: u32, height: u32, data: PixelData, lease: Option<ArrayLease>) -> Self {
        Self {
            width,
            height,
            data,
            unique_id: 0,
            frame_number: 0,
            timestamp: None,
            attributes: BTreeMap::new(),
            lease,
        }
    }

    /// Copy of raw camera pixels.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16], lease: Option<ArrayLease>) -> Self {
        Self::with_data(width, height, PixelData::U16(pixels.to_vec()), lease)
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<i64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y as usize * self.width as usize + x as usize)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(name.into(), value);
    }

    /// Add `other` element-wise into this image with wrapping arithmetic.
    /// Returns `false`, leaving `self` untouched, if shape or type differ.
    pub fn accumulate(&mut self, other: &Image) -> bool {
        if self.width != other.width || self.height != other.height {
            return false;
        }
        self.data.accumulate(&other.data)
    }

    /// Crop, sum-bin, reverse and cast into a new image.
    ///
    /// Each source sample is cast to the output type before summing, and sums
    /// wrap in the output type. The crop is clipped to the source frame.
    pub fn convert(&self, conversion: &Conversion, lease: Option<ArrayLease>) -> Image {
        let data = match conversion.data_type {
            DataType::U8 => PixelData::U8(self.convert_samples(conversion)),
            DataType::I8 => PixelData::I8(self.convert_samples(conversion)),
            DataType::U16 => PixelData::U16(self.convert_samples(conversion)),
            DataType::I16 => PixelData::I16(self.convert_samples(conversion)),
            DataType::U32 => PixelData::U32(self.convert_samples(conversion)),
            DataType::I32 => PixelData::I32(self.convert_samples(conversion)),
        };
        let (width, height) = self.converted_size(conversion);
        let mut image = Image::with_data(width, height, data, lease);
        image.frame_number = self.frame_number;
        image.timestamp = self.timestamp;
        image
    }

    fn converted_size(&self, c: &Conversion) -> (u32, u32) {
        let bin_x = c.bin_x.max(1);
        let bin_y = c.bin_y.max(1);
        let width = c.width.min(self.width.saturating_sub(c.offset_x));
        let height = c.height.min(self.height.saturating_sub(c.offset_y));
        (width / bin_x, height / bin_y)
    }

    fn convert_samples<T: Sample>(&self, c: &Conversion) -> Vec<T> {
        let (out_w, out_h) = self.converted_size(c);
        let (out_w, out_h) = (out_w as usize, out_h as usize);
        let bin_x = c.bin_x.max(1) as usize;
        let bin_y = c.bin_y.max(1) as usize;
        let src_w = self.width as usize;
        let mut out = vec![T::default(); out_w * out_h];

        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut sum = T::default();
                for by in 0..bin_y {
                    let sy = c.offset_y as usize + oy * bin_y + by;
                    for bx in 0..bin_x {
                        let sx = c.offset_x as usize + ox * bin_x + bx;
                        let value = self.data.get(sy * src_w + sx).unwrap_or(0);
                        sum = sum.wrapping_sum(T::from_i64(value));
                    }
                }
                let dx = if c.reverse_x { out_w - 1 - ox } else { ox };
                let dy = if c.reverse_y { out_h - 1 - oy } else { oy };
                out[dy * out_w + dx] = sum;
            }
        }
        out
    }
}

/// Copies share pixels and metadata but not the pool lease.
impl Clone for Image {
    fn clone(&self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.clone(),
            unique_id: self.unique_id,
            frame_number: self.frame_number,
            timestamp: self.timestamp,
            attributes: self.attributes.clone(),
            lease: None,
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("data_type", &self.data_type())
            .field("unique_id", &self.unique_id)
            .field("frame_number", &self.frame_number)
            .field("timestamp", &self.timestamp)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
