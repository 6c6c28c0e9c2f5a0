//! Binary coded decimal stamps embedded in raw frames.
//!
//! With the binary timestamp mode enabled the camera overwrites the first 14
//! pixels of each frame. Every pixel carries two decimal digits, one per
//! nybble, shifted up when samples are MSB aligned:
//!
//! | pixels | content |
//! |---|---|
//! | 0..4 | frame counter, most significant digits first (8 digits) |
//! | 4..6 | year (century, year) |
//! | 6..11 | month, day, hour, minute, second |
//! | 11..14 | microseconds (6 digits) |

use chrono::{DateTime, NaiveDate, Utc};

use crate::sdk::BitAlignment;

const NYBBLE_MASK: u16 = 0x0f;
const FRAME_NUMBER_PIXELS: usize = 4;
/// Pixels consumed by the frame counter and timestamp together.
pub const STAMP_PIXELS: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BcdDecoder {
    shift: u32,
}

impl BcdDecoder {
    pub fn new(dynamic_resolution: u32, alignment: BitAlignment) -> Self {
        let shift = match alignment {
            BitAlignment::Msb => 16u32.saturating_sub(dynamic_resolution).min(12),
            BitAlignment::Lsb => 0,
        };
        Self { shift }
    }

    /// Two decimal digits from one pixel.
    pub fn digits(&self, pixel: u16) -> u32 {
        let low = (pixel >> self.shift) & NYBBLE_MASK;
        let high = (pixel >> (self.shift + 4)) & NYBBLE_MASK;
        u32::from(high) * 10 + u32::from(low)
    }

    /// The frame counter, or `None` when the frame is too small to carry one.
    pub fn frame_number(&self, pixels: &[u16]) -> Option<u32> {
        let stamp = pixels.get(..FRAME_NUMBER_PIXELS)?;
        Some(
            stamp
                .iter()
                .fold(0u32, |acc, &p| acc.wrapping_mul(100).wrapping_add(self.digits(p))),
        )
    }

    /// The exposure time stamp, or `None` when absent or not a valid date.
    pub fn timestamp(&self, pixels: &[u16]) -> Option<DateTime<Utc>> {
        let stamp = pixels.get(..STAMP_PIXELS)?;
        let d = |i: usize| self.digits(stamp[i]);
        let year = i32::try_from(d(4) * 100 + d(5)).ok()?;
        let micros = d(11) * 10_000 + d(12) * 100 + d(13);
        let time = NaiveDate::from_ymd_opt(year, d(6), d(7))?
            .and_hms_micro_opt(d(8), d(9), d(10), micros)?;
        Some(time.and_utc())
    }

    /// Two decimal digits packed into one pixel; the inverse of [`digits`](Self::digits).
    pub fn encode(&self, value: u32) -> u16 {
        let value = value % 100;
        // u32 -> u16 cannot truncate: both nybbles are < 10
        let packed = ((value / 10) << 4 | (value % 10)) as u16;
        packed << self.shift
    }

    /// Write a frame counter and time stamp into the first pixels of a frame.
    /// Frames shorter than the stamp are left untouched.
    pub fn stamp(&self, pixels: &mut [u16], frame_number: u32, time: DateTime<Utc>) {
        use chrono::{Datelike, Timelike};

        let Some(stamp) = pixels.get_mut(..STAMP_PIXELS) else {
            return;
        };
        let year = u32::try_from(time.year()).unwrap_or(0);
        let micros = time.nanosecond() / 1_000 % 1_000_000;
        let values = [
            frame_number / 1_000_000 % 100,
            frame_number / 10_000 % 100,
            frame_number / 100 % 100,
            frame_number % 100,
            year / 100,
            year % 100,
            time.month(),
            time.day(),
            time.hour(),
            time.minute(),
            time.second(),
            micros / 10_000,
            micros / 100 % 100,
            micros % 100,
        ];
        for (pixel, value) in stamp.iter_mut().zip(values) {
            *pixel = self.encode(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn digits_read_both_nybbles() {
        let bcd = BcdDecoder::default();
        assert_eq!(bcd.digits(0x0042), 42);
        assert_eq!(bcd.digits(0x0009), 9);
        // high byte is ignored
        assert_eq!(bcd.digits(0xff17), 17);
    }

    #[test]
    fn frame_number_spans_four_pixels() {
        let bcd = BcdDecoder::default();
        assert_eq!(bcd.frame_number(&[0x00, 0x01, 0x23, 0x45]), Some(12_345));
        assert_eq!(bcd.frame_number(&[0x99, 0x99, 0x99, 0x99, 7]), Some(99_999_999));
        assert_eq!(bcd.frame_number(&[1, 2]), None);
    }

    #[test]
    fn msb_alignment_shifts_digits() {
        let bcd = BcdDecoder::new(14, BitAlignment::Msb);
        assert_eq!(bcd.digits(0x42 << 2), 42);
        assert_eq!(BcdDecoder::new(14, BitAlignment::Lsb).digits(0x42), 42);
    }

    #[test]
    fn timestamp_decodes_calendar_fields() {
        let bcd = BcdDecoder::default();
        let pixels = [
            0x00, 0x00, 0x00, 0x07, // frame 7
            0x20, 0x24, 0x03, 0x15, // 2024-03-15
            0x13, 0x45, 0x30, // 13:45:30
            0x12, 0x34, 0x56, // .123456
        ];
        let expected = Utc.with_ymd_and_hms(2024, 3, 15, 13, 45, 30).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(bcd.timestamp(&pixels), Some(expected));
    }

    #[test]
    fn invalid_dates_are_rejected() {
        let bcd = BcdDecoder::default();
        assert_eq!(bcd.timestamp(&[0u16; STAMP_PIXELS]), None);
        assert_eq!(bcd.timestamp(&[0u16; 8]), None);
    }

    #[test]
    fn stamp_is_read_back() {
        let bcd = BcdDecoder::new(12, BitAlignment::Msb);
        let time = Utc.with_ymd_and_hms(2023, 11, 2, 8, 5, 59).unwrap()
            + chrono::Duration::microseconds(42);
        let mut frame = vec![0u16; 64];
        bcd.stamp(&mut frame, 1_234_567, time);
        assert_eq!(bcd.frame_number(&frame), Some(1_234_567));
        assert_eq!(bcd.timestamp(&frame), Some(time));
        assert_eq!(frame[STAMP_PIXELS], 0);
    }
}
