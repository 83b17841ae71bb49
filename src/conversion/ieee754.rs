//! IEEE-754 raw <-> cooked conversion: the wire word is reinterpreted
//! as `binary32` bits rather than scaled as a fixed-point integer.

use crate::error::Result;
use crate::types::{round_half_away_from_zero, UserValue};

use super::RawConverter;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ieee754Converter;

impl Ieee754Converter {
    pub fn new() -> Self {
        Ieee754Converter
    }

    pub fn raw_to_f32(&self, raw: i64) -> f32 {
        f32::from_bits(raw as u32)
    }

    pub fn f32_to_raw(&self, value: f32) -> i64 {
        value.to_bits() as i32 as i64
    }
}

impl RawConverter for Ieee754Converter {
    fn to_raw(&self, value: &UserValue, path: &str) -> Result<i64> {
        let as_f64 = value.as_f64(path)?;
        Ok(self.f32_to_raw(as_f64 as f32))
    }

    fn from_raw(&self, raw: i64, _path: &str) -> Result<UserValue> {
        Ok(UserValue::Float32(self.raw_to_f32(raw)))
    }
}

/// Converts a `binary32` value to an integer user type: round-to-nearest
/// (half-away-from-zero) then range-clamp, matching the fixed-point
/// converter's integer conversion so both raw strategies share the same
/// "round, then clamp" user-facing behaviour.
pub fn f32_to_integer_clamped(value: f32, min: i64, max: i64) -> i64 {
    let rounded = round_half_away_from_zero(value as f64);
    rounded.clamp(min as f64, max as f64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_bit_pattern() {
        let conv = Ieee754Converter::new();
        for value in [0.0f32, 1.0, -1.0, 3.25, f32::MIN, f32::MAX, -0.0] {
            let raw = conv.f32_to_raw(value);
            let back = conv.raw_to_f32(raw);
            assert_eq!(back.to_bits(), value.to_bits());
        }
    }

    #[test]
    fn integer_conversion_rounds_and_clamps() {
        assert_eq!(f32_to_integer_clamped(3.6, i8::MIN as i64, i8::MAX as i64), 4);
        assert_eq!(
            f32_to_integer_clamped(1000.0, i8::MIN as i64, i8::MAX as i64),
            127
        );
    }
}
