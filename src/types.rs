//! The enumerable set of user types and total conversions between them.
//!
//! Rather than dispatch on a C++-style function template instantiated
//! per type, conversions here go through a tagged [`UserValue`] enum
//! plus a per-type [`UserType`] trait, matching the "type-dispatched
//! function templates -> tagged variant + dispatch table" rework
//! called out in the design notes.

use std::fmt;

use crate::error::{DeviceError, Result};

/// Identifies one of the fixed set of user types at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserTypeTag {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Str,
    Boolean,
    Void,
}

impl fmt::Display for UserTypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UserTypeTag::Int8 => "int8",
            UserTypeTag::Int16 => "int16",
            UserTypeTag::Int32 => "int32",
            UserTypeTag::Int64 => "int64",
            UserTypeTag::UInt8 => "uint8",
            UserTypeTag::UInt16 => "uint16",
            UserTypeTag::UInt32 => "uint32",
            UserTypeTag::UInt64 => "uint64",
            UserTypeTag::Float32 => "float32",
            UserTypeTag::Float64 => "float64",
            UserTypeTag::Str => "string",
            UserTypeTag::Boolean => "boolean",
            UserTypeTag::Void => "void",
        };
        f.write_str(name)
    }
}

/// A dynamically-tagged user value, used wherever the concrete type is
/// only known at runtime (mapping-document literals, `constant` and
/// `variable` virtual registers, map-file default values).
#[derive(Debug, Clone, PartialEq)]
pub enum UserValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Boolean(bool),
    Void,
}

impl UserValue {
    pub fn tag(&self) -> UserTypeTag {
        match self {
            UserValue::Int8(_) => UserTypeTag::Int8,
            UserValue::Int16(_) => UserTypeTag::Int16,
            UserValue::Int32(_) => UserTypeTag::Int32,
            UserValue::Int64(_) => UserTypeTag::Int64,
            UserValue::UInt8(_) => UserTypeTag::UInt8,
            UserValue::UInt16(_) => UserTypeTag::UInt16,
            UserValue::UInt32(_) => UserTypeTag::UInt32,
            UserValue::UInt64(_) => UserTypeTag::UInt64,
            UserValue::Float32(_) => UserTypeTag::Float32,
            UserValue::Float64(_) => UserTypeTag::Float64,
            UserValue::Str(_) => UserTypeTag::Str,
            UserValue::Boolean(_) => UserTypeTag::Boolean,
            UserValue::Void => UserTypeTag::Void,
        }
    }

    /// Lossless widening to `f64`, used as the common intermediate for
    /// numeric-to-numeric conversions. Booleans become 0.0/1.0; void
    /// becomes 0.0; strings parse (logic error on failure).
    pub fn as_f64(&self, path: &str) -> Result<f64> {
        Ok(match self {
            UserValue::Int8(v) => *v as f64,
            UserValue::Int16(v) => *v as f64,
            UserValue::Int32(v) => *v as f64,
            UserValue::Int64(v) => *v as f64,
            UserValue::UInt8(v) => *v as f64,
            UserValue::UInt16(v) => *v as f64,
            UserValue::UInt32(v) => *v as f64,
            UserValue::UInt64(v) => *v as f64,
            UserValue::Float32(v) => *v as f64,
            UserValue::Float64(v) => *v,
            UserValue::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            UserValue::Void => 0.0,
            UserValue::Str(s) => s.trim().parse::<f64>().map_err(|_| {
                DeviceError::logic(path, format!("cannot parse '{s}' as a number"))
            })?,
        })
    }

    /// Decimal string rendering used for string round trips.
    pub fn to_display_string(&self) -> String {
        match self {
            UserValue::Int8(v) => v.to_string(),
            UserValue::Int16(v) => v.to_string(),
            UserValue::Int32(v) => v.to_string(),
            UserValue::Int64(v) => v.to_string(),
            UserValue::UInt8(v) => v.to_string(),
            UserValue::UInt16(v) => v.to_string(),
            UserValue::UInt32(v) => v.to_string(),
            UserValue::UInt64(v) => v.to_string(),
            UserValue::Float32(v) => v.to_string(),
            UserValue::Float64(v) => v.to_string(),
            UserValue::Str(s) => s.clone(),
            UserValue::Boolean(v) => v.to_string(),
            UserValue::Void => String::new(),
        }
    }

    /// Range-checked conversion to the given target type: out-of-range
    /// numeric values are rejected rather than wrapped. Non-integral
    /// floats converting to integral types are rounded half-away-from-zero.
    pub fn convert_checked(&self, target: UserTypeTag, path: &str) -> Result<UserValue> {
        convert(self, target, path, Rounding::Checked)
    }

    /// Direct-cast conversion: numeric narrowing wraps/truncates the
    /// way an `as` cast would, never failing for numeric-to-numeric
    /// conversions.
    pub fn convert_direct(&self, target: UserTypeTag, path: &str) -> Result<UserValue> {
        convert(self, target, path, Rounding::Direct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rounding {
    Checked,
    Direct,
}

fn convert(src: &UserValue, target: UserTypeTag, path: &str, mode: Rounding) -> Result<UserValue> {
    if let UserValue::Str(s) = src {
        if target != UserTypeTag::Str {
            return parse_string(s, target, path);
        }
    }
    match target {
        UserTypeTag::Str => Ok(UserValue::Str(src.to_display_string())),
        UserTypeTag::Boolean => Ok(UserValue::Boolean(src.as_f64(path)? != 0.0)),
        UserTypeTag::Void => Ok(UserValue::Void),
        UserTypeTag::Float32 => Ok(UserValue::Float32(src.as_f64(path)? as f32)),
        UserTypeTag::Float64 => Ok(UserValue::Float64(src.as_f64(path)?)),
        UserTypeTag::Int8 => to_integral(src, path, mode, i8::MIN as f64, i8::MAX as f64)
            .map(|v| UserValue::Int8(v as i8)),
        UserTypeTag::Int16 => to_integral(src, path, mode, i16::MIN as f64, i16::MAX as f64)
            .map(|v| UserValue::Int16(v as i16)),
        UserTypeTag::Int32 => to_integral(src, path, mode, i32::MIN as f64, i32::MAX as f64)
            .map(|v| UserValue::Int32(v as i32)),
        UserTypeTag::Int64 => to_integral(src, path, mode, i64::MIN as f64, i64::MAX as f64)
            .map(|v| UserValue::Int64(v as i64)),
        UserTypeTag::UInt8 => {
            to_integral(src, path, mode, 0.0, u8::MAX as f64).map(|v| UserValue::UInt8(v as u8))
        }
        UserTypeTag::UInt16 => {
            to_integral(src, path, mode, 0.0, u16::MAX as f64).map(|v| UserValue::UInt16(v as u16))
        }
        UserTypeTag::UInt32 => {
            to_integral(src, path, mode, 0.0, u32::MAX as f64).map(|v| UserValue::UInt32(v as u32))
        }
        UserTypeTag::UInt64 => {
            to_integral(src, path, mode, 0.0, u64::MAX as f64).map(|v| UserValue::UInt64(v as u64))
        }
    }
}

fn to_integral(src: &UserValue, path: &str, mode: Rounding, min: f64, max: f64) -> Result<f64> {
    let raw = src.as_f64(path)?;
    let rounded = round_half_away_from_zero(raw);
    match mode {
        Rounding::Checked => {
            if rounded < min || rounded > max {
                return Err(DeviceError::logic(
                    path,
                    format!("value {raw} out of range [{min}, {max}]"),
                ));
            }
            Ok(rounded)
        }
        Rounding::Direct => Ok(rounded.clamp(min, max)),
    }
}

fn parse_string(s: &str, target: UserTypeTag, path: &str) -> Result<UserValue> {
    let trimmed = s.trim();
    let bad = || DeviceError::logic(path, format!("cannot parse '{s}' as {target}"));
    Ok(match target {
        UserTypeTag::Int8 => UserValue::Int8(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::Int16 => UserValue::Int16(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::Int32 => UserValue::Int32(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::Int64 => UserValue::Int64(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::UInt8 => UserValue::UInt8(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::UInt16 => UserValue::UInt16(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::UInt32 => UserValue::UInt32(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::UInt64 => UserValue::UInt64(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::Float32 => UserValue::Float32(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::Float64 => UserValue::Float64(trimmed.parse().map_err(|_| bad())?),
        UserTypeTag::Str => UserValue::Str(s.to_string()),
        UserTypeTag::Boolean => {
            let lower = trimmed.to_ascii_lowercase();
            UserValue::Boolean(!(lower == "false" || lower == "0" || lower.is_empty()))
        }
        UserTypeTag::Void => UserValue::Void,
    })
}

/// Round-half-away-from-zero, as required by the fixed-point conversion
/// rule in the component design (not `f64::round_ties_even`).
pub fn round_half_away_from_zero(x: f64) -> f64 {
    if x >= 0.0 {
        (x + 0.5).floor()
    } else {
        (x - 0.5).ceil()
    }
}

/// Implemented for every concrete Rust type that backs an
/// [`crate::accessor::NDRegisterAccessor`] buffer.
pub trait UserType: Clone + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const TAG: UserTypeTag;

    fn to_user_value(&self) -> UserValue;
    fn from_user_value(value: &UserValue, path: &str) -> Result<Self>;
}

macro_rules! impl_user_type_numeric {
    ($t:ty, $tag:ident, $variant:ident) => {
        impl UserType for $t {
            const TAG: UserTypeTag = UserTypeTag::$tag;

            fn to_user_value(&self) -> UserValue {
                UserValue::$variant(*self)
            }

            fn from_user_value(value: &UserValue, path: &str) -> Result<Self> {
                match value.convert_checked(UserTypeTag::$tag, path)? {
                    UserValue::$variant(v) => Ok(v),
                    _ => unreachable!("convert_checked always returns the requested tag"),
                }
            }
        }
    };
}

impl_user_type_numeric!(i8, Int8, Int8);
impl_user_type_numeric!(i16, Int16, Int16);
impl_user_type_numeric!(i32, Int32, Int32);
impl_user_type_numeric!(i64, Int64, Int64);
impl_user_type_numeric!(u8, UInt8, UInt8);
impl_user_type_numeric!(u16, UInt16, UInt16);
impl_user_type_numeric!(u32, UInt32, UInt32);
impl_user_type_numeric!(u64, UInt64, UInt64);
impl_user_type_numeric!(f32, Float32, Float32);
impl_user_type_numeric!(f64, Float64, Float64);

impl UserType for bool {
    const TAG: UserTypeTag = UserTypeTag::Boolean;

    fn to_user_value(&self) -> UserValue {
        UserValue::Boolean(*self)
    }

    fn from_user_value(value: &UserValue, path: &str) -> Result<Self> {
        match value.convert_checked(UserTypeTag::Boolean, path)? {
            UserValue::Boolean(v) => Ok(v),
            _ => unreachable!(),
        }
    }
}

impl UserType for String {
    const TAG: UserTypeTag = UserTypeTag::Str;

    fn to_user_value(&self) -> UserValue {
        UserValue::Str(self.clone())
    }

    fn from_user_value(value: &UserValue, path: &str) -> Result<Self> {
        match value.convert_checked(UserTypeTag::Str, path)? {
            UserValue::Str(v) => Ok(v),
            _ => unreachable!(),
        }
    }
}

/// The `Void` user type: every register that carries no payload (void
/// registers, pure triggers) is typed `()`.
impl UserType for () {
    const TAG: UserTypeTag = UserTypeTag::Void;

    fn to_user_value(&self) -> UserValue {
        UserValue::Void
    }

    fn from_user_value(_value: &UserValue, _path: &str) -> Result<Self> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(3.5, 4.0)]
    #[test_case(-3.5, -4.0)]
    #[test_case(2.4, 2.0)]
    #[test_case(-2.4, -2.0)]
    #[test_case(0.5, 1.0)]
    #[test_case(-0.5, -1.0)]
    fn round_half_away(input: f64, expected: f64) {
        assert_eq!(round_half_away_from_zero(input), expected);
    }

    #[test]
    fn checked_rejects_out_of_range() {
        let v = UserValue::Int32(1000);
        assert!(v.convert_checked(UserTypeTag::Int8, "/r").is_err());
    }

    #[test]
    fn direct_clamps_out_of_range() {
        let v = UserValue::Int32(1000);
        let converted = v.convert_direct(UserTypeTag::Int8, "/r").unwrap();
        assert_eq!(converted, UserValue::Int8(i8::MAX));
    }

    #[test]
    fn string_round_trip() {
        for v in [
            UserValue::Int32(-42),
            UserValue::Float64(3.25),
            UserValue::Boolean(true),
        ] {
            let s = v.convert_checked(UserTypeTag::Str, "/r").unwrap();
            let back = s.convert_checked(v.tag(), "/r").unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn generic_user_type_round_trip() {
        let value = UserValue::Int32(7);
        let typed = i64::from_user_value(&value, "/r").unwrap();
        assert_eq!(typed, 7);
        assert_eq!(typed.to_user_value(), UserValue::Int64(7));
    }

    #[test]
    fn bool_parses_like_source_semantics() {
        assert_eq!(
            UserValue::Str("False".into())
                .convert_checked(UserTypeTag::Boolean, "/r")
                .unwrap(),
            UserValue::Boolean(false)
        );
        assert_eq!(
            UserValue::Str("".into())
                .convert_checked(UserTypeTag::Boolean, "/r")
                .unwrap(),
            UserValue::Boolean(false)
        );
        assert_eq!(
            UserValue::Str("yes".into())
                .convert_checked(UserTypeTag::Boolean, "/r")
                .unwrap(),
            UserValue::Boolean(true)
        );
    }
}
