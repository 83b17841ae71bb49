//! Bit-exact conversion between packed raw wire words and user types.

pub mod fixed_point;
pub mod ieee754;

pub use fixed_point::FixedPointConverter;
pub use ieee754::Ieee754Converter;

use crate::error::Result;
use crate::types::UserValue;

/// Common interface for the two raw <-> cooked conversion strategies a
/// numeric-addressed register may declare (fixed-point or IEEE-754).
/// `raw` is always carried as a sign-extended `i64` regardless of the
/// declared wire width, since every wire width this library supports
/// fits in 64 bits.
pub trait RawConverter: std::fmt::Debug + Send + Sync {
    fn to_raw(&self, value: &UserValue, path: &str) -> Result<i64>;
    fn from_raw(&self, raw: i64, path: &str) -> Result<UserValue>;
}
