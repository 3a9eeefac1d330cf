//! Checked integer conversions.
//!
//! Sizes cross the i64/u64 boundary when file lengths feed ioctl
//! structures; these helpers fail loudly instead of truncating.

use crate::config::types::{Result, StarterError};

/// Convert a signed size to u64, rejecting negatives.
pub fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| StarterError::Config(format!("cannot convert {value} to an unsigned size")))
}

/// Convert an unsigned size to i64, rejecting overflow.
pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StarterError::Config(format!("cannot convert {value} to a signed size")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_sizes() {
        assert!(to_u64(-1).is_err());
        assert_eq!(to_u64(42).unwrap(), 42);
    }

    #[test]
    fn rejects_overflowing_sizes() {
        assert!(to_i64(u64::MAX).is_err());
        assert_eq!(to_i64(42).unwrap(), 42);
    }
}
