//! Byte-quantity parsing and representation.
//!
//! Supports binary suffixes ("6Gi", "512Mi"), decimal suffixes ("1G",
//! "500M"), and plain byte counts. Used for the size-policy CLI flags and
//! for human-readable plan output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LoopstageError, LoopstageResult};

/// A byte quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Create from a raw byte count.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from mebibytes (MiB).
    #[must_use]
    pub const fn mebibytes(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from gibibytes (GiB).
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Raw byte count.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Parse a byte-quantity string.
    ///
    /// Binary suffixes (powers of 1024): "Ki", "Mi", "Gi", "Ti".
    /// Decimal suffixes (powers of 1000): "k", "K", "M", "G", "T".
    /// A plain number is bytes.
    pub fn parse(s: &str) -> LoopstageResult<Self> {
        let s = s.trim();

        let binary_suffixes = [
            ("Ki", 1024u64),
            ("Mi", 1024 * 1024),
            ("Gi", 1024 * 1024 * 1024),
            ("Ti", 1024 * 1024 * 1024 * 1024),
        ];

        let decimal_suffixes = [
            ("k", 1000u64),
            ("K", 1000),
            ("M", 1000 * 1000),
            ("G", 1000 * 1000 * 1000),
            ("T", 1000 * 1000 * 1000 * 1000),
        ];

        for (suffix, multiplier) in binary_suffixes.into_iter().chain(decimal_suffixes) {
            if let Some(stripped) = s.strip_suffix(suffix) {
                let value: u64 =
                    stripped
                        .parse()
                        .map_err(|_| LoopstageError::InvalidQuantity {
                            value: s.to_string(),
                        })?;
                let bytes =
                    value
                        .checked_mul(multiplier)
                        .ok_or_else(|| LoopstageError::InvalidQuantity {
                            value: s.to_string(),
                        })?;
                return Ok(Self(bytes));
            }
        }

        let bytes: u64 = s.parse().map_err(|_| LoopstageError::InvalidQuantity {
            value: s.to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GI: u64 = 1024 * 1024 * 1024;
        const MI: u64 = 1024 * 1024;
        const KI: u64 = 1024;

        if self.0 >= GI && self.0 % GI == 0 {
            write!(f, "{}Gi", self.0 / GI)
        } else if self.0 >= MI && self.0 % MI == 0 {
            write!(f, "{}Mi", self.0 / MI)
        } else if self.0 >= KI && self.0 % KI == 0 {
            write!(f, "{}Ki", self.0 / KI)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for ByteSize {
    type Err = LoopstageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> Self {
        size.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_binary() {
        assert_eq!(ByteSize::parse("1Ki").unwrap().as_bytes(), 1024);
        assert_eq!(
            ByteSize::parse("512Mi").unwrap().as_bytes(),
            512 * 1024 * 1024
        );
        assert_eq!(
            ByteSize::parse("6Gi").unwrap().as_bytes(),
            6 * 1024 * 1024 * 1024
        );
    }

    #[test]
    fn parse_decimal() {
        assert_eq!(ByteSize::parse("1k").unwrap().as_bytes(), 1000);
        assert_eq!(ByteSize::parse("128M").unwrap().as_bytes(), 128_000_000);
        assert_eq!(ByteSize::parse("1G").unwrap().as_bytes(), 1_000_000_000);
    }

    #[test]
    fn parse_plain_bytes() {
        assert_eq!(ByteSize::parse("1048576").unwrap().as_bytes(), 1_048_576);
        assert_eq!(ByteSize::parse(" 42 ").unwrap().as_bytes(), 42);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ByteSize::parse("lots").is_err());
        assert!(ByteSize::parse("1.5Gi").is_err());
        assert!(ByteSize::parse("").is_err());
        assert!(ByteSize::parse("999999999999999999Gi").is_err());
    }

    #[test]
    fn display_round() {
        assert_eq!(ByteSize::gibibytes(6).to_string(), "6Gi");
        assert_eq!(ByteSize::mebibytes(512).to_string(), "512Mi");
        assert_eq!(ByteSize::bytes(1024).to_string(), "1Ki");
        assert_eq!(ByteSize::bytes(777).to_string(), "777");
    }

    proptest::proptest! {
        #[test]
        fn display_parse_round_trip(n in 0u64..=u64::MAX) {
            let size = ByteSize::bytes(n);
            proptest::prop_assert_eq!(ByteSize::parse(&size.to_string()).unwrap(), size);
        }
    }
}
