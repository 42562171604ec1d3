//! Human-readable byte counts for log messages.

use core::fmt;

/// Wraps a size in bytes and formats it with binary prefixes.
///
/// Whole multiples of a unit print without decimals; anything else prints up to two decimals,
/// truncated, with trailing zeros dropped.
///
/// # Examples
///
/// ```
/// use mm::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(1023)), "1023B");
/// assert_eq!(format!("{}", HumanSize(4096)), "4KiB");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// assert_eq!(format!("{}", HumanSize(4 * 1024 * 1024)), "4MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

        let bytes = self.0 as u64;
        let mut unit = 0;
        while unit + 1 < UNITS.len() && bytes >> (10 * (unit + 1)) != 0 {
            unit += 1;
        }

        let scale = 1u64 << (10 * unit);
        let whole = bytes / scale;
        let hundredths = (bytes % scale) * 100 / scale;

        match hundredths {
            0 => write!(f, "{}{}", whole, UNITS[unit]),
            h if h % 10 == 0 => write!(f, "{}.{}{}", whole, h / 10, UNITS[unit]),
            h => write!(f, "{}.{:02}{}", whole, h, UNITS[unit]),
        }
    }
}
