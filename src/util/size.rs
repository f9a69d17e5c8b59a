//! Byte-count helpers for arena and budget sizes.

/// `n` KiB in bytes.
#[inline]
pub const fn kb(n: u64) -> u64 {
    n << 10
}

/// `n` MiB in bytes.
#[inline]
pub const fn mb(n: u64) -> u64 {
    n << 20
}

/// `n` GiB in bytes. Device budgets routinely exceed 4 GiB, hence `u64`.
#[inline]
pub const fn gb(n: u64) -> u64 {
    n << 30
}

/// Format a byte count with the largest binary unit that keeps it at or above 1.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u32); 4] = [("TB", 40), ("GB", 30), ("MB", 20), ("KB", 10)];

    for (unit, shift) in UNITS {
        if bytes >> shift != 0 {
            return format!("{:.2} {}", bytes as f64 / (1u64 << shift) as f64, unit);
        }
    }
    format!("{} B", bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_conversions() {
        assert_eq!(kb(1), 1024);
        assert_eq!(mb(256), 256 * 1024 * 1024);
        assert_eq!(gb(8), 8_589_934_592);
        assert!(gb(8) > u64::from(u32::MAX));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(kb(64)), "64.00 KB");
        assert_eq!(format_bytes(mb(1) + kb(512)), "1.50 MB");
        assert_eq!(format_bytes(gb(8)), "8.00 GB");
        assert_eq!(format_bytes(gb(3 * 1024)), "3.00 TB");
    }
}
