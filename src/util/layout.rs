//! Offset and alignment arithmetic.

/// Align an offset or size up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Align down to the given power-of-two alignment.
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Checked variant of [`align_up`] for caller-supplied sizes.
#[inline]
pub fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Index of the most significant set bit. `value` must be non-zero.
#[inline]
pub const fn fls(value: u64) -> u32 {
    63 - value.leading_zeros()
}

/// Index of the least significant set bit. `value` must be non-zero.
#[inline]
pub const fn ffs(value: u64) -> u32 {
    value.trailing_zeros()
}

/// Whether two half-open byte ranges intersect.
#[inline]
pub const fn ranges_overlap(a_offset: u64, a_size: u64, b_offset: u64, b_size: u64) -> bool {
    a_offset < b_offset + b_size && b_offset < a_offset + a_size
}
