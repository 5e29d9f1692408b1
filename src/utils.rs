/// Rounds `value` up to a multiple of `align`, or `None` on overflow.
///
/// Hardware alignments are not required to be powers of two, so this uses
/// division instead of masking. An alignment of 0 or 1 leaves the value unchanged.
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    if align <= 1 {
        return Some(value);
    }
    value.checked_next_multiple_of(align)
}

/// Rounds `value` up to the next power of two (0 stays 0), or `None` on overflow.
#[must_use]
pub const fn round_up_pow2(value: usize) -> Option<usize> {
    if value == 0 {
        Some(0)
    } else {
        value.checked_next_power_of_two()
    }
}

/// True when `value` and `height` are both below their power-of-two limits.
///
/// A limit of 0 disables power-of-two rounding entirely.
#[must_use]
pub const fn below_pow2_limits(
    value: usize,
    value_limit: usize,
    height: usize,
    height_limit: usize,
) -> bool {
    value < value_limit && height < height_limit
}
