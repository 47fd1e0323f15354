//! Overflow-aware arithmetic for buffer sizing.
//!
//! Audio buffer sizes travel through 32-bit byte counts (channel count times
//! bytes per channel). Every computation here reports overflow instead of
//! wrapping, so callers can turn it into an allocation failure.

/// Returns `true` if `value` is a non-zero power of two.
#[inline]
pub const fn is_power_of_two(value: u32) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. Returns `None` if the rounded value
/// does not fit in a `u32` or if `alignment` is not a power of two.
///
/// # Examples
///
/// ```
/// use aukit_utils::round_up_to_power_of_two;
///
/// assert_eq!(round_up_to_power_of_two(17, 16), Some(32));
/// assert_eq!(round_up_to_power_of_two(32, 16), Some(32));
/// assert_eq!(round_up_to_power_of_two(u32::MAX, 16), None);
/// ```
#[inline]
pub const fn round_up_to_power_of_two(value: u32, alignment: u32) -> Option<u32> {
    if !is_power_of_two(alignment) {
        return None;
    }
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(sum) => Some(sum & !mask),
        None => None,
    }
}

/// Compute `a * b + c`, returning `None` on `u32` overflow.
///
/// The check is performed before multiplying (`a > (u32::MAX - c) / b`), so
/// no intermediate value ever wraps. A zero factor short-circuits to `c`.
///
/// # Examples
///
/// ```
/// use aukit_utils::checked_mul_add_u32;
///
/// assert_eq!(checked_mul_add_u32(2, 512, 16), Some(1040));
/// assert_eq!(checked_mul_add_u32(0, 512, 16), Some(16));
/// assert_eq!(checked_mul_add_u32(u32::MAX, 2, 0), None);
/// ```
#[inline]
pub const fn checked_mul_add_u32(a: u32, b: u32, c: u32) -> Option<u32> {
    if a == 0 || b == 0 {
        return Some(c);
    }
    if a > (u32::MAX - c) / b {
        return None;
    }
    Some(a * b + c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(16));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(12));
    }

    #[test]
    fn test_round_up_alignment() {
        assert_eq!(round_up_to_power_of_two(0, 16), Some(0));
        assert_eq!(round_up_to_power_of_two(1, 16), Some(16));
        assert_eq!(round_up_to_power_of_two(4096, 16), Some(4096));
        assert_eq!(round_up_to_power_of_two(4097, 16), Some(4112));
    }

    #[test]
    fn test_round_up_rejects_bad_alignment() {
        assert_eq!(round_up_to_power_of_two(10, 0), None);
        assert_eq!(round_up_to_power_of_two(10, 12), None);
    }

    #[test]
    fn test_round_up_overflow() {
        assert_eq!(round_up_to_power_of_two(u32::MAX - 3, 16), None);
    }

    #[test]
    fn test_mul_add_const() {
        // Ensure it works in const context
        const SIZE: Option<u32> = checked_mul_add_u32(8, 4096, 0);
        assert_eq!(SIZE, Some(32768));
    }

    #[test]
    fn test_mul_add_boundary() {
        // Exactly u32::MAX is representable
        assert_eq!(checked_mul_add_u32(1, u32::MAX - 5, 5), Some(u32::MAX));
        // One more is not
        assert_eq!(checked_mul_add_u32(1, u32::MAX - 5, 6), None);
        assert_eq!(checked_mul_add_u32(65536, 65536, 0), None);
    }
}
