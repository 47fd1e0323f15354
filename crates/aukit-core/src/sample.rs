//! Sample type abstraction for f32/f64 buffers.
//!
//! Arena storage is raw bytes. [`Sample`] marks the types those bytes may be
//! viewed as, through `bytemuck`, without copying.

use std::ops::{Add, Mul, Sub};

/// Trait for audio sample types (f32, f64).
///
/// The `Pod` bound lets a prepared byte region be reinterpreted as samples.
/// Arena regions are 16-byte aligned and sized in multiples of 16 bytes, so
/// the cast never fails for arena memory.
pub trait Sample:
    bytemuck::Pod
    + Default
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + PartialOrd
{
    /// Zero value (0.0).
    const ZERO: Self;

    /// Unit value (1.0).
    const ONE: Self;

    /// Convert from f32.
    fn from_f32(value: f32) -> Self;

    /// Convert to f32.
    fn to_f32(self) -> f32;

    /// Absolute value.
    fn abs(self) -> Self;
}

impl Sample for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    #[inline(always)]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn abs(self) -> Self {
        f32::abs(self)
    }
}

impl Sample for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    #[inline(always)]
    fn from_f32(value: f32) -> Self {
        value as f64
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline(always)]
    fn abs(self) -> Self {
        f64::abs(self)
    }
}
