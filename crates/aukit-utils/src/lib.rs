//! Internal utilities for the aukit real-time core.
//!
//! This crate provides low-level helpers shared by `aukit-core`. All utilities
//! are `const fn` where possible and have zero external dependencies.
//!
//! # Usage
//!
//! This crate is an internal implementation detail. Use the `aukit` facade
//! crate instead.
//!
//! # Contents
//!
//! - [`round_up_to_power_of_two`] - Round a byte count up to an alignment boundary
//! - [`checked_mul_add_u32`] - Overflow-checked `a * b + c` for 32-bit byte counts

pub mod arith;

pub use arith::{checked_mul_add_u32, is_power_of_two, round_up_to_power_of_two};
