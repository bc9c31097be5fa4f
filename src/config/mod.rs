//! # Pool Configuration Module
//!
//! Centralizes the pool's tuning constants. Constants are grouped by
//! functional area and interdependencies are documented and enforced through
//! compile-time assertions.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
