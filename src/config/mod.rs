//! # Configuration Module
//!
//! Centralizes the numeric configuration values for tarndb. Constants with
//! interdependencies live together in [`constants`] so that changing one
//! forces a look at the others, and the relationships are enforced through
//! compile-time assertions where possible.

pub mod constants;
pub use constants::*;
