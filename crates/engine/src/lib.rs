//! CPR touch detection engine.
//!
//! This crate contains the level touch detector and the market session
//! schedule that decides when levels are reset and prices are polled.

pub mod detector;
pub mod session;

pub use detector::*;
pub use session::*;
