//! Core data types for the CPR level alert bot.

pub mod alert;
pub mod clock;
pub mod instrument;
pub mod levels;
pub mod price;
pub mod retry;

pub use alert::*;
pub use clock::*;
pub use instrument::*;
pub use levels::*;
pub use price::*;
pub use retry::*;
