//! Session
//!
//! Session lifecycle orchestration and event fan-out.

mod controller;
mod events;

pub use controller::*;
pub use events::*;
