//! Configuration Module
//!
//! Session configuration and persistence.

mod settings;
mod store;

pub use settings::*;
pub use store::*;
