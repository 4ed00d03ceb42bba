//! Transcript
//!
//! Reconciliation of partial/final recognition events and bounded
//! retention of the resulting transcript.

mod reconciler;
mod retention;

pub use reconciler::*;
pub use retention::*;
