//! Common types and traits for selflow
//!
//! This crate provides the event model shared by the capture pipeline and
//! by downstream readers of the event store.

pub mod events;
pub mod hash;
pub mod platform;

pub use events::*;
pub use hash::*;
pub use platform::*;
