//! `pagequeue-core`: queue primitives shared by every other crate.
//!
//! This crate contains **pure** building blocks (no I/O): the coalescing key,
//! the clock abstraction with the dead-letter sentinel, and the error model.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock, after, is_never, never};
pub use error::{QueueError, QueueResult};
pub use id::RecordKey;
