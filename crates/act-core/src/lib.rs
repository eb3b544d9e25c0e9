//! `act-core`
//!
//! Shared building blocks for the actuator link: the workspace-wide error type and
//! the deadline-bounded serial I/O primitives every higher layer is written against.
//!
//! ## Key Types
//!
//! - [`ActError`]: single error type with link-fatality and exit-code classification
//! - [`serial::DynSerial`]: type-erased, exclusively owned serial stream
//! - [`serial::BoundedRead`]: outcome of a read that gives up at a deadline

pub mod error;
pub mod serial;

pub use error::{ActError, ActResult, FaultKind};
