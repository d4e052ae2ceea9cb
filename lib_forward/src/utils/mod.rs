//! # Utilities Module
//!
//! Small helpers used by the engine that do not belong to any single
//! component.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Socket setup for the listeners.
pub mod net;
