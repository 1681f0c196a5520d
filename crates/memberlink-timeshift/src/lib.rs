//! Time-shifted playback.
//!
//! A [`TimeShift`] seeks a renderer back to a point in time and tracks the
//! resulting playback session: readiness, transport commands, the playback
//! head, and automatic recovery from engine failures. The
//! [`TimeShiftController`] keeps at most one time shift per alias.

mod controller;
mod timeshift;

pub use controller::TimeShiftController;
pub use timeshift::{max_retries, TimeShift};
