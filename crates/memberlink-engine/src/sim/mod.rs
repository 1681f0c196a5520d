//! Deterministic in-process media engine.
//!
//! Every outcome is scripted by the caller: subscribe calls can succeed with
//! a given data quality, fail with a status, or be held until resolved by
//! hand. Subscriptions, renderers and time shifts expose setters for the
//! signals a real engine would raise on its own.

mod engine;
mod renderer;

pub use engine::{SimulatedEngine, SimulatedSubscription, SimulatedTrack, SubscribeScript};
pub use renderer::{SimulatedRenderer, SimulatedTimeShift, TransportCall};
