//! Typed, CloudEvents-compatible event envelope used on the mesh bus.

#![warn(missing_docs, clippy::pedantic)]

mod cloudevents;
mod envelope;

/// CloudEvents 1.0 JSON projection helpers.
pub use cloudevents::{from_cloudevents, to_cloudevents};
/// Event envelope, its builder, and delivery semantics.
pub use envelope::{DeliveryOptions, Event, EventBuilder, EventError, EventResult};
