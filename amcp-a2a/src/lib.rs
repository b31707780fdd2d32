//! Bridge between internal bus events and the external A2A protocol.

#![warn(missing_docs, clippy::pedantic)]

mod bridge;
mod wire;

/// The bridge and its configuration.
pub use bridge::{A2aBridge, A2aBridgeConfig, A2aError, A2aResult, A2A_VERSION};
/// Wire schema shared with external A2A services.
pub use wire::{A2aMessage, A2aMessageType};
