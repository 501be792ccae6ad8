//! # shoal-core
//!
//! Wire types, node identity, and the error taxonomy shared between the
//! rate limiter, codec, connection, dispatcher, and server layers of the
//! peer-to-peer core.

pub mod constants;
pub mod error;
pub mod message;
pub mod traits;

pub use error::ShoalError;
pub use message::{Capability, Handshake, Message, MessageType, NodeId, NodeType};
