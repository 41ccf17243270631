//! Message codecs and routing.
//!
//! A [`Processor`] turns wire payloads into typed messages and routes
//! each decoded message to its handler: an inline function, a
//! raw-bytes handler, or a fire-and-forget RPC dispatch to the owning
//! module's server. The gate drives one processor per connection read
//! loop.

pub mod json;

pub use json::JsonProcessor;

use async_trait::async_trait;
use std::any::Any;

use crate::error::CodecError;

/// A decoded message travelling between codec and router.
pub type Message = Box<dyn Any + Send>;

/// Opaque per-connection context threaded through routing; in the
/// gate this is the connection's agent.
pub type UserData = Box<dyn Any + Send>;

/// Message codec plus identifier-keyed router.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Dispatch a decoded message. For a typed message this invokes
    /// the inline handler (if any) and fire-and-forgets the RPC
    /// dispatch (if a router is attached); raw messages go to the raw
    /// handler.
    async fn route(&self, msg: Message, user_data: UserData) -> Result<(), CodecError>;

    /// Decode one wire payload into a typed or raw message.
    fn decode(&self, data: &[u8]) -> Result<Message, CodecError>;

    /// Encode a typed message into wire buffers. Exactly one buffer is
    /// produced; the framing layer may not fragment it further.
    fn encode(&self, msg: &(dyn Any + Send)) -> Result<Vec<Vec<u8>>, CodecError>;
}
