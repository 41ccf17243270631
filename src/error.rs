//! Error types for the framework's subsystems.
//!
//! Each subsystem surfaces its own error enum: framing, message codec,
//! channel RPC, cron parsing, and the network layer. Registration-time
//! misuse (duplicate ids, wrong handler shapes, missing agent factory)
//! is not represented here: it panics, since it is a programming error
//! that must be fixed before the server can run.

use std::io;
use thiserror::Error;

/// Errors produced by the length-prefix frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum length.
    #[error("message too long")]
    TooLong,

    /// The payload is below the configured minimum length.
    #[error("message too short")]
    TooShort,

    /// The transport failed mid-frame (a short read maps to
    /// `io::ErrorKind::UnexpectedEof`).
    #[error("read message: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the message codec and router.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The wire identifier has no registered descriptor.
    #[error("message {0} not registered")]
    UnknownMessage(String),

    /// The message value's type was never registered.
    #[error("message type not registered")]
    UnknownType,

    /// The envelope was not a one-key object.
    #[error("invalid message envelope")]
    InvalidEnvelope,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by channel RPC calls and callbacks.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The client has no attached server.
    #[error("server not attached")]
    NotAttached,

    /// No function is registered under the call id.
    #[error("function id {0}: function not registered")]
    NotRegistered(String),

    /// The registered function's shape does not match the call variant.
    #[error("function id {0}: return type mismatch")]
    ShapeMismatch(String),

    /// The server's request queue was full (asynchronous path only).
    #[error("rpc channel full")]
    ChannelFull,

    /// The server closed before the call could complete.
    #[error("rpc server closed")]
    ServerClosed,

    /// The client's async-reply queue is at capacity.
    #[error("too many calls")]
    TooManyCalls,

    /// The handler panicked; the message carries the formatted panic
    /// with a length-capped stack trace.
    #[error("handler panic: {0}")]
    HandlerPanic(String),
}

/// Errors from parsing a crontab-style expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 or 6 fields, got {0}")]
    FieldCount(usize),

    #[error("too many slashes: {0}")]
    TooManySlashes(String),

    #[error("too many hyphens: {0}")]
    TooManyHyphens(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("out of range [{min}, {max}]: {term}")]
    OutOfRange { min: u32, max: u32, term: String },

    #[error("invalid increment: {0}")]
    InvalidIncrement(String),
}

/// Errors surfaced by connection reads and writes.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,
}
