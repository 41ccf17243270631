//! # Trellis - Modular Game Server Framework
//!
//! A concurrent game-server framework that multiplexes many client
//! connections (TCP and WebSocket) onto a small set of long-running
//! logical modules, and lets those modules talk to each other through
//! typed in-process RPC over bounded channels.
//!
//! ## Architecture Overview
//!
//! * **Network gateway** ([`gate`], [`network`]) - listeners and
//!   dialers, length-framed TCP and binary WebSocket transports, one
//!   writer task per connection with a bounded write queue, and agent
//!   binding.
//! * **Channel RPC** ([`rpc`]) - a request/response discipline over
//!   bounded queues with synchronous, asynchronous-with-callback and
//!   fire-and-forget call modes.
//! * **Module runloops** ([`module`]) - each module runs a
//!   single-task event loop ([`module::Skeleton`]) that serializes RPC
//!   service, async replies, timer expirations and job completions.
//! * **Timers and cron** ([`timer`]) - one-shot timers and
//!   crontab-style schedules fanned into the owning module's runloop.
//! * **Message codecs** ([`codec`]) - a JSON envelope codec routing
//!   decoded messages to handlers or straight onto a module's RPC
//!   queue.
//!
//! ## Message Flow
//!
//! 1. A listener accepts a transport connection and wraps it in a
//!    connection object with its own writer task.
//! 2. The gate builds an agent for the connection and notifies the
//!    owning module (`"NewAgent"` over channel RPC).
//! 3. The agent read loop decodes each frame with the configured
//!    [`codec::Processor`] and routes it to an inline handler or
//!    fire-and-forget RPC onto the owning module's request queue.
//! 4. The module's [`module::Skeleton`] drains RPC calls, timer
//!    firings, async results and job callbacks from a single select,
//!    executing them serially.
//!
//! ## Concurrency Model
//!
//! Tasks everywhere, but single-threaded semantics *inside* each
//! module: cross-module interaction is always mediated by channel RPC,
//! and per-connection isolation comes from the dedicated writer tasks.
//! Writes reach the wire in enqueue order; a server's requests execute
//! in enqueue order; no runloop event preempts another.

pub mod codec;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod module;
pub mod network;
pub mod rpc;
pub mod timer;

mod panics;

pub use codec::{JsonProcessor, Processor};
pub use config::GatewayConfig;
pub use error::{CodecError, CronParseError, FrameError, NetworkError, RpcError};
pub use gate::{Gate, GateAgent};
pub use module::{CloseSig, Module, Runtime, Skeleton, SkeletonOptions};
pub use network::{Agent, Conn, FrameCodec, TcpClient, TcpConn, TcpServer, WsClient, WsConn, WsServer};
pub use timer::CronExpr;
