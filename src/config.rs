//! Gateway configuration structures and process-wide knobs.
//!
//! Configuration *loading* (files, CLI) is the application's concern;
//! this module only defines the serde-friendly structures the gateway
//! consumes, plus the process-wide stack-trace length used when
//! formatting handler panics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of bytes of backtrace appended when a recovered panic
/// is formatted into an error or log line. Zero disables the trace.
static STACK_TRACE_LEN: AtomicUsize = AtomicUsize::new(4096);

/// Set the process-wide panic-trace length in bytes (0 disables).
pub fn set_stack_trace_len(len: usize) {
    STACK_TRACE_LEN.store(len, Ordering::Relaxed);
}

/// Current process-wide panic-trace length in bytes.
pub fn stack_trace_len() -> usize {
    STACK_TRACE_LEN.load(Ordering::Relaxed)
}

/// Gateway configuration.
///
/// Covers both listeners of a gate: the TCP listener with its length
/// prefix parameters and the WebSocket listener with its HTTP upgrade
/// parameters. Either address may be omitted to disable that listener.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GatewayConfig {
    /// TCP bind address (e.g. "0.0.0.0:3563"). None disables TCP.
    pub tcp_addr: Option<String>,

    /// WebSocket bind address (e.g. "0.0.0.0:3653"). None disables WS.
    pub ws_addr: Option<String>,

    /// Maximum live connections per listener.
    pub max_conn_num: usize,

    /// Per-connection write queue capacity. A full queue force-destroys
    /// the connection.
    pub pending_write_num: usize,

    /// Maximum application message length in bytes.
    pub max_msg_len: u32,

    /// Minimum application message length in bytes (TCP framing).
    pub min_msg_len: u32,

    /// Width of the TCP length prefix in bytes: 1, 2 or 4.
    pub len_msg_len: usize,

    /// Little-endian length prefix; big-endian when false.
    pub little_endian: bool,

    /// HTTP handshake / read / write timeout for the WebSocket
    /// listener, in milliseconds.
    pub http_timeout_ms: u64,

    /// Certificate path for the WebSocket listener. Exposed for
    /// deployments that terminate TLS in front of the gate.
    pub cert_file: Option<String>,

    /// Private key path, paired with `cert_file`.
    pub key_file: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tcp_addr: None,
            ws_addr: None,
            max_conn_num: 100,
            pending_write_num: 100,
            max_msg_len: 4096,
            min_msg_len: 1,
            len_msg_len: 2,
            little_endian: false,
            http_timeout_ms: 10_000,
            cert_file: None,
            key_file: None,
        }
    }
}
