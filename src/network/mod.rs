//! Network layer: transports, framing, listeners and dialers.
//!
//! Every accepted or dialed connection is wrapped in a connection
//! object owning a dedicated writer task that drains a bounded write
//! queue. The application supplies an [`Agent`] factory; the listener
//! or dialer runs each agent on its own task and tears the connection
//! down when the agent's read loop returns.

pub mod frame;
pub mod tcp_client;
pub mod tcp_conn;
pub mod tcp_server;
pub mod ws_client;
pub mod ws_conn;
pub mod ws_server;

pub use frame::FrameCodec;
pub use tcp_client::TcpClient;
pub use tcp_conn::TcpConn;
pub use tcp_server::TcpServer;
pub use ws_client::WsClient;
pub use ws_conn::WsConn;
pub use ws_server::WsServer;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::NetworkError;

/// A framed, bidirectional transport connection.
///
/// Reads pull whole application messages off the transport; writes
/// enqueue onto the connection's bounded write queue and never block.
/// Reads and writes may run concurrently on the same connection.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read the next application message. An error ends the caller's
    /// read loop; it does not tear down other connections.
    async fn read_msg(&self) -> Result<Vec<u8>, NetworkError>;

    /// Frame and enqueue a message given as one or more payload
    /// slices. If the write queue is full the connection is
    /// force-destroyed.
    fn write_msg(&self, parts: &[&[u8]]) -> Result<(), NetworkError>;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Graceful shutdown: lets the writer drain what is already queued,
    /// then closes the transport. Idempotent.
    fn close(&self);

    /// Immediate shutdown: discards unsent data (linger 0) and closes
    /// the transport. Idempotent.
    fn destroy(&self);
}

/// Per-connection handler supplied by the application.
///
/// `run` drives the read loop; the owning listener or dialer calls
/// `on_close` after the connection has been torn down.
#[async_trait]
pub trait Agent: Send {
    /// Called before the run task starts, still on the path that
    /// accepted or dialed the connection. On the TCP listener that is
    /// the single-threaded accept loop, so owner notifications keep
    /// accept order and a full owner queue throttles further accepts.
    async fn on_new(&mut self) {}

    async fn run(&mut self);

    async fn on_close(&mut self) {}
}

/// Initial delay after a transient accept error.
pub(crate) const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);

/// Backoff cap for repeated transient accept errors.
pub(crate) const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Whether an accept error is worth retrying. Anything else terminates
/// the accept loop.
pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Double a backoff delay, saturating at the cap.
pub(crate) fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        ACCEPT_BACKOFF_INITIAL
    } else {
        (current * 2).min(ACCEPT_BACKOFF_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut delay = Duration::ZERO;
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(5));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(10));
        for _ in 0..16 {
            delay = next_backoff(delay);
        }
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_accept_error(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::AddrInUse,
            "in use"
        )));
    }
}
