//! TCP dialer pool with optional automatic reconnection.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::network::frame::FrameCodec;
use crate::network::tcp_conn::TcpConn;
use crate::network::tcp_server::NewTcpAgent;
use crate::network::{Agent, Conn};

/// Maintains `conn_num` persistent outbound connections to one
/// address. Each dialer retries until it connects, runs its agent to
/// completion, and (with `auto_reconnect`) dials again.
pub struct TcpClient {
    pub addr: String,
    pub conn_num: usize,
    pub connect_interval: Duration,
    pub pending_write_num: usize,
    pub auto_reconnect: bool,

    // Frame codec parameters.
    pub len_msg_len: usize,
    pub min_msg_len: u32,
    pub max_msg_len: u32,
    pub little_endian: bool,

    new_agent: NewTcpAgent,
    closed: Arc<AtomicBool>,
    conns: Arc<DashMap<Uuid, Arc<TcpConn>>>,
    dialers: JoinSet<()>,
}

impl TcpClient {
    pub fn new<F>(addr: impl Into<String>, new_agent: F) -> Self
    where
        F: Fn(Arc<TcpConn>) -> Box<dyn Agent> + Send + Sync + 'static,
    {
        Self {
            addr: addr.into(),
            conn_num: 1,
            connect_interval: Duration::from_secs(3),
            pending_write_num: 100,
            auto_reconnect: false,
            len_msg_len: 2,
            min_msg_len: 1,
            max_msg_len: 4096,
            little_endian: false,
            new_agent: Arc::new(new_agent),
            closed: Arc::new(AtomicBool::new(false)),
            conns: Arc::new(DashMap::new()),
            dialers: JoinSet::new(),
        }
    }

    /// Spawn the dialer tasks.
    pub fn start(&mut self) {
        if self.conn_num == 0 {
            self.conn_num = 1;
            warn!("invalid conn_num, reset to {}", self.conn_num);
        }
        if self.connect_interval.is_zero() {
            self.connect_interval = Duration::from_secs(3);
            warn!("invalid connect_interval, reset to {:?}", self.connect_interval);
        }
        if self.pending_write_num == 0 {
            self.pending_write_num = 100;
            warn!(
                "invalid pending_write_num, reset to {}",
                self.pending_write_num
            );
        }
        self.closed.store(false, Ordering::SeqCst);

        let codec = Arc::new(FrameCodec::new(
            self.len_msg_len,
            self.min_msg_len,
            self.max_msg_len,
            self.little_endian,
        ));

        for _ in 0..self.conn_num {
            self.dialers.spawn(dialer(
                self.addr.clone(),
                self.connect_interval,
                self.pending_write_num,
                self.auto_reconnect,
                codec.clone(),
                self.new_agent.clone(),
                self.closed.clone(),
                self.conns.clone(),
            ));
        }
    }

    /// Stop dialing, close live connections and wait for the dialer
    /// tasks to return.
    pub async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.conns.iter() {
            entry.value().close();
        }
        self.conns.clear();
        while self.dialers.join_next().await.is_some() {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn dialer(
    addr: String,
    connect_interval: Duration,
    pending_write_num: usize,
    auto_reconnect: bool,
    codec: Arc<FrameCodec>,
    new_agent: NewTcpAgent,
    closed: Arc<AtomicBool>,
    conns: Arc<DashMap<Uuid, Arc<TcpConn>>>,
) {
    loop {
        // Dial until connected or shut down.
        let socket = loop {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            match TcpStream::connect(&addr).await {
                Ok(socket) => break socket,
                Err(e) => {
                    warn!("connect to {} error: {}", addr, e);
                    tokio::time::sleep(connect_interval).await;
                }
            }
        };

        if closed.load(Ordering::SeqCst) {
            return;
        }

        let conn = match TcpConn::new(socket, pending_write_num, codec.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                debug!("connection setup failed for {}: {}", addr, e);
                tokio::time::sleep(connect_interval).await;
                continue;
            }
        };

        let id = Uuid::new_v4();
        conns.insert(id, conn.clone());
        let mut agent = (new_agent)(conn.clone());
        agent.on_new().await;

        agent.run().await;

        conn.close();
        conns.remove(&id);
        agent.on_close().await;

        if !auto_reconnect || closed.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(connect_interval).await;
    }
}
