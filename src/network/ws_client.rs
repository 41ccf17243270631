//! WebSocket dialer pool with optional automatic reconnection.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::MaybeTlsStream;
use tracing::warn;
use uuid::Uuid;

use crate::network::ws_conn::{SocketHandle, WsConn};
use crate::network::ws_server::NewWsAgent;
use crate::network::{Agent, Conn};

const UNSPECIFIED: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);

/// Maintains `conn_num` persistent outbound WebSocket connections to
/// one `ws://` URL.
pub struct WsClient {
    pub addr: String,
    pub conn_num: usize,
    pub connect_interval: Duration,
    pub pending_write_num: usize,
    pub max_msg_len: u32,
    pub handshake_timeout: Duration,
    pub auto_reconnect: bool,

    new_agent: NewWsAgent,
    closed: Arc<AtomicBool>,
    conns: Arc<DashMap<Uuid, Arc<WsConn>>>,
    dialers: JoinSet<()>,
}

impl WsClient {
    pub fn new<F>(addr: impl Into<String>, new_agent: F) -> Self
    where
        F: Fn(Arc<WsConn>) -> Box<dyn Agent> + Send + Sync + 'static,
    {
        Self {
            addr: addr.into(),
            conn_num: 1,
            connect_interval: Duration::from_secs(3),
            pending_write_num: 100,
            max_msg_len: 4096,
            handshake_timeout: Duration::from_secs(10),
            auto_reconnect: false,
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
        if self.max_msg_len == 0 {
            self.max_msg_len = 4096;
            warn!("invalid max_msg_len, reset to {}", self.max_msg_len);
        }
        if self.handshake_timeout.is_zero() {
            self.handshake_timeout = Duration::from_secs(10);
            warn!(
                "invalid handshake_timeout, reset to {:?}",
                self.handshake_timeout
            );
        }
        self.closed.store(false, Ordering::SeqCst);

        for _ in 0..self.conn_num {
            self.dialers.spawn(dialer(
                self.addr.clone(),
                self.connect_interval,
                self.pending_write_num,
                self.max_msg_len,
                self.handshake_timeout,
                self.auto_reconnect,
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
    max_msg_len: u32,
    handshake_timeout: Duration,
    auto_reconnect: bool,
    new_agent: NewWsAgent,
    closed: Arc<AtomicBool>,
    conns: Arc<DashMap<Uuid, Arc<WsConn>>>,
) {
    loop {
        // Dial and upgrade until connected or shut down.
        let ws = loop {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let mut config = WebSocketConfig::default();
            config.max_message_size = Some(max_msg_len as usize);
            let attempt = tokio::time::timeout(
                handshake_timeout,
                tokio_tungstenite::connect_async_with_config(addr.as_str(), Some(config), false),
            )
            .await;
            match attempt {
                Ok(Ok((ws, _response))) => break ws,
                Ok(Err(e)) => warn!("connect to {} error: {}", addr, e),
                Err(_) => warn!("connect to {} error: handshake timeout", addr),
            }
            tokio::time::sleep(connect_interval).await;
        };

        if closed.load(Ordering::SeqCst) {
            return;
        }

        let (local_addr, peer_addr, socket_handle) = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => (
                tcp.local_addr().unwrap_or(UNSPECIFIED),
                tcp.peer_addr().unwrap_or(UNSPECIFIED),
                SocketHandle::from_tcp(tcp),
            ),
            _ => (UNSPECIFIED, UNSPECIFIED, SocketHandle::none()),
        };

        let conn = WsConn::new(
            ws,
            pending_write_num,
            max_msg_len,
            local_addr,
            peer_addr,
            socket_handle,
        );
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
