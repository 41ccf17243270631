//! WebSocket listener: HTTP upgrade instead of raw accept, otherwise
//! identical in shape to the TCP path.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::network::ws_conn::{SocketHandle, WsConn};
use crate::network::{is_transient_accept_error, next_backoff, Agent, Conn};

/// Factory invoked for every upgraded connection.
pub type NewWsAgent = Arc<dyn Fn(Arc<WsConn>) -> Box<dyn Agent> + Send + Sync>;

/// Connection set shared by the concurrently-upgrading connection
/// tasks. One mutex covers both the capacity check and the insert, so
/// simultaneous handshakes cannot overshoot the cap.
type ConnSet = Arc<Mutex<HashMap<Uuid, Arc<WsConn>>>>;

/// A WebSocket listener that upgrades inbound HTTP connections and
/// multiplexes them onto application agents.
pub struct WsServer {
    pub addr: String,
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub max_msg_len: u32,

    /// Handshake deadline for the HTTP upgrade.
    pub http_timeout: Duration,

    /// Certificate/key paths for deployments that terminate TLS in
    /// front of the gate; the listener itself speaks plain TCP.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,

    new_agent: NewWsAgent,
    shutdown: Arc<Notify>,
    accept_task: Option<JoinHandle<()>>,
}

impl WsServer {
    pub fn new<F>(addr: impl Into<String>, new_agent: F) -> Self
    where
        F: Fn(Arc<WsConn>) -> Box<dyn Agent> + Send + Sync + 'static,
    {
        Self {
            addr: addr.into(),
            max_conn_num: 100,
            pending_write_num: 100,
            max_msg_len: 4096,
            http_timeout: Duration::from_secs(10),
            cert_file: None,
            key_file: None,
            new_agent: Arc::new(new_agent),
            shutdown: Arc::new(Notify::new()),
            accept_task: None,
        }
    }

    /// Bind and start the accept loop. Returns the bound address so
    /// callers can use an ephemeral port.
    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr).await?;
        let bound = listener.local_addr()?;

        if self.max_conn_num == 0 {
            self.max_conn_num = 100;
            warn!("invalid max_conn_num, reset to {}", self.max_conn_num);
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
        if self.http_timeout.is_zero() {
            self.http_timeout = Duration::from_secs(10);
            warn!("invalid http_timeout, reset to {:?}", self.http_timeout);
        }
        if self.cert_file.is_some() || self.key_file.is_some() {
            warn!("cert_file/key_file set: TLS must be terminated in front of the gate");
        }

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            self.new_agent.clone(),
            self.max_conn_num,
            self.pending_write_num,
            self.max_msg_len,
            self.http_timeout,
            self.shutdown.clone(),
        )));
        Ok(bound)
    }

    /// Stop accepting, close every tracked connection and wait for all
    /// per-connection tasks to finish.
    pub async fn close(&mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    new_agent: NewWsAgent,
    max_conn_num: usize,
    pending_write_num: usize,
    max_msg_len: u32,
    http_timeout: Duration,
    shutdown: Arc<Notify>,
) {
    let conns: ConnSet = Arc::new(Mutex::new(HashMap::new()));
    let mut agent_tasks = JoinSet::new();
    let mut delay = Duration::ZERO;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) if is_transient_accept_error(&e) => {
                delay = next_backoff(delay);
                warn!("accept error: {}; retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(e) => {
                warn!("accept error: {}; closing listener", e);
                break;
            }
        };
        delay = Duration::ZERO;

        let new_agent = new_agent.clone();
        let conns = conns.clone();
        agent_tasks.spawn(serve_connection(
            socket,
            peer,
            new_agent,
            conns,
            max_conn_num,
            pending_write_num,
            max_msg_len,
            http_timeout,
        ));
    }

    drop(listener);
    for conn in conns.lock().unwrap().values() {
        conn.close();
    }
    while agent_tasks.join_next().await.is_some() {}
}

#[allow(clippy::too_many_arguments)]
async fn serve_connection(
    socket: TcpStream,
    peer: SocketAddr,
    new_agent: NewWsAgent,
    conns: ConnSet,
    max_conn_num: usize,
    pending_write_num: usize,
    max_msg_len: u32,
    http_timeout: Duration,
) {
    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!("connection setup failed for {}: {}", peer, e);
            return;
        }
    };
    let socket_handle = SocketHandle::from_tcp(&socket);

    // The per-connection read-byte limit doubles as the framing bound:
    // one binary message is one application message.
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_msg_len as usize);

    let ws = match tokio::time::timeout(
        http_timeout,
        tokio_tungstenite::accept_async_with_config(socket, Some(config)),
    )
    .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("upgrade error for {}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("upgrade timeout for {}", peer);
            return;
        }
    };

    let conn = WsConn::new(
        ws,
        pending_write_num,
        max_msg_len,
        local_addr,
        peer,
        socket_handle,
    );

    // Capacity check and insert happen under one lock: handshakes run
    // concurrently, and the set must never overshoot max_conn_num.
    let id = Uuid::new_v4();
    let admitted = {
        let mut conns = conns.lock().unwrap();
        if conns.len() >= max_conn_num {
            false
        } else {
            conns.insert(id, conn.clone());
            true
        }
    };
    if !admitted {
        debug!("too many connections");
        // Graceful rejection: the writer task sends a close frame.
        conn.close();
        return;
    }

    let mut agent = (new_agent)(conn.clone());
    agent.on_new().await;

    agent.run().await;

    conn.close();
    conns.lock().unwrap().remove(&id);
    agent.on_close().await;
}
