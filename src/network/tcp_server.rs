//! TCP listener with a connection set and per-agent tasks.

use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::network::frame::FrameCodec;
use crate::network::tcp_conn::TcpConn;
use crate::network::{is_transient_accept_error, next_backoff, Agent, Conn};

/// Factory invoked for every accepted connection.
pub type NewTcpAgent = Arc<dyn Fn(Arc<TcpConn>) -> Box<dyn Agent> + Send + Sync>;

/// A TCP listener that multiplexes accepted connections onto
/// application agents.
///
/// Fields are adjusted freely between construction and [`start`];
/// invalid values are reset to defaults with a warning, mirroring the
/// gateway's tolerant configuration policy.
///
/// [`start`]: TcpServer::start
pub struct TcpServer {
    pub addr: String,
    pub max_conn_num: usize,
    pub pending_write_num: usize,

    // Frame codec parameters.
    pub len_msg_len: usize,
    pub min_msg_len: u32,
    pub max_msg_len: u32,
    pub little_endian: bool,

    new_agent: NewTcpAgent,
    shutdown: Arc<Notify>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    pub fn new<F>(addr: impl Into<String>, new_agent: F) -> Self
    where
        F: Fn(Arc<TcpConn>) -> Box<dyn Agent> + Send + Sync + 'static,
    {
        Self {
            addr: addr.into(),
            max_conn_num: 100,
            pending_write_num: 100,
            len_msg_len: 2,
            min_msg_len: 1,
            max_msg_len: 4096,
            little_endian: false,
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

        let codec = Arc::new(FrameCodec::new(
            self.len_msg_len,
            self.min_msg_len,
            self.max_msg_len,
            self.little_endian,
        ));

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            codec,
            self.new_agent.clone(),
            self.max_conn_num,
            self.pending_write_num,
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
    codec: Arc<FrameCodec>,
    new_agent: NewTcpAgent,
    max_conn_num: usize,
    pending_write_num: usize,
    shutdown: Arc<Notify>,
) {
    let conns: Arc<DashMap<Uuid, Arc<TcpConn>>> = Arc::new(DashMap::new());
    let mut agent_tasks = JoinSet::new();
    let mut delay = std::time::Duration::ZERO;

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
        delay = std::time::Duration::ZERO;

        if conns.len() >= max_conn_num {
            drop(socket);
            debug!("too many connections");
            continue;
        }

        spawn_agent(
            socket,
            peer,
            &codec,
            &new_agent,
            pending_write_num,
            &conns,
            &mut agent_tasks,
        )
        .await;
    }

    drop(listener);
    for entry in conns.iter() {
        entry.value().close();
    }
    while agent_tasks.join_next().await.is_some() {}
}

async fn spawn_agent(
    socket: TcpStream,
    peer: SocketAddr,
    codec: &Arc<FrameCodec>,
    new_agent: &NewTcpAgent,
    pending_write_num: usize,
    conns: &Arc<DashMap<Uuid, Arc<TcpConn>>>,
    agent_tasks: &mut JoinSet<()>,
) {
    let conn = match TcpConn::new(socket, pending_write_num, codec.clone()) {
        Ok(conn) => conn,
        Err(e) => {
            debug!("connection setup failed for {}: {}", peer, e);
            return;
        }
    };

    let id = Uuid::new_v4();
    conns.insert(id, conn.clone());
    let mut agent = (new_agent)(conn.clone());
    let conns = conns.clone();

    // Runs on the accept loop itself, before the run task exists.
    agent.on_new().await;

    agent_tasks.spawn(async move {
        agent.run().await;

        conn.close();
        conns.remove(&id);
        agent.on_close().await;
    });
}
