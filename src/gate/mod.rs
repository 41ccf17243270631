//! The gate: the server's network entry point.
//!
//! A gate listens on TCP and/or WebSocket, wraps every accepted
//! connection in a [`GateAgent`] driven by the configured
//! [`Processor`], and notifies the owning module over channel RPC:
//! fire-and-forget `"NewAgent"` on connect, synchronous `"CloseAgent"`
//! on teardown. Both carry the agent as their only argument, so the
//! owner can write back, stash per-player state in the agent's
//! user-data slot, or destroy the connection.

use async_trait::async_trait;
use std::any::Any;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::args;
use crate::codec::Processor;
use crate::config::GatewayConfig;
use crate::module::{CloseSig, Module};
use crate::network::{Agent, Conn, TcpConn, TcpServer, WsConn, WsServer};
use crate::rpc::ServerHandle;

/// Network entry module. Configure the public fields (or start from
/// [`Gate::from_config`]), attach a processor and the owning module's
/// RPC handle, then register it on the runtime like any other module.
pub struct Gate {
    pub max_conn_num: usize,
    pub pending_write_num: usize,
    pub max_msg_len: u32,
    pub processor: Option<Arc<dyn Processor>>,
    pub agent_rpc: Option<ServerHandle>,

    // WebSocket listener.
    pub ws_addr: Option<String>,
    pub http_timeout: Duration,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,

    // TCP listener.
    pub tcp_addr: Option<String>,
    pub min_msg_len: u32,
    pub len_msg_len: usize,
    pub little_endian: bool,
}

impl Default for Gate {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl Gate {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_conn_num: config.max_conn_num,
            pending_write_num: config.pending_write_num,
            max_msg_len: config.max_msg_len,
            processor: None,
            agent_rpc: None,
            ws_addr: config.ws_addr.clone(),
            http_timeout: Duration::from_millis(config.http_timeout_ms),
            cert_file: config.cert_file.clone().map(PathBuf::from),
            key_file: config.key_file.clone().map(PathBuf::from),
            tcp_addr: config.tcp_addr.clone(),
            min_msg_len: config.min_msg_len,
            len_msg_len: config.len_msg_len,
            little_endian: config.little_endian,
        }
    }

    fn agent_factory(&self) -> impl Fn(Arc<dyn Conn>) -> Box<dyn Agent> + Send + Sync + Clone {
        let processor = self.processor.clone();
        let agent_rpc = self.agent_rpc.clone();
        move |conn: Arc<dyn Conn>| {
            let agent = Arc::new(GateAgent {
                conn,
                processor: processor.clone(),
                rpc: agent_rpc.clone(),
                user_data: Mutex::new(None),
            });
            Box::new(GateAgentDriver { agent }) as Box<dyn Agent>
        }
    }

    /// Run both listeners until the close signal arrives, then shut
    /// them down in order.
    pub async fn run(&self, close_sig: &mut CloseSig) {
        let factory = self.agent_factory();

        let mut ws_server = None;
        if let Some(ws_addr) = &self.ws_addr {
            let factory = factory.clone();
            let mut server =
                WsServer::new(ws_addr.clone(), move |conn: Arc<WsConn>| factory(conn));
            server.max_conn_num = self.max_conn_num;
            server.pending_write_num = self.pending_write_num;
            server.max_msg_len = self.max_msg_len;
            server.http_timeout = self.http_timeout;
            server.cert_file = self.cert_file.clone();
            server.key_file = self.key_file.clone();

            match server.start().await {
                Ok(addr) => {
                    info!("gate listening on ws://{}", addr);
                    ws_server = Some(server);
                }
                Err(e) => {
                    error!("gate websocket bind {} error: {}", ws_addr, e);
                    return;
                }
            }
        }

        let mut tcp_server = None;
        if let Some(tcp_addr) = &self.tcp_addr {
            let factory = factory.clone();
            let mut server =
                TcpServer::new(tcp_addr.clone(), move |conn: Arc<TcpConn>| factory(conn));
            server.max_conn_num = self.max_conn_num;
            server.pending_write_num = self.pending_write_num;
            server.len_msg_len = self.len_msg_len;
            server.min_msg_len = self.min_msg_len;
            server.max_msg_len = self.max_msg_len;
            server.little_endian = self.little_endian;

            match server.start().await {
                Ok(addr) => {
                    info!("gate listening on tcp://{}", addr);
                    tcp_server = Some(server);
                }
                Err(e) => {
                    error!("gate tcp bind {} error: {}", tcp_addr, e);
                    if let Some(mut server) = ws_server {
                        server.close().await;
                    }
                    return;
                }
            }
        }

        close_sig.recv().await;

        if let Some(mut server) = ws_server {
            server.close().await;
        }
        if let Some(mut server) = tcp_server {
            server.close().await;
        }
    }
}

#[async_trait]
impl Module for Gate {
    async fn run(&mut self, close_sig: &mut CloseSig) {
        Gate::run(self, close_sig).await;
    }
}

/// Per-connection handler created by the gate. The owning module
/// receives it as the argument of `"NewAgent"` / `"CloseAgent"` calls
/// (as an `Arc<GateAgent>`) and keeps it for as long as it wants to
/// address this player.
pub struct GateAgent {
    conn: Arc<dyn Conn>,
    processor: Option<Arc<dyn Processor>>,
    rpc: Option<ServerHandle>,
    user_data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl GateAgent {
    async fn run_loop(self: Arc<Self>) {
        loop {
            let data = match self.conn.read_msg().await {
                Ok(data) => data,
                Err(e) => {
                    debug!("read message: {}", e);
                    break;
                }
            };

            if let Some(processor) = &self.processor {
                let msg = match processor.decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("decode message error: {}", e);
                        break;
                    }
                };
                if let Err(e) = processor.route(msg, Box::new(self.clone())).await {
                    debug!("route message error: {}", e);
                    break;
                }
            }
        }
    }

    /// Encode `msg` with the gate's processor and enqueue it for this
    /// connection. Encoding and write failures are logged, not
    /// surfaced; the read loop notices a dead connection soon enough.
    pub fn write_msg(&self, msg: &(dyn Any + Send)) {
        let Some(processor) = &self.processor else {
            return;
        };
        match processor.encode(msg) {
            Ok(bufs) => {
                let parts: Vec<&[u8]> = bufs.iter().map(|b| b.as_slice()).collect();
                if let Err(e) = self.conn.write_msg(&parts) {
                    error!("write message error: {}", e);
                }
            }
            Err(e) => error!("encode message error: {}", e),
        }
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.conn.remote_addr()
    }

    /// Graceful connection shutdown.
    pub fn close(&self) {
        self.conn.close();
    }

    /// Immediate connection teardown.
    pub fn destroy(&self) {
        self.conn.destroy();
    }

    /// The agent's single opaque user-data slot, typically the player
    /// record the owning module binds after authentication.
    pub fn user_data(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.user_data.lock().unwrap()
    }

    pub fn set_user_data(&self, data: Box<dyn Any + Send>) {
        *self.user_data.lock().unwrap() = Some(data);
    }
}

/// Adapter running a shared [`GateAgent`] as the listener's owned
/// agent.
struct GateAgentDriver {
    agent: Arc<GateAgent>,
}

#[async_trait]
impl Agent for GateAgentDriver {
    async fn on_new(&mut self) {
        if let Some(rpc) = &self.agent.rpc {
            rpc.go("NewAgent", args![self.agent.clone()]).await;
        }
    }

    async fn run(&mut self) {
        self.agent.clone().run_loop().await;
    }

    async fn on_close(&mut self) {
        if let Some(rpc) = &self.agent.rpc {
            if let Err(e) = rpc.call0("CloseAgent", args![self.agent.clone()]).await {
                error!("rpc error: {}", e);
            }
        }
    }
}
