//! End-to-end tests over real loopback sockets: listeners, dialers,
//! the gate, message routing and the connection backpressure policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use trellis::module::{CloseSig, Module, Skeleton, SkeletonOptions};
use trellis::network::{Agent, Conn, FrameCodec, TcpClient, TcpConn, TcpServer, WsClient, WsServer};
use trellis::rpc;
use trellis::{Gate, GateAgent, JsonProcessor};

const WAIT: Duration = Duration::from_secs(5);

/// Echoes every message back on the same connection.
struct EchoAgent {
    conn: Arc<dyn Conn>,
}

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&mut self) {
        while let Ok(data) = self.conn.read_msg().await {
            let _ = self.conn.write_msg(&[&data]);
        }
    }
}

/// Sends one message, reports the echoed reply, then hangs up.
struct PingAgent {
    conn: Arc<dyn Conn>,
    reply_tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl Agent for PingAgent {
    async fn run(&mut self) {
        self.conn.write_msg(&[b"ping"]).unwrap();
        if let Ok(reply) = self.conn.read_msg().await {
            let _ = self.reply_tx.send(reply).await;
        }
        self.conn.close();
    }
}

#[tokio::test]
async fn test_tcp_echo_round_trip() {
    let mut server = TcpServer::new("127.0.0.1:0", |conn: Arc<TcpConn>| {
        Box::new(EchoAgent { conn }) as Box<dyn Agent>
    });
    let addr = server.start().await.unwrap();

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    let mut client = TcpClient::new(addr.to_string(), move |conn: Arc<TcpConn>| {
        Box::new(PingAgent {
            conn,
            reply_tx: reply_tx.clone(),
        }) as Box<dyn Agent>
    });
    client.start();

    let reply = timeout(WAIT, reply_rx.recv()).await.unwrap().unwrap();
    assert_eq!(reply, b"ping");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_ws_echo_round_trip() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let mut server = WsServer::new("127.0.0.1:0", |conn: Arc<trellis::WsConn>| {
        Box::new(EchoAgent { conn }) as Box<dyn Agent>
    });
    let addr = server.start().await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    ws.send(Message::Binary(b"marco".to_vec())).await.unwrap();

    let reply = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => break data,
                Some(Ok(_)) => continue,
                other => panic!("unexpected websocket event: {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reply, b"marco");

    ws.close(None).await.unwrap();
    server.close().await;
}

#[tokio::test]
async fn test_ws_listener_enforces_max_conn_num() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let mut server = WsServer::new("127.0.0.1:0", |conn: Arc<trellis::WsConn>| {
        Box::new(EchoAgent { conn }) as Box<dyn Agent>
    });
    server.max_conn_num = 1;
    let addr = server.start().await.unwrap();

    let (mut first, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    // Give the first upgrade time to claim the only slot.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut second, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    // The over-capacity connection is refused with a clean close
    // frame, not an abrupt reset.
    let refusal = timeout(WAIT, second.next()).await.unwrap();
    assert!(matches!(refusal, Some(Ok(Message::Close(_))) | None));

    // The admitted connection still echoes.
    first.send(Message::Binary(b"hi".to_vec())).await.unwrap();
    let echoed = timeout(WAIT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Binary(data))) => break data,
                Some(Ok(_)) => continue,
                other => panic!("unexpected websocket event: {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(echoed, b"hi");

    server.close().await;
}

#[tokio::test]
async fn test_ws_client_dials_and_round_trips() {
    let mut server = WsServer::new("127.0.0.1:0", |conn: Arc<trellis::WsConn>| {
        Box::new(EchoAgent { conn }) as Box<dyn Agent>
    });
    let addr = server.start().await.unwrap();

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    let mut client = WsClient::new(
        format!("ws://{}", addr),
        move |conn: Arc<trellis::WsConn>| {
            Box::new(PingAgent {
                conn,
                reply_tx: reply_tx.clone(),
            }) as Box<dyn Agent>
        },
    );
    client.start();

    let reply = timeout(WAIT, reply_rx.recv()).await.unwrap().unwrap();
    assert_eq!(reply, b"ping");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_listener_enforces_max_conn_num() {
    let mut server = TcpServer::new("127.0.0.1:0", |conn: Arc<TcpConn>| {
        Box::new(EchoAgent { conn }) as Box<dyn Agent>
    });
    server.max_conn_num = 1;
    let addr = server.start().await.unwrap();

    let mut first = TcpStream::connect(addr).await.unwrap();
    // Give the accept loop time to register the first connection.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    // The over-capacity connection is closed without an agent: its
    // read completes with EOF.
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, second.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    // The first connection still echoes.
    first.write_all(&[0x00, 0x02, 0x68, 0x69]).await.unwrap();
    let mut echo = [0u8; 4];
    timeout(WAIT, first.read_exact(&mut echo))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echo, [0x00, 0x02, 0x68, 0x69]);

    server.close().await;
}

#[tokio::test]
async fn test_full_write_queue_destroys_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let outbound = TcpStream::connect(addr).await.unwrap();
    let (inbound, _) = listener.accept().await.unwrap();

    // Queue capacity 1, and the peer never reads: the writer task
    // stalls on the first buffer, the second fills the queue, the
    // third must force-destroy the connection.
    let conn = TcpConn::new(outbound, 1, Arc::new(FrameCodec::default())).unwrap();
    let big = vec![0u8; 8 * 1024 * 1024];

    conn.write(big.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.write(big.clone());
    conn.write(big.clone());

    // The transport was shut down, so the read side fails promptly.
    let result = timeout(WAIT, conn.read_msg()).await.unwrap();
    assert!(result.is_err());

    drop(inbound);
}

// ---------------------------------------------------------------------------
// Gate end-to-end: frame -> JSON envelope -> RPC to a skeleton module.
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct Hello {
    name: String,
}

/// Game logic module: greets every Hello and tracks agent lifecycle.
struct GameModule {
    skeleton: Skeleton,
}

#[async_trait]
impl Module for GameModule {
    async fn run(&mut self, close_sig: &mut CloseSig) {
        self.skeleton.run(close_sig).await;
    }
}

fn free_port() -> std::net::SocketAddr {
    // Bind-and-drop to pick a free ephemeral port for the gate.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_gate_routes_to_module_and_back() {
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));

    // The game module's RPC surface.
    let server = rpc::Server::new(64);
    let counter = connects.clone();
    server.register(
        "NewAgent",
        rpc::Function::no_ret(move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let counter = disconnects.clone();
    server.register(
        "CloseAgent",
        rpc::Function::no_ret(move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    server.register(
        "Hello",
        rpc::Function::no_ret(|args| {
            let hello = args[0].downcast_ref::<Hello>().unwrap();
            let agent = args[1].downcast_ref::<Arc<GateAgent>>().unwrap();
            agent.write_msg(&Hello {
                name: format!("hi {}", hello.name),
            });
        }),
    );
    let handle = server.handle();

    let mut processor = JsonProcessor::new();
    processor.register::<Hello>();
    processor.set_router::<Hello>(handle.clone());

    let game = GameModule {
        skeleton: Skeleton::new(SkeletonOptions {
            go_len: 8,
            timer_dispatcher_len: 8,
            asyn_call_len: 8,
            server: Some(server),
        }),
    };

    let gate_addr = free_port();
    let mut gate = Gate::default();
    gate.tcp_addr = Some(gate_addr.to_string());
    gate.processor = Some(Arc::new(processor));
    gate.agent_rpc = Some(handle);

    let mut runtime = trellis::Runtime::new();
    runtime.register("game", game);
    runtime.register("gate", gate);
    runtime.init().await;

    // Speak the wire protocol directly: 2-byte big-endian length
    // prefix around a one-key JSON envelope.
    let mut stream = {
        let mut attempt = 0;
        loop {
            match TcpStream::connect(gate_addr).await {
                Ok(stream) => break stream,
                Err(_) if attempt < 50 => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("gate never came up: {}", e),
            }
        }
    };

    let payload = br#"{"Hello":{"name":"world"}}"#;
    let mut frame = Vec::new();
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();

    let mut header = [0u8; 2];
    timeout(WAIT, stream.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    let len = u16::from_be_bytes(header) as usize;
    let mut reply = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();

    let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(value, serde_json::json!({"Hello": {"name": "hi world"}}));
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // Disconnect and let the gate report CloseAgent.
    drop(stream);
    timeout(WAIT, async {
        while disconnects.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    runtime.destroy().await;
}
