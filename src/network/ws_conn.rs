//! WebSocket connection with an asynchronous write pipeline.
//!
//! Framing is the WebSocket binary message boundary itself; no length
//! prefix is added. The write side mirrors the TCP connection: one
//! writer task per connection draining a bounded queue, with the empty
//! buffer reserved as the shutdown sentinel.

use futures::stream::{SplitSink, Stream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::{FrameError, NetworkError};
use crate::network::Conn;

type WsResult = Result<Message, tokio_tungstenite::tungstenite::Error>;
type BoxedReader = Box<dyn Stream<Item = WsResult> + Send + Unpin>;

/// Handle onto the raw socket underneath a WebSocket stream, kept for
/// forced teardown after the stream has been split.
pub(crate) struct SocketHandle {
    #[cfg(unix)]
    fd: Option<std::os::fd::OwnedFd>,
}

impl SocketHandle {
    /// No raw socket available (TLS client streams, non-unix hosts).
    /// Forced teardown degrades to closing the write queue.
    pub(crate) fn none() -> Self {
        Self {
            #[cfg(unix)]
            fd: None,
        }
    }

    pub(crate) fn from_tcp(stream: &TcpStream) -> Self {
        #[cfg(unix)]
        {
            use std::os::fd::AsFd;
            Self {
                fd: stream.as_fd().try_clone_to_owned().ok(),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = stream;
            Self::none()
        }
    }

    /// Linger-0 shutdown of the raw socket: unsent data is discarded
    /// and any blocked read returns immediately.
    fn force_shutdown(&self) {
        #[cfg(unix)]
        if let Some(fd) = &self.fd {
            let sock = socket2::SockRef::from(fd);
            let _ = sock.set_linger(Some(std::time::Duration::ZERO));
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
    }
}

struct ConnState {
    closed: bool,
    write_tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// A WebSocket connection carrying binary application messages.
pub struct WsConn {
    reader: tokio::sync::Mutex<BoxedReader>,
    state: Arc<Mutex<ConnState>>,
    socket: SocketHandle,
    max_msg_len: u32,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl WsConn {
    pub(crate) fn new<S>(
        ws: WebSocketStream<S>,
        pending_write_num: usize,
        max_msg_len: u32,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        socket: SocketHandle,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(pending_write_num.max(1));
        let state = Arc::new(Mutex::new(ConnState {
            closed: false,
            write_tx: Some(write_tx),
        }));

        tokio::spawn(writer_task(sink, write_rx, state.clone()));

        Arc::new(Self {
            reader: tokio::sync::Mutex::new(Box::new(stream)),
            state,
            socket,
            max_msg_len,
            local_addr,
            peer_addr,
        })
    }

    fn do_write(&self, state: &mut ConnState, b: Vec<u8>) {
        let Some(tx) = state.write_tx.as_ref() else {
            return;
        };
        match tx.try_send(b) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("close conn: write queue full");
                self.do_destroy(state);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn do_destroy(&self, state: &mut ConnState) {
        self.socket.force_shutdown();
        if !state.closed {
            state.write_tx = None;
            state.closed = true;
        }
    }
}

async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    state: Arc<Mutex<ConnState>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(b) = write_rx.recv().await {
        if b.is_empty() {
            break;
        }
        if sink.send(Message::Binary(b)).await.is_err() {
            break;
        }
    }

    let _ = sink.close().await;
    state.lock().unwrap().closed = true;
}

#[async_trait::async_trait]
impl Conn for WsConn {
    async fn read_msg(&self) -> Result<Vec<u8>, NetworkError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                None => return Err(NetworkError::Closed),
                Some(Err(e)) => return Err(NetworkError::WebSocket(e)),
                Some(Ok(Message::Binary(b))) => return Ok(b),
                Some(Ok(Message::Close(_))) => return Err(NetworkError::Closed),
                // Control and text frames are not application messages.
                Some(Ok(_)) => continue,
            }
        }
    }

    fn write_msg(&self, parts: &[&[u8]]) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }

        let mut msg_len: u32 = 0;
        for part in parts {
            msg_len = msg_len.saturating_add(part.len() as u32);
        }
        if msg_len > self.max_msg_len {
            return Err(FrameError::TooLong.into());
        }
        if msg_len < 1 {
            return Err(FrameError::TooShort.into());
        }

        // Single part goes out as-is; multiple parts are merged into
        // one binary frame.
        if parts.len() == 1 {
            self.do_write(&mut state, parts[0].to_vec());
            return Ok(());
        }

        let mut buf = Vec::with_capacity(msg_len as usize);
        for part in parts {
            buf.extend_from_slice(part);
        }
        self.do_write(&mut state, buf);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        self.do_write(&mut state, Vec::new());
        state.closed = true;
    }

    fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        self.do_destroy(&mut state);
    }
}
