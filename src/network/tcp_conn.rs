//! TCP connection with an asynchronous write pipeline.
//!
//! The socket is shared between the agent's read loop and a dedicated
//! writer task draining a bounded queue, so writes never block the
//! producer. An empty buffer on the queue is the cooperative shutdown
//! sentinel.

use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::error::NetworkError;
use crate::network::frame::FrameCodec;
use crate::network::Conn;

/// `AsyncRead` over a shared socket. Only the agent's read loop uses
/// it (behind an async mutex), while the writer task owns the write
/// direction of the same stream.
struct SharedReader(Arc<TcpStream>);

impl AsyncRead for SharedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match self.0.try_read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready!(self.0.poll_read_ready(cx))?;
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

async fn write_full(stream: &TcpStream, buf: &[u8]) -> io::Result<()> {
    let mut remaining = buf;
    while !remaining.is_empty() {
        stream.writable().await?;
        match stream.try_write(remaining) {
            Ok(n) => remaining = &remaining[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

struct ConnState {
    closed: bool,
    /// Sender side of the write queue. Dropped on destroy so the
    /// writer task observes the queue closing.
    write_tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// A framed TCP connection. Producers enqueue; the writer task is the
/// sole consumer of the queue and the sole writer of the socket.
pub struct TcpConn {
    stream: Arc<TcpStream>,
    reader: tokio::sync::Mutex<SharedReader>,
    state: Arc<Mutex<ConnState>>,
    codec: Arc<FrameCodec>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TcpConn {
    /// Wrap an established stream and start its writer task.
    pub fn new(
        stream: TcpStream,
        pending_write_num: usize,
        codec: Arc<FrameCodec>,
    ) -> io::Result<Arc<Self>> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let stream = Arc::new(stream);
        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(pending_write_num.max(1));
        let state = Arc::new(Mutex::new(ConnState {
            closed: false,
            write_tx: Some(write_tx),
        }));

        let conn = Arc::new(Self {
            stream: stream.clone(),
            reader: tokio::sync::Mutex::new(SharedReader(stream.clone())),
            state: state.clone(),
            codec,
            local_addr,
            peer_addr,
        });

        tokio::spawn(async move {
            while let Some(b) = write_rx.recv().await {
                if b.is_empty() {
                    // Graceful-close sentinel.
                    break;
                }
                if write_full(&stream, &b).await.is_err() {
                    break;
                }
            }

            let _ = SockRef::from(&*stream).shutdown(Shutdown::Both);
            state.lock().unwrap().closed = true;
        });

        Ok(conn)
    }

    /// Enqueue an already-framed buffer. Dropped silently if the
    /// connection is closed or `b` is empty (the empty buffer is
    /// reserved as the shutdown sentinel).
    pub fn write(&self, b: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if state.closed || b.is_empty() {
            return;
        }
        self.do_write(&mut state, b);
    }

    fn do_write(&self, state: &mut ConnState, b: Vec<u8>) {
        let Some(tx) = state.write_tx.as_ref() else {
            return;
        };
        match tx.try_send(b) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // Deliberate backpressure policy: a consumer that cannot
                // keep up loses the connection rather than growing the
                // queue or blocking unrelated producers.
                debug!("close conn: write queue full");
                self.do_destroy(state);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn do_destroy(&self, state: &mut ConnState) {
        let _ = self.stream.set_linger(Some(Duration::ZERO));
        let _ = SockRef::from(&*self.stream).shutdown(Shutdown::Both);

        if !state.closed {
            state.write_tx = None;
            state.closed = true;
        }
    }
}

#[async_trait::async_trait]
impl Conn for TcpConn {
    async fn read_msg(&self) -> Result<Vec<u8>, NetworkError> {
        let mut reader = self.reader.lock().await;
        Ok(self.codec.read_from(&mut *reader).await?)
    }

    fn write_msg(&self, parts: &[&[u8]]) -> Result<(), NetworkError> {
        let buf = self.codec.encode(parts)?;
        self.write(buf);
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
