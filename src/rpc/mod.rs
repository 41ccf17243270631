//! In-process RPC over bounded channels.
//!
//! Modules expose a [`Server`]: a registry of callable functions plus a
//! bounded request queue that the module's own runloop drains, so every
//! handler executes single-threaded on the owning module. Other modules
//! talk to it through a [`Client`] in one of three modes:
//!
//! * **synchronous**: [`Client::call0`] / [`Client::call1`] /
//!   [`Client::call_n`] block-push the request and await the reply;
//! * **asynchronous**: [`Client::asyn_call`] offers the request
//!   without blocking and delivers the result to a typed callback on
//!   the caller's own runloop;
//! * **fire-and-forget**: [`ServerHandle::go`] enqueues and forgets.
//!
//! Functions come in three shapes distinguished by return arity; the
//! call variant must match the registered shape or the call fails
//! before anything is enqueued.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::error::RpcError;
use crate::panics;

/// An opaque argument or return value.
pub type Value = Box<dyn Any + Send>;

/// Build a `Vec<rpc::Value>` argument list from plain expressions.
///
/// ```ignore
/// server_handle.go("NewAgent", args![agent]).await;
/// ```
#[macro_export]
macro_rules! args {
    () => { Vec::<$crate::rpc::Value>::new() };
    ($($arg:expr),+ $(,)?) => {
        vec![$(Box::new($arg) as $crate::rpc::Value),+]
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    NoRet,
    SingleRet,
    MultiRet,
}

/// A registered function in one of the three supported shapes.
pub enum Function {
    NoRet(Box<dyn Fn(Vec<Value>) + Send + Sync>),
    SingleRet(Box<dyn Fn(Vec<Value>) -> Value + Send + Sync>),
    MultiRet(Box<dyn Fn(Vec<Value>) -> Vec<Value> + Send + Sync>),
}

impl Function {
    pub fn no_ret(f: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Function::NoRet(Box::new(f))
    }

    pub fn single_ret(f: impl Fn(Vec<Value>) -> Value + Send + Sync + 'static) -> Self {
        Function::SingleRet(Box::new(f))
    }

    pub fn multi_ret(f: impl Fn(Vec<Value>) -> Vec<Value> + Send + Sync + 'static) -> Self {
        Function::MultiRet(Box::new(f))
    }

    fn shape(&self) -> Shape {
        match self {
            Function::NoRet(_) => Shape::NoRet,
            Function::SingleRet(_) => Shape::SingleRet,
            Function::MultiRet(_) => Shape::MultiRet,
        }
    }
}

/// A typed completion callback for [`Client::asyn_call`]; its arity
/// selects which function shape the call targets.
pub enum Callback {
    NoRet(Box<dyn FnOnce(Result<(), RpcError>) + Send>),
    SingleRet(Box<dyn FnOnce(Result<Value, RpcError>) + Send>),
    MultiRet(Box<dyn FnOnce(Result<Vec<Value>, RpcError>) + Send>),
}

impl Callback {
    pub fn no_ret(f: impl FnOnce(Result<(), RpcError>) + Send + 'static) -> Self {
        Callback::NoRet(Box::new(f))
    }

    pub fn single_ret(f: impl FnOnce(Result<Value, RpcError>) + Send + 'static) -> Self {
        Callback::SingleRet(Box::new(f))
    }

    pub fn multi_ret(f: impl FnOnce(Result<Vec<Value>, RpcError>) + Send + 'static) -> Self {
        Callback::MultiRet(Box::new(f))
    }

    fn shape(&self) -> Shape {
        match self {
            Callback::NoRet(_) => Shape::NoRet,
            Callback::SingleRet(_) => Shape::SingleRet,
            Callback::MultiRet(_) => Shape::MultiRet,
        }
    }
}

enum Ret {
    None,
    Single(Value),
    Multi(Vec<Value>),
}

impl Ret {
    fn into_single(self) -> Value {
        match self {
            Ret::Single(v) => v,
            _ => panic!("return shape mismatch"),
        }
    }

    fn into_multi(self) -> Vec<Value> {
        match self {
            Ret::Multi(v) => v,
            _ => panic!("return shape mismatch"),
        }
    }
}

enum Reply {
    Sync(oneshot::Sender<RetInfo>),
    Asyn(mpsc::Sender<RetInfo>),
}

/// One queued call: the resolved function, its arguments, where the
/// result goes and the callback mirrored back to the caller.
pub struct CallInfo {
    f: Arc<Function>,
    args: Vec<Value>,
    reply: Option<Reply>,
    cb: Option<Callback>,
}

/// One completed call: the result (or error) plus the callback carried
/// over from the originating [`CallInfo`].
pub struct RetInfo {
    ret: Result<Ret, RpcError>,
    cb: Option<Callback>,
}

fn send_ret(reply: Option<Reply>, ri: RetInfo) {
    match reply {
        None => {}
        Some(Reply::Sync(tx)) => {
            let _ = tx.send(ri);
        }
        Some(Reply::Asyn(tx)) => {
            // Capacity is guaranteed by the client's pending counter.
            let _ = tx.try_send(ri);
        }
    }
}

/// Run a callback under panic capture.
fn exec_cb(ri: RetInfo) {
    let RetInfo { ret, cb } = ri;
    let Some(cb) = cb else { return };

    let result = catch_unwind(AssertUnwindSafe(move || match cb {
        Callback::NoRet(cb) => cb(ret.map(|_| ())),
        Callback::SingleRet(cb) => cb(ret.map(Ret::into_single)),
        Callback::MultiRet(cb) => cb(ret.map(Ret::into_multi)),
    }));
    if let Err(payload) = result {
        error!("callback panic: {}", panics::describe_panic(payload.as_ref()));
    }
}

/// The serving side: a function registry plus the request queue its
/// owning runloop drains. One server is consumed by exactly one
/// runloop; handlers therefore never run concurrently.
pub struct Server {
    functions: Arc<DashMap<String, Arc<Function>>>,
    tx: mpsc::Sender<CallInfo>,
    /// Request queue; the owning runloop selects on this.
    pub chan_call: mpsc::Receiver<CallInfo>,
}

impl Server {
    /// Create a server whose request queue holds up to `l` calls
    /// (clamped to at least one slot).
    pub fn new(l: usize) -> Self {
        let (tx, chan_call) = mpsc::channel(l.max(1));
        Self {
            functions: Arc::new(DashMap::new()),
            tx,
            chan_call,
        }
    }

    /// Register a function under `id`. Must happen before the server
    /// starts serving.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered; duplicate registration is
    /// a programming error.
    pub fn register(&self, id: impl Into<String>, f: Function) {
        let id = id.into();
        match self.functions.entry(id) {
            Entry::Occupied(e) => panic!("function id {}: already registered", e.key()),
            Entry::Vacant(v) => {
                v.insert(Arc::new(f));
            }
        }
    }

    /// A cheap, cloneable handle other modules use to reach this
    /// server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            functions: self.functions.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Execute one queued call. A handler panic is captured, surfaced
    /// through the reply path and logged; it never unwinds into the
    /// runloop.
    pub fn exec(&self, ci: CallInfo) {
        let CallInfo { f, args, reply, cb } = ci;
        match catch_unwind(AssertUnwindSafe(|| Self::invoke(&f, args))) {
            Ok(ret) => send_ret(reply, RetInfo { ret: Ok(ret), cb }),
            Err(payload) => {
                let err = RpcError::HandlerPanic(panics::describe_panic(payload.as_ref()));
                error!("{}", err);
                send_ret(reply, RetInfo { ret: Err(err), cb });
            }
        }
    }

    fn invoke(f: &Function, args: Vec<Value>) -> Ret {
        match f {
            Function::NoRet(f) => {
                f(args);
                Ret::None
            }
            Function::SingleRet(f) => Ret::Single(f(args)),
            Function::MultiRet(f) => Ret::Multi(f(args)),
        }
    }

    /// Close the request queue and complete any drained residual calls
    /// with *server closed*, so synchronous callers unblock.
    pub fn close(&mut self) {
        self.chan_call.close();
        while let Ok(ci) = self.chan_call.try_recv() {
            let CallInfo { reply, cb, .. } = ci;
            send_ret(
                reply,
                RetInfo {
                    ret: Err(RpcError::ServerClosed),
                    cb,
                },
            );
        }
    }
}

/// Caller-side handle onto one [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    functions: Arc<DashMap<String, Arc<Function>>>,
    tx: mpsc::Sender<CallInfo>,
}

impl ServerHandle {
    /// Fire-and-forget: enqueue the call, blocking if the queue is
    /// full. Unknown ids and a closed server are silently ignored;
    /// the caller asked for no feedback.
    pub async fn go(&self, id: &str, args: Vec<Value>) {
        let Some(f) = self.functions.get(id).map(|f| f.value().clone()) else {
            return;
        };
        let _ = self
            .tx
            .send(CallInfo {
                f,
                args,
                reply: None,
                cb: None,
            })
            .await;
    }

    /// Create a client attached to this server with an async-reply
    /// queue of `l` slots.
    pub fn open(&self, l: usize) -> Client {
        let mut client = Client::new(l);
        client.attach(self.clone());
        client
    }

    /// One-shot synchronous no-return call through a throwaway client.
    pub async fn call0(&self, id: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.open(0).call0(id, args).await
    }

    /// One-shot synchronous single-return call through a throwaway
    /// client.
    pub async fn call1(&self, id: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.open(0).call1(id, args).await
    }
}

/// The calling side: sync, async-with-callback and fire-and-forget
/// calls against one attached server. One client per runloop.
pub struct Client {
    server: Option<ServerHandle>,
    asyn_tx: mpsc::Sender<RetInfo>,
    /// Async-reply queue; the owning runloop selects on this and feeds
    /// each entry to [`Client::cb`].
    pub chan_asyn_ret: mpsc::Receiver<RetInfo>,
    pending_asyn: usize,
    asyn_cap: usize,
}

impl Client {
    /// Create a detached client whose async-reply queue holds `l`
    /// completed calls. With `l == 0` the asynchronous mode is
    /// disabled: every `asyn_call` fails immediately with
    /// [`RpcError::TooManyCalls`].
    pub fn new(l: usize) -> Self {
        let (asyn_tx, chan_asyn_ret) = mpsc::channel(l.max(1));
        Self {
            server: None,
            asyn_tx,
            chan_asyn_ret,
            pending_asyn: 0,
            asyn_cap: l,
        }
    }

    /// Attach the client to a server. A client talks to one server at
    /// a time; re-attaching redirects subsequent calls.
    pub fn attach(&mut self, server: ServerHandle) {
        self.server = Some(server);
    }

    fn lookup(&self, id: &str, shape: Shape) -> Result<(ServerHandle, Arc<Function>), RpcError> {
        let server = self.server.clone().ok_or(RpcError::NotAttached)?;
        let f = server
            .functions
            .get(id)
            .map(|f| f.value().clone())
            .ok_or_else(|| RpcError::NotRegistered(id.to_string()))?;
        if f.shape() != shape {
            return Err(RpcError::ShapeMismatch(id.to_string()));
        }
        Ok((server, f))
    }

    async fn call_sync(
        &self,
        server: ServerHandle,
        f: Arc<Function>,
        args: Vec<Value>,
    ) -> Result<RetInfo, RpcError> {
        let (tx, rx) = oneshot::channel();
        server
            .tx
            .send(CallInfo {
                f,
                args,
                reply: Some(Reply::Sync(tx)),
                cb: None,
            })
            .await
            .map_err(|_| RpcError::ServerClosed)?;
        rx.await.map_err(|_| RpcError::ServerClosed)
    }

    /// Synchronous call of a no-return function.
    pub async fn call0(&self, id: &str, args: Vec<Value>) -> Result<(), RpcError> {
        let (server, f) = self.lookup(id, Shape::NoRet)?;
        let ri = self.call_sync(server, f, args).await?;
        ri.ret.map(|_| ())
    }

    /// Synchronous call of a single-return function.
    pub async fn call1(&self, id: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let (server, f) = self.lookup(id, Shape::SingleRet)?;
        let ri = self.call_sync(server, f, args).await?;
        ri.ret.map(Ret::into_single)
    }

    /// Synchronous call of a multi-return function.
    pub async fn call_n(&self, id: &str, args: Vec<Value>) -> Result<Vec<Value>, RpcError> {
        let (server, f) = self.lookup(id, Shape::MultiRet)?;
        let ri = self.call_sync(server, f, args).await?;
        ri.ret.map(Ret::into_multi)
    }

    /// Asynchronous call: offer the request without blocking and
    /// deliver the outcome to `cb` on this client's async-reply queue.
    /// The callback always fires: on a full server queue or a lookup
    /// failure it fires with the corresponding error, and when the
    /// reply queue itself is at capacity it fires immediately with
    /// [`RpcError::TooManyCalls`] (pending counter unchanged).
    pub fn asyn_call(&mut self, id: &str, args: Vec<Value>, cb: Callback) {
        if self.pending_asyn >= self.asyn_cap {
            exec_cb(RetInfo {
                ret: Err(RpcError::TooManyCalls),
                cb: Some(cb),
            });
            return;
        }

        let shape = cb.shape();
        match self.lookup(id, shape) {
            Err(e) => {
                let _ = self.asyn_tx.try_send(RetInfo {
                    ret: Err(e),
                    cb: Some(cb),
                });
            }
            Ok((server, f)) => {
                let ci = CallInfo {
                    f,
                    args,
                    reply: Some(Reply::Asyn(self.asyn_tx.clone())),
                    cb: Some(cb),
                };
                match server.tx.try_send(ci) {
                    Ok(()) => {}
                    Err(TrySendError::Full(ci)) => {
                        let _ = self.asyn_tx.try_send(RetInfo {
                            ret: Err(RpcError::ChannelFull),
                            cb: ci.cb,
                        });
                    }
                    Err(TrySendError::Closed(ci)) => {
                        let _ = self.asyn_tx.try_send(RetInfo {
                            ret: Err(RpcError::ServerClosed),
                            cb: ci.cb,
                        });
                    }
                }
            }
        }
        self.pending_asyn += 1;
    }

    /// Deliver one completed call to its callback. The owning runloop
    /// calls this for every entry pulled off `chan_asyn_ret`.
    pub fn cb(&mut self, ri: RetInfo) {
        self.pending_asyn = self.pending_asyn.saturating_sub(1);
        exec_cb(ri);
    }

    /// Drain outstanding asynchronous calls, executing each callback.
    pub async fn close(&mut self) {
        while self.pending_asyn > 0 {
            match self.chan_asyn_ret.recv().await {
                Some(ri) => self.cb(ri),
                None => break,
            }
        }
    }

    /// Whether no asynchronous calls are in flight.
    pub fn idle(&self) -> bool {
        self.pending_asyn == 0
    }
}
