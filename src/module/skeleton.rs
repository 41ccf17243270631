//! The per-module runloop.
//!
//! A [`Skeleton`] select-multiplexes everything that can happen to a
//! module (RPC requests, command requests, async-call replies, timer
//! expirations and job completions) and executes each event to
//! completion before dequeuing the next. Inside a module, everything
//! is single-threaded and event-ordered; this is the framework's core
//! simplification.

use std::time::Duration;

use crate::module::worker::{JobCallback, LinearContext, Worker};
use crate::module::CloseSig;
use crate::rpc;
use crate::timer::{Cron, CronExpr, Dispatcher, Timer, TimerHandle};

/// Capacities for a skeleton's event queues. A zero capacity disables
/// the corresponding facility: its helper methods panic when called.
#[derive(Default)]
pub struct SkeletonOptions {
    /// Job completion queue capacity.
    pub go_len: usize,

    /// Timer expiry queue capacity.
    pub timer_dispatcher_len: usize,

    /// Async-reply queue capacity; also bounds in-flight async calls.
    pub asyn_call_len: usize,

    /// The module's exposed RPC server. Required for
    /// [`Skeleton::register_rpc`]; a module that serves no calls may
    /// leave it out and still use every other facility.
    pub server: Option<rpc::Server>,
}

/// A module runloop: one RPC service server, one command server, one
/// RPC client, one timer dispatcher and one job worker, drained by a
/// single `select!` loop on the module's own task.
pub struct Skeleton {
    go_len: usize,
    timer_dispatcher_len: usize,
    asyn_call_len: usize,
    has_rpc_server: bool,

    server: rpc::Server,
    command_server: rpc::Server,
    client: rpc::Client,
    worker: Worker,
    dispatcher: Dispatcher,
}

enum Event {
    Close,
    Call(rpc::CallInfo),
    Command(rpc::CallInfo),
    AsynRet(rpc::RetInfo),
    JobDone(JobCallback),
    Expired(Timer),
}

impl Skeleton {
    pub fn new(opts: SkeletonOptions) -> Self {
        let has_rpc_server = opts.server.is_some();
        Self {
            go_len: opts.go_len,
            timer_dispatcher_len: opts.timer_dispatcher_len,
            asyn_call_len: opts.asyn_call_len,
            has_rpc_server,
            server: opts.server.unwrap_or_else(|| rpc::Server::new(0)),
            command_server: rpc::Server::new(0),
            client: rpc::Client::new(opts.asyn_call_len),
            worker: Worker::new(opts.go_len),
            dispatcher: Dispatcher::new(opts.timer_dispatcher_len),
        }
    }

    /// Drive the runloop until the close signal arrives, then shut
    /// down: close both servers (completing residual calls with
    /// *server closed*), and drain in-flight jobs and async calls so
    /// their callbacks still execute.
    pub async fn run(&mut self, close_sig: &mut CloseSig) {
        loop {
            let event = tokio::select! {
                _ = close_sig.recv() => Event::Close,
                Some(ri) = self.client.chan_asyn_ret.recv() => Event::AsynRet(ri),
                Some(ci) = self.server.chan_call.recv() => Event::Call(ci),
                Some(ci) = self.command_server.chan_call.recv() => Event::Command(ci),
                Some(cb) = self.worker.chan_cb.recv() => Event::JobDone(cb),
                Some(timer) = self.dispatcher.chan_timer.recv() => Event::Expired(timer),
                else => Event::Close,
            };

            match event {
                Event::Close => {
                    self.command_server.close();
                    self.server.close();
                    while !self.worker.idle() || !self.client.idle() {
                        self.worker.close().await;
                        self.client.close().await;
                    }
                    return;
                }
                Event::AsynRet(ri) => self.client.cb(ri),
                Event::Call(ci) => self.server.exec(ci),
                Event::Command(ci) => self.command_server.exec(ci),
                Event::JobDone(cb) => self.worker.cb(cb),
                Event::Expired(timer) => timer.cb(),
            }
        }
    }

    /// Register a function on the module's exposed RPC server.
    ///
    /// # Panics
    ///
    /// Panics if the skeleton was built without a server.
    pub fn register_rpc(&self, id: impl Into<String>, f: rpc::Function) {
        if !self.has_rpc_server {
            panic!("invalid rpc server");
        }
        self.server.register(id, f);
    }

    /// Handle onto the exposed RPC server.
    pub fn server_handle(&self) -> rpc::ServerHandle {
        self.server.handle()
    }

    /// Register a control function on the command server.
    pub fn register_command(&self, id: impl Into<String>, f: rpc::Function) {
        self.command_server.register(id, f);
    }

    /// Handle onto the command server, for consoles and tooling.
    pub fn command_handle(&self) -> rpc::ServerHandle {
        self.command_server.handle()
    }

    /// Asynchronous call against `server`, its result delivered on
    /// this runloop.
    ///
    /// # Panics
    ///
    /// Panics if `asyn_call_len` is zero.
    pub fn asyn_call(
        &mut self,
        server: &rpc::ServerHandle,
        id: &str,
        args: Vec<rpc::Value>,
        cb: rpc::Callback,
    ) {
        if self.asyn_call_len == 0 {
            panic!("invalid asyn_call_len");
        }
        self.client.attach(server.clone());
        self.client.asyn_call(id, args, cb);
    }

    /// Schedule `cb` on this runloop after `d`.
    ///
    /// # Panics
    ///
    /// Panics if `timer_dispatcher_len` is zero.
    pub fn after(&self, d: Duration, cb: impl FnOnce() + Send + 'static) -> TimerHandle {
        if self.timer_dispatcher_len == 0 {
            panic!("invalid timer_dispatcher_len");
        }
        self.dispatcher.after(d, cb)
    }

    /// Install a cron job on this runloop.
    ///
    /// # Panics
    ///
    /// Panics if `timer_dispatcher_len` is zero.
    pub fn cron(&self, expr: CronExpr, cb: impl Fn() + Send + Sync + 'static) -> Cron {
        if self.timer_dispatcher_len == 0 {
            panic!("invalid timer_dispatcher_len");
        }
        self.dispatcher.cron(expr, cb)
    }

    /// Run a job off-module; `cb` runs on this runloop afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `go_len` is zero.
    pub fn spawn_job<F>(&self, f: F, cb: impl FnOnce() + Send + 'static)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.go_len == 0 {
            panic!("invalid go_len");
        }
        self.worker.spawn(f, cb);
    }

    /// Create a strictly-ordered job context on this runloop's worker.
    ///
    /// # Panics
    ///
    /// Panics if `go_len` is zero.
    pub fn linear_context(&self) -> LinearContext {
        if self.go_len == 0 {
            panic!("invalid go_len");
        }
        self.worker.linear_context()
    }
}
