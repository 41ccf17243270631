//! Module lifecycle: registration, ordered init, reverse-order
//! teardown.
//!
//! A module is a long-running unit of game logic with its own runloop
//! (usually a [`Skeleton`]). The [`Runtime`] owns the registered
//! modules: `init` calls every `on_init` in declaration order and then
//! starts each module's `run` on its own task; `destroy` walks the
//! modules in reverse, signalling the close channel, waiting for `run`
//! to return and invoking `on_destroy` under panic capture.

pub mod skeleton;
pub mod worker;

pub use skeleton::{Skeleton, SkeletonOptions};
pub use worker::{LinearContext, Worker};

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::panics;

/// Capacity-1 close channel: `destroy` sends `true` and waits for the
/// module's `run` to return.
pub type CloseSig = mpsc::Receiver<bool>;

/// A long-running logical unit driven by its own task.
#[async_trait]
pub trait Module: Send {
    /// Synchronous-phase setup, called in registration order before
    /// any module runs.
    async fn on_init(&mut self) {}

    /// The module's main loop. Must return promptly once `close_sig`
    /// yields a value.
    async fn run(&mut self, close_sig: &mut CloseSig);

    /// Teardown, called in reverse registration order after `run` has
    /// returned. Panics are captured and logged.
    async fn on_destroy(&mut self) {}
}

struct Slot {
    name: &'static str,
    module: Option<Box<dyn Module>>,
    close_tx: Option<mpsc::Sender<bool>>,
    task: Option<JoinHandle<Box<dyn Module>>>,
}

/// Owns the registered modules and drives their lifecycle.
#[derive(Default)]
pub struct Runtime {
    modules: Vec<Slot>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Declaration order is init order and reverse
    /// destroy order.
    pub fn register(&mut self, name: &'static str, module: impl Module + 'static) {
        self.modules.push(Slot {
            name,
            module: Some(Box::new(module)),
            close_tx: None,
            task: None,
        });
    }

    /// Initialize every module in order, then start each `run` on its
    /// own task.
    pub async fn init(&mut self) {
        for slot in self.modules.iter_mut() {
            if let Some(module) = slot.module.as_mut() {
                module.on_init().await;
            }
        }

        for slot in self.modules.iter_mut() {
            let Some(mut module) = slot.module.take() else {
                continue;
            };
            let (close_tx, mut close_rx) = mpsc::channel(1);
            slot.close_tx = Some(close_tx);
            slot.task = Some(tokio::spawn(async move {
                module.run(&mut close_rx).await;
                module
            }));
            info!("module {} started", slot.name);
        }
    }

    /// Tear the modules down in reverse order. Each gets the close
    /// signal, is awaited, and has `on_destroy` invoked; a panicking
    /// `on_destroy` is logged and does not stop the walk.
    pub async fn destroy(&mut self) {
        for slot in self.modules.iter_mut().rev() {
            let Some(close_tx) = slot.close_tx.take() else {
                continue;
            };
            let _ = close_tx.send(true).await;

            let Some(task) = slot.task.take() else {
                continue;
            };
            match task.await {
                Ok(mut module) => {
                    let result = AssertUnwindSafe(module.on_destroy()).catch_unwind().await;
                    if let Err(payload) = result {
                        error!(
                            "module {} destroy panic: {}",
                            slot.name,
                            panics::describe_panic(payload.as_ref())
                        );
                    }
                    info!("module {} stopped", slot.name);
                }
                Err(e) => error!("module {} task failed: {}", slot.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Module for Recorder {
        async fn on_init(&mut self) {
            self.log.lock().unwrap().push(format!("init {}", self.name));
        }

        async fn run(&mut self, close_sig: &mut CloseSig) {
            close_sig.recv().await;
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }

        async fn on_destroy(&mut self) {
            self.log
                .lock()
                .unwrap()
                .push(format!("destroy {}", self.name));
        }
    }

    #[tokio::test]
    async fn test_init_in_order_destroy_in_reverse() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = Runtime::new();
        runtime.register(
            "a",
            Recorder {
                name: "a",
                log: log.clone(),
            },
        );
        runtime.register(
            "b",
            Recorder {
                name: "b",
                log: log.clone(),
            },
        );

        runtime.init().await;
        runtime.destroy().await;

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "init a", "init b", "stop b", "destroy b", "stop a", "destroy a"
            ]
        );
    }

    struct Exploder;

    #[async_trait]
    impl Module for Exploder {
        async fn run(&mut self, close_sig: &mut CloseSig) {
            close_sig.recv().await;
        }

        async fn on_destroy(&mut self) {
            panic!("destroy exploded");
        }
    }

    #[tokio::test]
    async fn test_destroy_panic_does_not_stop_teardown() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = Runtime::new();
        runtime.register(
            "steady",
            Recorder {
                name: "steady",
                log: log.clone(),
            },
        );
        runtime.register("exploder", Exploder);

        runtime.init().await;
        runtime.destroy().await;

        // The exploder tears down first (reverse order) and its panic
        // must not prevent the steady module's teardown.
        assert!(log
            .lock()
            .unwrap()
            .contains(&"destroy steady".to_string()));
    }
}
