use std::sync::mpsc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};

use crate::state::SharedState;

/// Dedicated Tokio runtime, on its own OS thread, that runs action
/// executions and the background loops apart from the HTTP runtime.
pub struct WorkerPool {
    handle: Handle,
    stop: oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl WorkerPool {
    pub fn start(worker_count: usize) -> Self {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (stop, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("worker-pool".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(worker_count)
                    .thread_name("action-worker")
                    .enable_all()
                    .build()
                    .expect("Failed to build worker runtime");

                let _ = handle_tx.send(runtime.handle().clone());
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                runtime.shutdown_timeout(Duration::from_secs(5));
                tracing::info!("Worker pool stopped");
            })
            .expect("Failed to spawn worker pool thread");

        let handle = handle_rx
            .recv()
            .expect("Worker pool thread exited before starting");
        tracing::info!("Worker pool started ({worker_count} threads)");

        Self {
            handle,
            stop,
            thread,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn spawn_loops(&self, state: &SharedState, shutdown: watch::Receiver<bool>) {
        spawn_background(&self.handle, state, shutdown);
    }

    /// Wait up to `grace` for in-flight executions, then stop the runtime.
    /// Anything still running is recovered by the reaper on next start.
    pub fn shutdown(self, state: &SharedState, grace: Duration) {
        let deadline = std::time::Instant::now() + grace;
        while state.dispatcher.in_flight() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        let left = state.dispatcher.in_flight();
        if left > 0 {
            tracing::warn!("Stopping worker pool with {left} execution(s) in flight");
        }
        let _ = self.stop.send(());
        let _ = self.thread.join();
    }
}

/// Spawn the scheduler, reaper, outbox and workflow loops on `handle`.
pub fn spawn_background(handle: &Handle, state: &SharedState, shutdown: watch::Receiver<bool>) {
    let poll = state.config.scheduler.poll_interval;
    let reap_every = (state.config.scheduler.liveness_timeout / 3)
        .clamp(Duration::from_secs(1), Duration::from_secs(60));

    handle.spawn(state.scheduler.clone().run(poll, shutdown.clone()));
    handle.spawn(state.reaper.clone().run(reap_every, shutdown.clone()));
    handle.spawn(state.deliverer.clone().run(shutdown.clone()));
    handle.spawn(state.workflows.clone().run(poll, shutdown));
}
