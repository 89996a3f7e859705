use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::error;

/// The I/O engine backing one client or one server: a current-thread tokio
///  runtime driven by a single dedicated worker thread.
///
/// Every task spawned onto the engine executes on that one thread with
///  run-to-completion polls, so per-connection state owned by a task needs no
///  locking. The engine is a value owned by its client/server, not a global.
pub(crate) struct IoEngine {
    handle: Handle,
    shutdown: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

impl IoEngine {
    pub fn start(thread_name: &str) -> anyhow::Result<IoEngine> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let shutdown = Arc::new(Notify::new());

        let worker = {
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(thread_name.to_owned())
                .spawn(move || {
                    runtime.block_on(shutdown.notified());
                    // dropping the runtime here cancels all of its tasks,
                    // which closes the sockets they own
                })?
        };

        Ok(IoEngine {
            handle,
            shutdown,
            worker: Some(worker),
        })
    }

    /// Schedules a task onto the engine thread. Callable from any thread.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task);
    }

    /// Asks the worker to quit, abandoning all in-flight I/O, and joins it.
    pub fn stop(&mut self) {
        self.shutdown.notify_one();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("engine worker thread panicked");
            }
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_spawned_task_runs_on_worker() {
        let mut engine = IoEngine::start("test-engine").unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            engine.spawn(async move {
                ran.store(true, Ordering::Release);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ran.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "task never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.stop();
    }

    #[test]
    fn test_stop_cancels_pending_tasks() {
        let mut engine = IoEngine::start("test-engine").unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        {
            let finished = finished.clone();
            engine.spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished.store(true, Ordering::Release);
            });
        }

        engine.stop();
        assert!(!finished.load(Ordering::Acquire));
    }
}
