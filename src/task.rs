use std::future::Future;

use rocket::tokio::sync::oneshot;
use rocket::tokio::task::JoinHandle;
use tracing::{info, warn};

/// A background task that must be released explicitly with [`teardown`].
///
/// Dropping the handle without tearing it down aborts the task.
///
/// [`teardown`]: TaskHandle::teardown
pub struct TaskHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawns `task`, handing it the receiver that fires on teardown.
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = rocket::tokio::spawn(task(rx));
        info!("Started {name}");

        Self {
            name,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals the task to stop and waits for it to exit.
    pub async fn teardown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            // The task may already have exited on its own.
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("{} ended abnormally: {e}", self.name);
            }
        }
        info!("Stopped {}", self.name);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!("{} dropped without teardown, aborting", self.name);
            handle.abort();
        }
    }
}
