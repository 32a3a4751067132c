//! Supervised background tasks with structured shutdown.
//!
//! Every spawn has a name; shutdown flips a watch channel, and the
//! supervisor waits for each task to finish its current iteration.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

pub struct TaskSupervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// A receiver tasks can select on to observe shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a named long-running task.
    pub fn spawn<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::info_span!("task", name);
        let handle = tokio::spawn(future.instrument(span));
        info!(name, "background task started");
        self.tasks.push((name.to_string(), handle));
    }

    /// Signal shutdown and wait for every task to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => info!(name, "background task stopped"),
                Err(err) => warn!(name, ?err, "background task aborted"),
            }
        }
    }

    /// Number of supervised tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tasks_observe_shutdown_and_exit() {
        let mut supervisor = TaskSupervisor::new();
        let mut rx = supervisor.subscribe();

        supervisor.spawn("ticker", async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {}
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        assert_eq!(supervisor.len(), 1);

        // Must return promptly instead of waiting out the sleep.
        tokio::time::timeout(std::time::Duration::from_secs(5), supervisor.shutdown())
            .await
            .expect("shutdown must not hang");
    }
}
