//! Supervised background tasks
//!
//! A task spawned with [`Supervisor::spawn_fatal`] is expected to run for the
//! life of the process. If it returns an error, the error is logged and
//! recorded and the shared token is cancelled, which takes the whole agent
//! down. The first recorded failure is the one reported on exit.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A supervised task that ended with an error
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFailure {
    /// Name the task was spawned under
    pub task: &'static str,
    /// Rendered error
    pub message: String,
}

/// Spawns tasks bound to one cancellation token
#[derive(Clone)]
pub struct Supervisor {
    token: CancellationToken,
    failure: Arc<Mutex<Option<TaskFailure>>>,
}

impl Supervisor {
    /// Supervisor cancelling `token` on fatal failures
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// The token shared by every supervised task
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawn a task whose error is fatal for the agent
    pub fn spawn_fatal<F, E>(&self, task: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let token = self.token.clone();
        let failure = self.failure.clone();
        tokio::spawn(async move {
            match fut.await {
                Ok(()) => info!(task, "supervised task exited"),
                Err(e) => {
                    error!(task, error = %e, "supervised task failed, shutting down");
                    {
                        let mut slot = failure.lock();
                        if slot.is_none() {
                            *slot = Some(TaskFailure {
                                task,
                                message: e.to_string(),
                            });
                        }
                    }
                    token.cancel();
                }
            }
        })
    }

    /// Spawn a task that cannot fail
    pub fn spawn<F>(&self, task: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            fut.await;
            info!(task, "task exited");
        })
    }

    /// First fatal failure, if any
    pub fn failure(&self) -> Option<TaskFailure> {
        self.failure.lock().clone()
    }
}
