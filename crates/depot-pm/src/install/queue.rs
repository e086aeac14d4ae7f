//! Bounded-concurrency work queue
//!
//! Runs up to `concurrency` tasks at once on a [`JoinSet`]. Each finished
//! task may hand back follow-up tasks, which join the queue. The queue
//! stops at the first error, on cancellation, or once it drains.

use super::InstallError;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct FetchQueue<T> {
    pending: VecDeque<T>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl<T: Send + 'static> FetchQueue<T> {
    pub fn new(concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            pending: VecDeque::new(),
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    pub fn push(&mut self, task: T) {
        self.pending.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run `worker` over every task until the queue drains
    ///
    /// On error or cancellation every in-flight task is aborted.
    pub async fn run<F, Fut>(mut self, worker: F) -> Result<(), InstallError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<Vec<T>, InstallError>> + Send + 'static,
    {
        let mut workers = JoinSet::new();

        loop {
            while workers.len() < self.concurrency {
                let Some(task) = self.pending.pop_front() else {
                    break;
                };
                workers.spawn(worker(task));
            }

            if workers.is_empty() {
                return Ok(());
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    workers.abort_all();
                    return Err(InstallError::Cancelled);
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(Ok(follow_ups))) => self.pending.extend(follow_ups),
                    Some(Ok(Err(e))) => {
                        workers.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        workers.abort_all();
                        return Err(InstallError::IoError(io::Error::other(e)));
                    }
                    None => {}
                },
            }
        }
    }
}
