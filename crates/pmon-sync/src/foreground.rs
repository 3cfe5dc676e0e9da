//! Single foreground consumer.
//!
//! Every commit, selection change and change notification runs as a job on
//! one queue, drained by whoever owns the foreground state `S`. Background
//! steps hand their results over by dispatching a continuation.

use crate::EngineError;
use tokio::sync::mpsc;

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

pub fn foreground_queue<S>() -> (Dispatcher<S>, ForegroundQueue<S>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Dispatcher { tx }, ForegroundQueue { rx })
}

pub struct Dispatcher<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> Dispatcher<S> {
    /// Queues `job` behind everything already dispatched. Returns false when
    /// the foreground queue has been dropped.
    pub fn invoke_later<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx.send(Box::new(job)).is_ok()
    }
}

pub struct ForegroundQueue<S> {
    rx: mpsc::UnboundedReceiver<Job<S>>,
}

impl<S> ForegroundQueue<S> {
    /// Waits for the next job and runs it. Returns false once every
    /// dispatcher is gone.
    pub async fn run_one(&mut self, state: &mut S) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job(state);
                true
            }
            None => false,
        }
    }

    /// Runs the jobs already queued without waiting for more.
    pub fn run_pending(&mut self, state: &mut S) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job(state);
            ran += 1;
        }
        ran
    }

    pub async fn run(&mut self, state: &mut S) {
        while self.run_one(state).await {}
    }
}

/// Runs a blocking step on the blocking pool.
pub(crate) async fn run_background<T, F>(step: F) -> Result<T, EngineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(step)
        .await
        .map_err(|err| EngineError::Background(err.to_string()))
}
