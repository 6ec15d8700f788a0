use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::{oneshot, watch};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queued job ended without producing a result")]
    Dropped,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<Job>,
    running: usize,
}

struct Inner {
    concurrency: usize,
    state: Mutex<QueueState>,
    /// Waiting plus running jobs.
    outstanding: watch::Sender<usize>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts waiting jobs, oldest first, until the concurrency limit is hit.
    fn dispatch(self: &Arc<Self>) {
        // Gone during runtime shutdown; waiting jobs are dropped with the queue
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        loop {
            let job = {
                let mut state = self.state();
                if state.running >= self.concurrency {
                    return;
                }
                let Some(job) = state.waiting.pop_front() else {
                    return;
                };
                state.running += 1;
                job
            };

            let finished = Finished(self.clone());
            runtime.spawn(async move {
                let _finished = finished;
                job.await;
            });
        }
    }
}

/// Releases a running slot when the job's task ends, panics included.
struct Finished(Arc<Inner>);

impl Drop for Finished {
    fn drop(&mut self) {
        {
            let mut state = self.0.state();
            state.running = state.running.saturating_sub(1);
        }
        self.0.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        self.0.dispatch();
    }
}

/// FIFO job queue running at most `concurrency` jobs at once.
///
/// Idle queues hold no task or timer; jobs are spawned onto the runtime only
/// when admitted.
#[derive(Clone)]
pub struct TopicQueue {
    inner: Arc<Inner>,
}

impl TopicQueue {
    pub fn new(concurrency: usize) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                concurrency: concurrency.max(1),
                state: Mutex::new(QueueState::default()),
                outstanding,
            }),
        }
    }

    /// Queues `job` and returns a handle resolving to its output. The job
    /// starts as soon as a slot is free, whether or not the handle is polled.
    pub fn add<F, T>(&self, job: F) -> JobHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(job.await);
        });

        {
            let mut state = self.inner.state();
            state.waiting.push_back(job);
            self.inner.outstanding.send_modify(|n| *n += 1);
        }
        self.inner.dispatch();
        JobHandle { rx }
    }

    /// Jobs waiting for a slot.
    pub fn size(&self) -> usize {
        self.inner.state().waiting.len()
    }

    /// Jobs currently running.
    pub fn pending(&self) -> usize {
        self.inner.state().running
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.outstanding.borrow() == 0
    }

    /// Resolves once nothing is waiting or running.
    pub async fn on_idle(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        // The sender lives in `inner`, so this only ends when the count hits zero
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Output of a queued job.
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| QueueError::Dropped))
    }
}

/// One queue per topic, created on first use and kept for the process
/// lifetime.
pub struct QueueRegistry {
    concurrency: usize,
    queues: Mutex<HashMap<String, TopicQueue>>,
}

impl QueueRegistry {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, topic_id: &str) -> TopicQueue {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic_id.to_string())
            .or_insert_with(|| TopicQueue::new(self.concurrency))
            .clone()
    }

    pub fn has_pending(&self, topic_id: &str) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic_id)
            .is_some_and(|q| !q.is_idle())
    }

    /// Waits for a topic's queue to drain. Returns at once for unknown topics.
    pub async fn wait_for(&self, topic_id: &str) {
        let queue = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic_id)
            .cloned();
        if let Some(queue) = queue {
            queue.on_idle().await;
        }
    }
}
