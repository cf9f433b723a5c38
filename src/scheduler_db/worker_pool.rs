//! Fixed pool of tasks running enqueue bottom halves.
//!
//! Submitting is throttled twice: a linear delay once the backlog passes a
//! threshold, then a semaphore that blocks once the maximum number of
//! outstanding bottom halves is reached.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::settings::SchedulerConfig;

type BottomHalf = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogDelay {
    pub threshold: usize,
    pub ceiling: usize,
    pub max_delay: Duration,
}

impl BacklogDelay {
    /// No delay up to `threshold`, growing linearly to `max_delay` at `ceiling`.
    pub fn for_backlog(&self, backlog: usize) -> Duration {
        if backlog <= self.threshold {
            return Duration::ZERO;
        }
        if backlog >= self.ceiling || self.ceiling <= self.threshold {
            return self.max_delay;
        }
        let span = (self.ceiling - self.threshold) as u128;
        let over = (backlog - self.threshold) as u128;
        Duration::from_millis((self.max_delay.as_millis() * over / span) as u64)
    }
}

pub struct EnqueueWorkerPool {
    sender: Mutex<Option<mpsc::UnboundedSender<(BottomHalf, OwnedSemaphorePermit)>>>,
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    delay: BacklogDelay,
}

impl EnqueueWorkerPool {
    pub fn new(cfg: &SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<(BottomHalf, OwnedSemaphorePermit)>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let outstanding = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        let workers = (0..cfg.enqueue_workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let outstanding = outstanding.clone();
                let idle = idle.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some((task, permit)) = next else {
                            break;
                        };
                        task.await;
                        drop(permit);
                        if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                            idle.notify_waiters();
                        }
                    }
                    debug!(worker, "enqueue worker exiting");
                })
            })
            .collect();
        Self {
            sender: Mutex::new(Some(tx)),
            permits: Arc::new(Semaphore::new(cfg.max_outstanding_enqueues.max(1))),
            outstanding,
            idle,
            workers: Mutex::new(workers),
            delay: BacklogDelay {
                threshold: cfg.backlog_delay_threshold,
                ceiling: cfg.backlog_delay_ceiling,
                max_delay: Duration::from_millis(cfg.backlog_max_delay_ms),
            },
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Queue `task` for a worker. Returns false when the pool is shut down.
    pub async fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay.for_backlog(self.outstanding());
        if !delay.is_zero() {
            warn!(backlog = self.outstanding(), delay_ms = delay.as_millis() as u64, "enqueue backlog, delaying producer");
            tokio::time::sleep(delay).await;
        }
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return false;
        };
        let sender = self.sender.lock().unwrap().clone();
        let Some(sender) = sender else {
            return false;
        };
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if sender.send((Box::pin(task), permit)).is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Wait until every submitted bottom half has completed.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, let the workers drain the queue and exit.
    pub async fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        self.permits.close();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            worker.await.ok();
        }
    }
}
