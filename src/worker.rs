//! Single-consumer task queue in front of a replaceable execution thread.
//!
//! Tasks run one at a time on a dedicated OS thread, each under an absolute
//! timeout. A task that overruns is abandoned together with its thread (it
//! cannot be interrupted safely) and a fresh thread takes over. Abandoned
//! threads still count as live; past `max_live_threads` the exhaustion hook
//! fires, which by default terminates the process so a supervisor can
//! restart it.
//!
//! Shutdown enqueues a sentinel behind the pending tasks, so the queue is
//! drained and the in-flight task completes before the consumer exits.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::failure::{Classify, FailureKind};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Called with the live thread count when it passes the limit.
pub type ExhaustionHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker queue is full")]
    QueueFull,

    #[error("worker is shutting down")]
    ShuttingDown,
}

impl Classify for WorkerError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            WorkerError::QueueFull => FailureKind::Transient,
            WorkerError::ShuttingDown => FailureKind::Operational,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub queue_capacity: usize,
    pub task_timeout: Duration,
    pub max_live_threads: usize,
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            task_timeout: config.task_timeout(),
            max_live_threads: config.max_live_threads,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub panicked: u64,
    pub timed_out: u64,
    pub restarts: u64,
    pub live_threads: usize,
}

enum WorkItem {
    Task(Task),
    Shutdown,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
    restarts: AtomicU64,
    live_threads: AtomicUsize,
}

pub struct Worker {
    tx: mpsc::Sender<WorkItem>,
    accepting: AtomicBool,
    consumer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Worker {
    /// Start the consumer with the default exhaustion hook. Must be called
    /// from within a tokio runtime.
    pub fn start(options: WorkerOptions) -> Self {
        Self::with_exhaustion_hook(options, Arc::new(terminate_process))
    }

    pub fn with_exhaustion_hook(options: WorkerOptions, hook: ExhaustionHook) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let consumer = tokio::spawn(consume(rx, options, counters.clone(), hook));
        Self {
            tx,
            accepting: AtomicBool::new(true),
            consumer: Mutex::new(Some(consumer)),
            counters,
        }
    }

    /// Queue a task without waiting.
    pub fn try_submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), WorkerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(WorkerError::ShuttingDown);
        }
        match self.tx.try_send(WorkItem::Task(Box::new(task))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("worker queue full, task rejected");
                Err(WorkerError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::ShuttingDown),
        }
    }

    /// Stop accepting, drain everything queued so far, and wait for the
    /// consumer to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            // waits for queue space, so the sentinel lands behind every task
            if self.tx.send(WorkItem::Shutdown).await.is_err() {
                debug!("worker consumer already gone");
            }
        }
        let handle = self.consumer.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(reason = %e, "worker consumer ended abnormally");
            }
            info!("worker stopped");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            completed: c.completed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            restarts: c.restarts.load(Ordering::Relaxed),
            live_threads: c.live_threads.load(Ordering::Relaxed),
        }
    }
}

fn terminate_process(live: usize) {
    error!(live_threads = live, "worker thread exhaustion, terminating process");
    std::process::exit(1);
}

type Job = (Task, oneshot::Sender<Result<(), String>>);

/// One execution thread. Dropping it closes its channel; the thread exits
/// once its current job (if any) returns.
struct ExecThread {
    jobs: std_mpsc::Sender<Job>,
}

impl ExecThread {
    fn spawn(counters: &Arc<Counters>) -> std::io::Result<Self> {
        let (jobs, rx) = std_mpsc::channel::<Job>();
        let live = counters.clone();
        live.live_threads.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("stakeguard-exec".into())
            .spawn(move || {
                let _alive = LiveGuard(live);
                while let Ok((task, done)) = rx.recv() {
                    let result = catch_unwind(AssertUnwindSafe(task)).map_err(panic_message);
                    if done.send(result).is_err() {
                        debug!("task finished after its timeout, result dropped");
                    }
                }
            });
        match spawned {
            Ok(_) => Ok(Self { jobs }),
            Err(e) => {
                counters.live_threads.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

struct LiveGuard(Arc<Counters>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live_threads.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

async fn consume(
    mut rx: mpsc::Receiver<WorkItem>,
    options: WorkerOptions,
    counters: Arc<Counters>,
    hook: ExhaustionHook,
) {
    let mut exec: Option<ExecThread> = None;

    while let Some(item) = rx.recv().await {
        let task = match item {
            WorkItem::Task(task) => task,
            WorkItem::Shutdown => break,
        };

        let thread = match exec.take() {
            Some(thread) => thread,
            None => match ExecThread::spawn(&counters) {
                Ok(thread) => thread,
                Err(e) => {
                    error!(reason = %e, "cannot spawn execution thread, task dropped");
                    hook(counters.live_threads.load(Ordering::SeqCst));
                    continue;
                }
            },
        };

        let (done_tx, done_rx) = oneshot::channel();
        if thread.jobs.send((task, done_tx)).is_err() {
            // thread died between jobs; the task went down with the channel
            error!("execution thread gone, task dropped");
            counters.restarts.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match tokio::time::timeout(options.task_timeout, done_rx).await {
            Ok(Ok(Ok(()))) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                exec = Some(thread);
            }
            Ok(Ok(Err(message))) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(reason = %message, "worker task panicked");
                exec = Some(thread);
            }
            Ok(Err(_)) => {
                counters.restarts.fetch_add(1, Ordering::Relaxed);
                error!("execution thread exited mid-task");
            }
            Err(_) => {
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                counters.restarts.fetch_add(1, Ordering::Relaxed);
                error!(
                    timeout_secs = options.task_timeout.as_secs_f64(),
                    "worker task timed out, abandoning its thread"
                );
                drop(thread);
                let live = counters.live_threads.load(Ordering::SeqCst);
                // the replacement thread is about to join the abandoned ones
                if live + 1 > options.max_live_threads {
                    hook(live + 1);
                }
            }
        }
    }

    drop(exec);
    debug!("worker consumer exited");
}
