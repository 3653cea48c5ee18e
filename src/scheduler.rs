//! The [DecodeScheduler] funnels all decode work through one dedicated
//! worker thread.
//!
//! The underlying native decode paths are not reentrant, so running two
//! decodes at once is a correctness hazard, not a tuning knob.  Every
//! submitted task runs strictly FIFO, one at a time, regardless of how
//! many resources are asking; callers must expect to queue behind
//! unrelated work.  [DecodeScheduler::global] provides the process-wide
//! instance that enforces the invariant across the whole program, while
//! tests build private schedulers.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A submitted task did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was cancelled before the worker started it.
    #[error("task was cancelled before it started")]
    Cancelled,
    /// The task panicked; the worker itself keeps running.
    #[error("task panicked while executing")]
    Panicked,
}

enum TaskState<T> {
    Pending,
    Done(T),
    Failed(TaskError),
}

struct TaskShared<T> {
    state: Mutex<TaskState<T>>,
    done: Condvar,
    cancel: AtomicBool,
}

impl<T> TaskShared<T> {
    fn finish(&self, state: TaskState<T>) {
        *self.state.lock().unwrap() = state;
        self.done.notify_all();
    }
}

/// Handle to one queued task.
pub struct TaskHandle<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes, yielding its output.
    pub fn wait(self) -> Result<T, TaskError> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, TaskState::Pending) {
                TaskState::Done(v) => return Ok(v),
                TaskState::Failed(e) => return Err(e),
                TaskState::Pending => state = self.shared.done.wait(state).unwrap(),
            }
        }
    }

    /// Advisory cancellation.  Only a task the worker has not yet started
    /// is affected; a running decode is never interrupted, since the
    /// native decoder below it cannot be.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        !matches!(*self.shared.state.lock().unwrap(), TaskState::Pending)
    }
}

pub struct DecodeScheduler {
    tx: crossbeam_channel::Sender<Job>,
}

static GLOBAL_SCHEDULER: OnceLock<Arc<DecodeScheduler>> = OnceLock::new();

impl DecodeScheduler {
    /// Spawn the worker and return a scheduler feeding it.
    ///
    /// The worker runs until the scheduler is dropped; tasks still queued
    /// at that point are executed before the thread exits.
    pub fn new() -> DecodeScheduler {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        thread::Builder::new()
            .name("decode-worker".into())
            .spawn(move || {
                log::debug!("decode worker started");
                while let Ok(job) = rx.recv() {
                    job();
                }
                log::debug!("decode worker shutting down");
            })
            .expect("Should spawn the decode worker");
        DecodeScheduler { tx }
    }

    /// The process-wide scheduler.
    ///
    /// All production resources share this instance, preserving the
    /// one-decode-at-a-time invariant across unrelated resources.
    pub fn global() -> Arc<DecodeScheduler> {
        GLOBAL_SCHEDULER
            .get_or_init(|| Arc::new(DecodeScheduler::new()))
            .clone()
    }

    /// Queue a task, returning a handle the caller can block on.
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState::Pending),
            done: Condvar::new(),
            cancel: AtomicBool::new(false),
        });
        let job_shared = shared.clone();
        let job: Job = Box::new(move || {
            if job_shared.cancel.load(Ordering::Acquire) {
                job_shared.finish(TaskState::Failed(TaskError::Cancelled));
                return;
            }
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(out) => job_shared.finish(TaskState::Done(out)),
                Err(_) => job_shared.finish(TaskState::Failed(TaskError::Panicked)),
            }
        });
        // The worker owns the receiver for as long as any sender exists,
        // so a send through a live scheduler cannot fail.
        self.tx.send(job).expect("Decode worker should be running");
        TaskHandle { shared }
    }
}

impl Default for DecodeScheduler {
    fn default() -> Self {
        Self::new()
    }
}
