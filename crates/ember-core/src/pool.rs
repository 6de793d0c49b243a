use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::{Error, Result};

// WorkerPool — the shared executor behind every asynchronous piece of Ember
//
// One pool per Session. Three kinds of work land here:
//   1. forward/backward argument registration (tiny map inserts)
//   2. per-parameter optimizer steps
//   3. any caller-submitted task that should overlap with the main thread
//
// A submitted task yields a TaskHandle. The handle is how results — and,
// critically, failures — travel back: an error raised inside a task is
// stored in the handle and observed at join time, which can be far from
// the call that queued the work. Tensor accessors join the tensor's
// pending handle before touching either residency, so ordering between
// "work was queued" and "data is read" is the caller's obligation, met
// by joining every handle it was given.

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Slot<T> {
    Pending,
    Done(Result<T>),
    Taken,
}

struct TaskState<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// Handle to a task submitted to a [`WorkerPool`].
///
/// Cloneable; every clone observes the same completion (and the same
/// error, if the task failed). `join` consumes the result value, `wait`
/// only blocks for completion.
pub struct TaskHandle<T> {
    state: Arc<TaskState<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        TaskHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> TaskHandle<T> {
    fn new() -> Self {
        TaskHandle {
            state: Arc::new(TaskState {
                slot: Mutex::new(Slot::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    fn complete(&self, result: Result<T>) {
        let mut slot = self.state.slot.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Slot::Done(result);
        self.state.cond.notify_all();
    }

    /// Block until the task has finished, propagating its error if it failed.
    /// The result value (if any) stays in the handle for `join`.
    pub fn wait(&self) -> Result<()> {
        let mut slot = self
            .state
            .slot
            .lock()
            .map_err(|_| Error::msg("task slot poisoned"))?;
        while matches!(*slot, Slot::Pending) {
            slot = self
                .state
                .cond
                .wait(slot)
                .map_err(|_| Error::msg("task slot poisoned"))?;
        }
        match &*slot {
            Slot::Done(Err(e)) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    /// Block until the task has finished and take its result.
    pub fn join(self) -> Result<T> {
        self.wait()?;
        let mut slot = self
            .state
            .slot
            .lock()
            .map_err(|_| Error::msg("task slot poisoned"))?;
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Done(r) => r,
            Slot::Taken => Err(Error::msg("task result already taken")),
            Slot::Pending => unreachable!("wait() returned while pending"),
        }
    }

    /// Whether the task has completed (successfully or not).
    pub fn is_done(&self) -> bool {
        let slot = self.state.slot.lock().unwrap_or_else(|p| p.into_inner());
        !matches!(*slot, Slot::Pending)
    }
}

struct PoolInner {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A fixed-size pool of worker threads consuming a shared job queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn a pool with `threads` workers (minimum one).
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = Arc::clone(&rx);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("ember-worker-{i}"))
                    .spawn(move || worker_loop(rx))
                    .expect("spawn worker thread"),
            );
        }
        debug!(threads, "worker pool started");
        WorkerPool {
            inner: Arc::new(PoolInner {
                sender: Mutex::new(Some(tx)),
                workers: Mutex::new(workers),
            }),
        }
    }

    /// Pool sized to the machine: one worker per core, minus one for the
    /// thread driving the training loop.
    pub fn with_default_size() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new(n.saturating_sub(1))
    }

    /// Submit a task; the returned handle reports completion and failure.
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handle = TaskHandle::new();
        let done = handle.clone();
        let job: Job = Box::new(move || done.complete(f()));
        let sender = self.inner.sender.lock().unwrap_or_else(|p| p.into_inner());
        let rejected = match sender.as_ref() {
            Some(s) => s.send(job).err().map(|e| e.0),
            None => Some(job),
        };
        drop(sender);
        // Pool already shut down: run inline so the handle still completes.
        if let Some(job) = rejected {
            job();
        }
        handle
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = match rx.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => return, // channel closed
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Close the queue, then let the workers drain and exit.
        if let Ok(mut sender) = self.inner.sender.lock() {
            sender.take();
        }
        if let Ok(mut workers) = self.inner.workers.lock() {
            for w in workers.drain(..) {
                let _ = w.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_and_join() {
        let pool = WorkerPool::new(2);
        let h = pool.submit(|| Ok(21 * 2));
        assert_eq!(h.join().unwrap(), 42);
    }

    #[test]
    fn error_surfaces_at_join() {
        let pool = WorkerPool::new(1);
        let h = pool.submit::<(), _>(|| Err(Error::msg("boom")));
        // The failure is only observed when the handle is joined.
        let err = h.join().unwrap_err();
        assert!(matches!(err, Error::Msg(m) if m == "boom"));
    }

    #[test]
    fn clones_share_completion() {
        let pool = WorkerPool::new(1);
        let h = pool.submit(|| Ok(7u32));
        let h2 = h.clone();
        h.wait().unwrap();
        assert!(h2.is_done());
        assert_eq!(h2.join().unwrap(), 7);
    }

    #[test]
    fn tasks_overlap_submitting_thread() {
        let pool = WorkerPool::new(2);
        let handles: Vec<_> = (0..16).map(|i| pool.submit(move || Ok(i * i))).collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, (0..16).map(|i| i * i).sum());
    }
}
