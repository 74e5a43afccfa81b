//! Background tasks and sync counters
//!
//! The device backend parallelizes two things off the worker thread: async
//! copy source fills and streaming tasks. Both run on a small fixed pool of
//! task workers fed by a channel. [`SyncCounter`] is the signal/wait
//! primitive bridging those tasks back to producers and to the executor's
//! `SignalCounter`/`WaitCounter` opcodes.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of background workers.
///
/// Tasks are closures; submission never blocks. Dropping the pool closes the
/// channel and joins every worker after it drains the remaining tasks.
pub struct TaskPool {
    sender: Option<flume::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = flume::unbounded::<Task>();

        let workers = (0..threads)
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("ember-task-{index}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn task worker")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queue a task for execution on the pool.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            // The receiver only disappears during drop, when no spawns happen.
            let _ = sender.send(Box::new(task));
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

// ============================================================================
// Sync counter
// ============================================================================

struct CounterState {
    count: u64,
}

struct CounterInner {
    state: Mutex<CounterState>,
    signalled: Condvar,
}

/// A cross-thread counter supporting `signal(n)` and blocking waits.
///
/// Counters start at zero and only ever grow. `wait_for(n)` blocks the
/// calling thread until at least `n` signals have accumulated, which gives
/// both the one-shot completion use (`wait_for(1)`) and the executor's
/// opcode-level signal/wait bridge.
#[derive(Clone)]
pub struct SyncCounter {
    inner: Arc<CounterInner>,
}

impl Default for SyncCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CounterInner {
                state: Mutex::new(CounterState { count: 0 }),
                signalled: Condvar::new(),
            }),
        }
    }

    /// Add `n` to the counter and wake all waiters.
    pub fn signal(&self, n: u64) {
        let mut state = self.inner.state.lock();
        state.count += n;
        self.inner.signalled.notify_all();
    }

    /// Current accumulated count.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.inner.state.lock().count
    }

    /// True once at least `n` signals have accumulated.
    #[must_use]
    pub fn is_signalled(&self, n: u64) -> bool {
        self.value() >= n
    }

    /// Block until the counter reaches `n`.
    pub fn wait_for(&self, n: u64) {
        let mut state = self.inner.state.lock();
        while state.count < n {
            self.inner.signalled.wait(&mut state);
        }
    }

    /// Block until the counter reaches `n`, with a timeout. Returns whether
    /// the target was reached.
    pub fn wait_for_timeout(&self, n: u64, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.count < n {
            if self
                .inner
                .signalled
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.count >= n;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_signal_then_wait() {
        let counter = SyncCounter::new();
        counter.signal(2);
        counter.wait_for(2);
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn counter_cross_thread() {
        let counter = SyncCounter::new();
        let remote = counter.clone();
        let handle = std::thread::spawn(move || remote.signal(1));
        counter.wait_for(1);
        handle.join().unwrap();
    }

    #[test]
    fn pool_runs_tasks() {
        let pool = TaskPool::new(2);
        let counter = SyncCounter::new();
        for _ in 0..8 {
            let counter = counter.clone();
            pool.spawn(move || counter.signal(1));
        }
        counter.wait_for(8);
    }
}
