//! Worker pool for executing blocking lookup tasks.

use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// A unit of work scheduled on a [`ThreadPool`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Schedules nullary callables for execution.
///
/// Shutdown is the host's responsibility, but implementations must eventually
/// run every accepted task, even one submitted while the pool is shutting
/// down: scheduled lookups carry completion callbacks that are contractually
/// invoked exactly once.
pub trait ThreadPool: Send + Sync {
    fn spawn(&self, task: Task);
}

/// Fixed-size worker pool backed by an MPMC channel.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool with `threads` worker threads named after `name`.
    pub fn new(name: &str, threads: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();

        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver: Receiver<Task> = receiver.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        WorkerPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Stops accepting new tasks, drains the queue and joins all workers.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        for worker in self.workers.lock().drain(..) {
            worker.join().expect("worker thread panicked");
        }
    }
}

impl ThreadPool for WorkerPool {
    fn spawn(&self, task: Task) {
        if let Some(sender) = &*self.sender.lock() {
            // The receiving side only disconnects on shutdown, which also
            // clears the sender, so this send cannot fail.
            sender.send(task).ok();
            return;
        }

        // The regular workers are already gone; a fallback thread keeps the
        // exactly-once callback contract for shutdown races.
        tracing::warn!("task submitted after pool shutdown, running it on a fallback thread");
        if let Err(err) = thread::Builder::new().name("fallback".into()).spawn(task) {
            tracing::error!(error = %err, "failed to spawn fallback thread, dropping task");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_all_tasks() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = counter.clone();
            pool.spawn(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_spawn_after_shutdown_uses_fallback_thread() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown();

        let (sender, receiver) = crossbeam_channel::unbounded();
        pool.spawn(Box::new(move || {
            sender.send(()).unwrap();
        }));

        receiver
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("fallback task never ran");
    }
}
