//! Shim between the cache and the worker pool.
//!
//! Extends plain pool scheduling with two capabilities: each unit of work is
//! invoked with a fresh client and operation context fabricated on the
//! executing worker thread, and queued work can be canceled before it starts
//! executing. The callback is invoked exactly once either way.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::CacheError;
use crate::context::{InterruptHandle, OperationContext, ServiceContext};
use crate::threadpool::ThreadPool;

/// Callback for a scheduled lookup: invoked with a fresh operation context
/// once the work gets to run, or with the distinguished cancellation status
/// if it was canceled while still queued.
pub type LookupWork = Box<dyn FnOnce(Result<&OperationContext, CacheError>) + Send + 'static>;

enum TaskState {
    Queued(LookupWork),
    Running(InterruptHandle),
    Canceled,
    Done,
}

struct TaskInfo {
    pool: Arc<dyn ThreadPool>,

    // Serializes `try_cancel` against task startup. Ranked below the cache
    // mutex, so invalidation never waits on work completion.
    state: Mutex<TaskState>,
}

/// Handle to a scheduled unit of work, supporting pre-execution cancellation.
pub struct CancelToken {
    info: Arc<TaskInfo>,
}

impl CancelToken {
    /// Attempts to cancel the work.
    ///
    /// If the work has not started executing it never will: its callback is
    /// re-submitted to the pool and invoked out-of-line with
    /// [`CacheError::Canceled`]. If the work is already running, the
    /// executing operation context is interrupted best-effort. If it already
    /// finished, this is a no-op.
    pub fn try_cancel(&self) {
        let mut state = self.info.state.lock();
        match &*state {
            TaskState::Queued(_) => {
                let TaskState::Queued(work) = mem::replace(&mut *state, TaskState::Canceled)
                else {
                    unreachable!();
                };
                drop(state);
                // Dispatched on the pool rather than invoked inline: the
                // caller typically holds the cache mutex, which the callback
                // itself needs.
                self.info
                    .pool
                    .spawn(Box::new(move || work(Err(CacheError::Canceled))));
            }
            TaskState::Running(handle) => {
                let handle = handle.clone();
                drop(state);
                handle.interrupt();
            }
            TaskState::Canceled | TaskState::Done => {}
        }
    }
}

/// Schedules `work` on `pool`, to be invoked under an operation context
/// fabricated from `service` on the executing worker thread.
pub fn schedule_lookup(
    service: &Arc<ServiceContext>,
    pool: &Arc<dyn ThreadPool>,
    work: LookupWork,
) -> CancelToken {
    let info = Arc::new(TaskInfo {
        pool: Arc::clone(pool),
        state: Mutex::new(TaskState::Queued(work)),
    });

    let task = {
        let info = Arc::clone(&info);
        let service = Arc::clone(service);
        move || run_scheduled(&service, &info)
    };
    pool.spawn(Box::new(task));

    CancelToken { info }
}

fn run_scheduled(service: &ServiceContext, info: &TaskInfo) {
    let client = service.make_client("readthrough-lookup");
    let op_ctx = client.make_operation_context();

    let work = {
        let mut state = info.state.lock();
        match mem::replace(&mut *state, TaskState::Running(op_ctx.interrupt_handle())) {
            TaskState::Queued(work) => work,
            // Canceled while queued; the callback was already dispatched
            // out-of-line, so this queue slot has nothing left to do.
            other => {
                *state = other;
                return;
            }
        }
    };

    work(Ok(&op_ctx));

    *info.state.lock() = TaskState::Done;
}
