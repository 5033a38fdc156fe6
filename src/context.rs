//! Execution contexts for attributable, interruptible work.
//!
//! A [`ServiceContext`] is the process-wide object from which per-work
//! [`Client`]s and [`OperationContext`]s are fabricated. The operation
//! context is opaque to the cache itself: it is passed verbatim to the
//! user's lookup function, and it is the handle through which blocking waits
//! and running lookups can be interrupted.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use futures::channel::oneshot;
use futures::future::{self, Either, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;

/// Error returned when a blocking wait was interrupted through the owning
/// [`OperationContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("operation interrupted")]
pub struct Interrupted;

type Clock = Box<dyn Fn() -> SystemTime + Send + Sync>;

/// Process-wide context from which clients and operation contexts are
/// fabricated.
pub struct ServiceContext {
    name: String,
    clock: Clock,
    next_client_id: AtomicU64,
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("name", &self.name)
            .finish()
    }
}

impl ServiceContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Box::new(SystemTime::now))
    }

    /// Creates a service context with a custom wall-clock source.
    pub fn with_clock(name: impl Into<String>, clock: Clock) -> Self {
        ServiceContext {
            name: name.into(),
            clock,
            next_client_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current wall-clock time as seen by this service.
    pub fn now(&self) -> SystemTime {
        (self.clock)()
    }

    /// Fabricates a new client with a process-unique id.
    pub fn make_client(&self, desc: impl Into<String>) -> Client {
        let client = Client {
            id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            desc: desc.into(),
        };
        tracing::trace!(
            service = %self.name,
            client = client.id,
            desc = %client.desc,
            "created client"
        );
        client
    }
}

/// A process-wide identity for attributable work.
#[derive(Debug)]
pub struct Client {
    id: u64,
    desc: String,
}

impl Client {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Creates an operation context attached to this client.
    pub fn make_operation_context(&self) -> OperationContext {
        let (sender, receiver) = oneshot::channel();
        OperationContext {
            client_id: self.id,
            kill: Arc::new(KillState {
                killed: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
            }),
            kill_signal: receiver.shared(),
        }
    }
}

struct KillState {
    killed: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

/// Handle through which a running operation can be interrupted from another
/// thread.
#[derive(Clone)]
pub struct InterruptHandle {
    kill: Arc<KillState>,
}

impl InterruptHandle {
    /// Marks the operation as killed and wakes any interruptible wait on it.
    pub fn interrupt(&self) {
        self.kill.killed.store(true, Ordering::Release);
        if let Some(sender) = self.kill.sender.lock().take() {
            sender.send(()).ok();
        }
    }
}

/// Per-operation context threaded through to lookup functions.
pub struct OperationContext {
    client_id: u64,
    kill: Arc<KillState>,
    kill_signal: Shared<oneshot::Receiver<()>>,
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("client_id", &self.client_id)
            .field("killed", &self.is_killed())
            .finish()
    }
}

impl OperationContext {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Whether this operation has been interrupted.
    pub fn is_killed(&self) -> bool {
        self.kill.killed.load(Ordering::Acquire)
    }

    /// Errors out if this operation has been interrupted. Long-running lookup
    /// functions can call this periodically to honor cancellation.
    pub fn check_for_interrupt(&self) -> Result<(), Interrupted> {
        if self.is_killed() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Returns a handle through which this operation can be interrupted.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            kill: Arc::clone(&self.kill),
        }
    }

    /// Blocks the current thread until `future` resolves or this operation is
    /// interrupted, whichever comes first.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, Interrupted> {
        if self.is_killed() {
            return Err(Interrupted);
        }

        let kill_signal = self.kill_signal.clone();
        futures::executor::block_on(async move {
            futures::pin_mut!(future);
            match future::select(future, kill_signal).await {
                Either::Left((output, _)) => Ok(output),
                Either::Right(_) => Err(Interrupted),
            }
        })
    }
}
