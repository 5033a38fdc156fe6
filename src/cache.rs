//! Generic read-through cache built on top of [`InvalidatingLruCache`].
//!
//! On a miss the cache fetches the value through a caller-supplied blocking
//! lookup function executed on a worker pool. Concurrent acquires for the
//! same missing key coalesce into a single in-flight lookup, and the
//! invalidation calls act as a barrier: a lookup in flight when an
//! invalidation arrives is restarted, so every waiter observes data fetched
//! strictly after the invalidation.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use futures::channel::oneshot;
use futures::future::{Future, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::CacheConfig;
use crate::context::{OperationContext, ServiceContext};
use crate::lru::{CachedItemInfo, InvalidatingLruCache, ValueHandle};
use crate::threadpool::ThreadPool;
use crate::work::{self, CancelToken, LookupWork};

/// Error surfaced to waiters of a cache lookup.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The lookup round was canceled before it could produce a result.
    #[error("read-through cache lookup canceled")]
    Canceled,

    /// The user-supplied lookup function failed.
    #[error("lookup failed: {0}")]
    Lookup(String),
}

impl CacheError {
    /// Wraps an arbitrary lookup failure.
    pub fn lookup(err: impl fmt::Display) -> Self {
        CacheError::Lookup(err.to_string())
    }

    /// Whether this is the distinguished cancellation code.
    ///
    /// The retry loop never restarts a round that ended with a cancellation,
    /// including one raised by the lookup function itself.
    pub fn is_canceled(&self) -> bool {
        matches!(self, CacheError::Canceled)
    }
}

/// Result of a single lookup round. `Ok(None)` means the key does not exist
/// in the backing store; this is reported to waiters as an empty handle and
/// deliberately not cached, so subsequent acquires look the key up again.
pub type LookupResult<V> = Result<Option<V>, CacheError>;

/// Blocking function invoked on the worker pool to fetch a missing key from
/// the backing store.
pub type LookupFn<K, V> = Box<dyn Fn(&OperationContext, &K) -> LookupResult<V> + Send + Sync>;

type Outcome<V> = Result<ValueHandle<V>, CacheError>;

// Inner result necessary because all waiters of one lookup observe the same
// clonable outcome through the shared channel.
type CompletionChannel<V> = Shared<oneshot::Receiver<Outcome<V>>>;

/// Future returned by [`ReadThroughCache::acquire_async`].
pub struct ValueFuture<V> {
    inner: ValueFutureInner<V>,
}

enum ValueFutureInner<V> {
    Ready(Option<Outcome<V>>),
    Waiting(CompletionChannel<V>),
}

impl<V> ValueFuture<V> {
    fn ready(outcome: Outcome<V>) -> Self {
        ValueFuture {
            inner: ValueFutureInner::Ready(Some(outcome)),
        }
    }

    fn waiting(channel: CompletionChannel<V>) -> Self {
        ValueFuture {
            inner: ValueFutureInner::Waiting(channel),
        }
    }
}

impl<V> Future for ValueFuture<V> {
    type Output = Result<ValueHandle<V>, CacheError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            ValueFutureInner::Ready(outcome) => {
                Poll::Ready(outcome.take().expect("ValueFuture polled after completion"))
            }
            ValueFutureInner::Waiting(channel) => match Pin::new(channel).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                // An in-progress lookup can only go away by signaling its
                // waiters first.
                Poll::Ready(Err(oneshot::Canceled)) => {
                    panic!("lookup completion channel dropped without signaling waiters")
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Tracks an active fetch for one key and implements the guarantees of the
/// invalidation barrier.
///
/// Operated on by the cache under its mutex; at most one instance exists per
/// key at any instant. A key lives either here or in the store, never both.
struct InProgressLookup<V> {
    /// False until a round is scheduled, and cleared again by invalidation.
    /// Between rounds this is the authoritative signal of whether the
    /// just-completed round's result may be published.
    valid: bool,

    /// Token for the current round; replaced whenever a new round starts.
    cancel_token: Option<CancelToken>,

    sender: Option<oneshot::Sender<Outcome<V>>>,
    channel: CompletionChannel<V>,
}

impl<V> InProgressLookup<V> {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        InProgressLookup {
            valid: false,
            cancel_token: None,
            sender: Some(sender),
            channel: receiver.shared(),
        }
    }

    /// Registers one more caller on the shared completion channel.
    fn add_waiter(&self) -> CompletionChannel<V> {
        self.channel.clone()
    }

    fn invalidate_and_cancel_current_round(&mut self) {
        self.valid = false;
        if let Some(token) = &self.cancel_token {
            token.try_cancel();
        }
    }

    /// Fulfils the shared completion channel, consuming the detached entry.
    fn signal_waiters(mut self, outcome: Outcome<V>) {
        let sender = self.sender.take().expect("waiters already signaled");
        // Every waiter may have been dropped; nobody listening is fine.
        sender.send(outcome).ok();
    }
}

struct CacheState<K, V> {
    /// Keys that were acquired, missed the store and are currently being
    /// looked up from the backing store.
    in_progress: HashMap<K, InProgressLookup<V>>,
}

struct CacheInner<K, V> {
    name: String,
    service: Arc<ServiceContext>,
    pool: Arc<dyn ThreadPool>,
    lookup_fn: LookupFn<K, V>,

    /// Self-synchronized, probed without the cache mutex on the fast path.
    /// Keys first live in `state.in_progress` and move here on publication.
    store: InvalidatingLruCache<K, V>,

    /// The cache mutex: protects the in-progress map and, transitively, the
    /// `valid` flag and cancel token of every in-progress entry, as well as
    /// the atomicity of the detach/publish transition.
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> Drop for CacheInner<K, V> {
    fn drop(&mut self) {
        // Callers must shut down the worker pool, which drains all scheduled
        // rounds, before destroying the cache.
        assert!(
            self.state.get_mut().in_progress.is_empty(),
            "read-through cache destroyed with in-progress lookups outstanding"
        );
    }
}

/// Bounded read-through cache with coalesced lookups and barrier-style
/// invalidation.
///
/// Cheap to clone; clones share the same store and in-progress state.
pub struct ReadThroughCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for ReadThroughCache<K, V> {
    fn clone(&self) -> Self {
        ReadThroughCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for ReadThroughCache<K, V>
where
    K: Clone + Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_progress = self
            .inner
            .state
            .try_lock()
            .map(|state| state.in_progress.len())
            .unwrap_or_default();
        f.debug_struct("ReadThroughCache")
            .field("name", &self.inner.name)
            .field("cached entries", &self.inner.store.len())
            .field("in-progress lookups", &in_progress)
            .finish()
    }
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a cache which fetches missing entries through `lookup`.
    ///
    /// The pool may be shared with other work, but it is mandatory that it is
    /// shut down and joined before the cache is destroyed, so that no
    /// asynchronous loading activity remains.
    ///
    /// `config.capacity` of zero disables storage, but several concurrent
    /// acquires for the same key still group together for a single lookup.
    pub fn new(
        config: CacheConfig,
        service: Arc<ServiceContext>,
        pool: Arc<dyn ThreadPool>,
        lookup: impl Fn(&OperationContext, &K) -> LookupResult<V> + Send + Sync + 'static,
    ) -> Self {
        ReadThroughCache {
            inner: Arc::new(CacheInner {
                name: config.name,
                service,
                pool,
                lookup_fn: Box::new(lookup),
                store: InvalidatingLruCache::new(config.capacity),
                state: Mutex::new(CacheState {
                    in_progress: HashMap::new(),
                }),
            }),
        }
    }

    /// Returns a future resolving to a handle for `key`.
    ///
    /// If the key is cached, the future is immediately ready. Otherwise the
    /// blocking lookup is scheduled asynchronously (or an already scheduled
    /// one is joined) and the future resolves when it completes: with a set
    /// handle on success, an empty handle if the backing store does not know
    /// the key, or an error if the lookup failed. Nothing is cached on
    /// failure or absence, so subsequent acquires kick off the lookup again.
    ///
    /// The returned handle may already be invalid by the time the caller gets
    /// to use it, if the key was invalidated in the meantime.
    pub fn acquire_async(&self, key: &K) -> ValueFuture<V> {
        metric!(counter("caches.access") += 1, "cache" => &self.inner.name);

        // Fast path
        if let Some(handle) = self.inner.store.get(key) {
            return ValueFuture::ready(Ok(handle));
        }

        let mut state = self.inner.state.lock();

        // Re-check the store under the mutex: an insertion may have raced in.
        if let Some(handle) = self.inner.store.get(key) {
            return ValueFuture::ready(Ok(handle));
        }

        // Join an in-progress lookup if one has already been scheduled.
        if let Some(lookup) = state.in_progress.get(key) {
            metric!(counter("caches.channel.hit") += 1, "cache" => &self.inner.name);
            return ValueFuture::waiting(lookup.add_waiter());
        }

        metric!(counter("caches.channel.miss") += 1, "cache" => &self.inner.name);
        let lookup = InProgressLookup::new();
        let channel = lookup.add_waiter();
        state.in_progress.insert(key.clone(), lookup);
        drop(state);

        // Synthetic non-cancellation status: the fresh entry is not valid
        // yet, so the loop schedules the first round.
        Arc::clone(&self.inner).lookup_while_not_valid(
            key.clone(),
            Err(CacheError::Lookup("lookup not started".into())),
        );

        ValueFuture::waiting(channel)
    }

    /// Blocking variant of [`acquire_async`](Self::acquire_async), waiting on
    /// the future with interruption through the caller's operation context.
    pub fn acquire(&self, op_ctx: &OperationContext, key: &K) -> Result<ValueHandle<V>, CacheError> {
        op_ctx
            .block_on(self.acquire_async(key))
            .map_err(|_| CacheError::Canceled)?
    }

    /// Invalidates `key` and immediately replaces it with `value`.
    ///
    /// A racing in-flight lookup observes the invalidation and retries rather
    /// than publishing its result over this one.
    pub fn insert_or_assign(&self, key: K, value: V, updated_at: SystemTime) -> ValueHandle<V> {
        let mut state = self.inner.state.lock();
        if let Some(lookup) = state.in_progress.get_mut(&key) {
            lookup.invalidate_and_cancel_current_round();
        }
        self.inner.store.insert_or_assign_and_get(key, value, updated_at)
    }

    /// Invalidation barrier for `key`.
    ///
    /// The cached entry, if any, is removed and handles to it flip invalid.
    /// An in-flight lookup is internally interrupted and rescheduled, as if
    /// `acquire_async` had been called after this invalidation.
    pub fn invalidate(&self, key: &K) {
        metric!(counter("caches.invalidation") += 1, "cache" => &self.inner.name);

        let mut state = self.inner.state.lock();
        if let Some(lookup) = state.in_progress.get_mut(key) {
            lookup.invalidate_and_cancel_current_round();
        }
        self.inner.store.invalidate(key);
    }

    /// Invalidates every key satisfying `predicate`, cached or in flight.
    /// The predicate only sees the key; stored values are not exposed.
    pub fn invalidate_if(&self, mut predicate: impl FnMut(&K) -> bool) {
        metric!(counter("caches.invalidation") += 1, "cache" => &self.inner.name);

        let mut state = self.inner.state.lock();
        for (key, lookup) in state.in_progress.iter_mut() {
            if predicate(key) {
                lookup.invalidate_and_cancel_current_round();
            }
        }
        self.inner.store.invalidate_if(predicate);
    }

    /// Invalidates all keys.
    pub fn invalidate_all(&self) {
        self.invalidate_if(|_| true);
    }

    /// Returns statistics information about the cache for reporting purposes.
    pub fn stats(&self) -> Vec<CachedItemInfo<K>> {
        self.inner.store.info()
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Asynchronous `while (!valid)` loop over `key`, which must be on the
    /// in-progress map. Runs once right after a fresh entry is emplaced and
    /// once at the completion of every lookup round.
    fn lookup_while_not_valid(self: Arc<Self>, key: K, round: LookupResult<V>) {
        let canceled = matches!(&round, Err(err) if err.is_canceled());

        let mut state = self.state.lock();
        let retry = {
            let lookup = state
                .in_progress
                .get(&key)
                .expect("lookup round completed for a key with no in-progress entry");
            !canceled && !lookup.valid
        };

        if retry {
            drop(state);
            metric!(counter("caches.lookup.retry") += 1, "cache" => &self.name);
            self.schedule_round(key);
            return;
        }

        // Detaching the active lookup and placing its result in the store
        // must be atomic with respect to a concurrent invalidation: the
        // invalidation either clears `valid` before the detach, forcing
        // another round, or finds the freshly published entry in the store.
        let lookup = state
            .in_progress
            .remove(&key)
            .expect("in-progress entry vanished under the cache mutex");

        let outcome = match round {
            Ok(Some(value)) => {
                tracing::trace!(cache = %self.name, key = ?key, "lookup succeeded, publishing to the store");
                Ok(self
                    .store
                    .insert_or_assign_and_get(key, value, self.service.now()))
            }
            Ok(None) => {
                tracing::trace!(cache = %self.name, key = ?key, "key not found in the backing store");
                Ok(ValueHandle::default())
            }
            Err(err) => {
                if err.is_canceled() {
                    metric!(counter("caches.lookup.canceled") += 1, "cache" => &self.name);
                }
                tracing::trace!(cache = %self.name, key = ?key, error = %err, "lookup failed");
                Err(err)
            }
        };
        drop(state);

        // Signaled outside the mutex so waiter callbacks never run under it.
        lookup.signal_waiters(outcome);
    }

    /// Schedules one lookup round for `key` on the worker pool, marking the
    /// in-progress entry valid and arming its cancel token.
    fn schedule_round(self: Arc<Self>, key: K) {
        metric!(counter("caches.lookup.round") += 1, "cache" => &self.name);
        tracing::trace!(cache = %self.name, key = ?key, "scheduling lookup round");

        let weak = Arc::downgrade(&self);
        let work_key = key.clone();
        let work: LookupWork = Box::new(move |ctx| {
            // The cache outlives every scheduled round in correct usage; see
            // the destruction precondition on `ReadThroughCache::new`.
            let Some(inner) = weak.upgrade() else { return };
            let round = match ctx {
                Ok(op_ctx) => {
                    let lookup = AssertUnwindSafe(|| (inner.lookup_fn)(op_ctx, &work_key));
                    match panic::catch_unwind(lookup) {
                        Ok(result) => result,
                        Err(_) => Err(CacheError::Lookup("lookup function panicked".into())),
                    }
                }
                Err(status) => Err(status),
            };
            inner.lookup_while_not_valid(work_key, round);
        });

        // The round must become valid and its token armed under the same
        // critical section that schedules the work, so that a completion or
        // an invalidation never observes a half-armed round.
        let mut state = self.state.lock();
        let token = work::schedule_lookup(&self.service, &self.pool, work);
        let lookup = state
            .in_progress
            .get_mut(&key)
            .expect("scheduling a round for a key with no in-progress entry");
        lookup.valid = true;
        lookup.cancel_token = Some(token);
    }
}
