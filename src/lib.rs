//! Generic read-through cache with coalesced lookups and barrier-style
//! invalidation.
//!
//! The cache holds a bounded number of key→value entries and fetches absent
//! values through a caller-supplied blocking lookup function executed on a
//! worker pool:
//!
//! - Concurrent acquires for the same missing key share a single in-flight
//!   lookup.
//! - Invalidation acts as a barrier: a lookup in flight when the invalidation
//!   arrives is restarted, so every waiter observes data fetched strictly
//!   after the invalidation.
//! - Queued lookups can be canceled outright, and running ones are
//!   interrupted best-effort through their operation context.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use readthrough::{CacheConfig, ReadThroughCache, ServiceContext, WorkerPool};
//!
//! let service = Arc::new(ServiceContext::new("app"));
//! let pool = Arc::new(WorkerPool::new("lookup", 4));
//!
//! let cache = ReadThroughCache::new(
//!     CacheConfig::new("users", 1024),
//!     Arc::clone(&service),
//!     pool.clone(),
//!     |_ctx, key: &String| Ok(Some(format!("value for {key}"))),
//! );
//!
//! let client = service.make_client("request");
//! let op_ctx = client.make_operation_context();
//! let user = cache.acquire(&op_ctx, &"alice".to_string())?;
//! println!("{}", *user);
//! # Ok::<(), readthrough::CacheError>(())
//! ```

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod context;
pub mod lru;
pub mod threadpool;
pub mod work;


pub use crate::cache::{CacheError, LookupFn, LookupResult, ReadThroughCache, ValueFuture};
pub use crate::config::CacheConfig;
pub use crate::context::{Client, InterruptHandle, Interrupted, OperationContext, ServiceContext};
pub use crate::lru::{CachedItemInfo, InvalidatingLruCache, ValueHandle};
pub use crate::threadpool::{Task, ThreadPool, WorkerPool};
pub use crate::work::CancelToken;
