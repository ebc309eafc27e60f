//! Outbound side of the proxy: connection pooling, timeout/Referer policy
//! and the single-request fetcher.

pub mod fetcher;
pub mod policy;
pub mod pool;

pub use fetcher::{FetchError, UpstreamFetcher, UpstreamRequest, UpstreamResponse};
pub use policy::{RefererPolicy, RequestKind, TimeoutBudgets, TimeoutClass, TimeoutPolicy};
pub use pool::{ConnectionPool, PoolLease, PoolSettings, PoolStats, PooledClient, Scheme};
