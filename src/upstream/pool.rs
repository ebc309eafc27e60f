//! Keep-alive connection pool, one client per scheme.
//!
//! reqwest already reuses idle connections; what it does not do is cap the
//! number of concurrent exchanges. Each scheme therefore carries a semaphore
//! sized to the socket budget, and every outbound request holds a
//! [`PoolLease`] until its body is fully consumed or dropped. Requests beyond
//! the budget queue on the semaphore instead of opening new sockets.
//!
//! The pool is built once at startup and shared through the application
//! state for the life of the process.

use reqwest::Client;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;
use url::Url;

/// Default cap on concurrent upstream exchanges per scheme.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
/// Default idle connections kept per host.
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 32;
/// Default lifetime of an idle pooled connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// Concurrent exchanges allowed per scheme.
    pub max_connections: usize,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn from_url(url: &Url) -> Option<Self> {
        match url.scheme() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Snapshot of lease accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    pub in_use: u64,
}

#[derive(Debug)]
struct SchemePool {
    client: Client,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Default)]
struct LeaseCounters {
    acquired: AtomicU64,
    released: AtomicU64,
}

#[derive(Debug)]
struct PoolInner {
    http: SchemePool,
    https: SchemePool,
    counters: LeaseCounters,
}

/// Shared handle to the process-wide pool. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// A client plus the lease that accounts for its use.
///
/// Keep the lease alive for as long as the upstream response (or its body
/// stream) is alive; dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct PooledClient {
    pub client: Client,
    pub lease: PoolLease,
}

#[derive(Debug, thiserror::Error)]
#[error("connection pool for {0} is closed")]
pub struct PoolClosed(&'static str);

impl ConnectionPool {
    pub fn new(settings: &PoolSettings) -> Result<Self, reqwest::Error> {
        // Both clients may follow a redirect into the other scheme; the lease
        // stays with the scheme of the requested URL.
        let scheme_pool = || -> Result<SchemePool, reqwest::Error> {
            let client = Client::builder()
                .pool_max_idle_per_host(settings.max_idle_per_host)
                .pool_idle_timeout(settings.idle_timeout)
                .tcp_keepalive(TCP_KEEPALIVE)
                .connect_timeout(CONNECT_TIMEOUT)
                .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
                .build()?;

            Ok(SchemePool {
                client,
                permits: Arc::new(Semaphore::new(settings.max_connections.max(1))),
            })
        };

        Ok(Self {
            inner: Arc::new(PoolInner {
                http: scheme_pool()?,
                https: scheme_pool()?,
                counters: LeaseCounters::default(),
            }),
        })
    }

    /// Wait for a free slot and hand out the shared client for `scheme`.
    ///
    /// Callers bound the wait with their own timeout budget.
    pub async fn acquire(&self, scheme: Scheme) -> Result<PooledClient, PoolClosed> {
        let pool = match scheme {
            Scheme::Http => &self.inner.http,
            Scheme::Https => &self.inner.https,
        };

        let permit = pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed(scheme.as_str()))?;

        self.inner.counters.acquired.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Pool lease acquired ({}, {} slots free)",
            scheme.as_str(),
            pool.permits.available_permits()
        );

        Ok(PooledClient {
            client: pool.client.clone(),
            lease: PoolLease {
                _permit: permit,
                inner: Arc::clone(&self.inner),
                scheme,
            },
        })
    }

    pub fn stats(&self) -> PoolStats {
        let acquired = self.inner.counters.acquired.load(Ordering::Relaxed);
        let released = self.inner.counters.released.load(Ordering::Relaxed);
        PoolStats {
            acquired,
            released,
            in_use: acquired.saturating_sub(released),
        }
    }
}

/// One slot of the socket budget. Released on drop.
#[derive(Debug)]
pub struct PoolLease {
    _permit: OwnedSemaphorePermit,
    inner: Arc<PoolInner>,
    scheme: Scheme,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.inner.counters.released.fetch_add(1, Ordering::Relaxed);
        trace!("Pool lease released ({})", self.scheme.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_connections: usize) -> ConnectionPool {
        ConnectionPool::new(&PoolSettings {
            max_connections,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn scheme_from_url() {
        let http = Url::parse("http://a.example/x").unwrap();
        let https = Url::parse("https://a.example/x").unwrap();
        let ftp = Url::parse("ftp://a.example/x").unwrap();

        assert_eq!(Scheme::from_url(&http), Some(Scheme::Http));
        assert_eq!(Scheme::from_url(&https), Some(Scheme::Https));
        assert_eq!(Scheme::from_url(&ftp), None);
    }

    #[tokio::test]
    async fn lease_drop_releases_slot() {
        let pool = small_pool(2);

        let first = pool.acquire(Scheme::Https).await.unwrap();
        let second = pool.acquire(Scheme::Https).await.unwrap();
        assert_eq!(pool.stats().in_use, 2);

        drop(first);
        assert_eq!(
            pool.stats(),
            PoolStats {
                acquired: 2,
                released: 1,
                in_use: 1
            }
        );

        drop(second);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn acquire_queues_when_budget_exhausted() {
        let pool = small_pool(1);
        let held = pool.acquire(Scheme::Http).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire(Scheme::Http)).await;
        assert!(waiting.is_err(), "second acquire should queue while the slot is held");

        drop(held);
        let granted = tokio::time::timeout(Duration::from_millis(50), pool.acquire(Scheme::Http)).await;
        assert!(granted.is_ok(), "slot should be granted once released");
    }

    #[tokio::test]
    async fn schemes_have_independent_budgets() {
        let pool = small_pool(1);
        let _http = pool.acquire(Scheme::Http).await.unwrap();

        let https = tokio::time::timeout(Duration::from_millis(50), pool.acquire(Scheme::Https)).await;
        assert!(https.is_ok(), "https budget is separate from http");
    }

    #[tokio::test]
    async fn https_client_follows_downgrade_to_http() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&origin)
            .await;

        // Where an https origin redirects to plain http, the https client
        // carries on with the http URL.
        let pool = small_pool(1);
        let PooledClient { client, lease } = pool.acquire(Scheme::Https).await.unwrap();
        let response = client
            .get(format!("{}/seg.ts", origin.uri()))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        drop(lease);
        assert_eq!(pool.stats().in_use, 0);
    }
}
