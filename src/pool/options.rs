//! Pool configuration (spec.md §4.7 "Pool config").
//!
//! Grounded on `sqlx-core::pool::options::PoolOptions`'s builder shape,
//! stripped of its `Database` generic (this crate only ever pools
//! [`crate::connection::PgConnection`]) and its callback-trait machinery
//! simplified to plain boxed closures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::connect::Config;
use crate::connection::PgConnection;
use crate::error::PgError;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `BeforeConnect` (spec.md §9 "Hooks"): runs before a socket exists, so it
/// is given the resolved [`Config`] rather than a connection.
pub type BeforeConnectHook = Arc<dyn Fn(&mut Config) -> BoxFuture<'_, Result<(), PgError>> + Send + Sync>;

/// `AfterConnect`/`AfterRelease` (spec.md §4.7/§9 "Hooks"). Boxed rather
/// than generic so `PoolOptions` itself stays a plain, non-generic,
/// `Clone`-by-`Arc` struct.
pub type ConnectionHook =
    Arc<dyn Fn(&mut PgConnection) -> BoxFuture<'_, Result<(), PgError>> + Send + Sync>;

/// `BeforeAcquire`: may veto returning an idle connection by resolving to
/// `false`, in which case the pool destroys it and tries the next one.
pub type AcquireHook =
    Arc<dyn Fn(&mut PgConnection) -> BoxFuture<'_, Result<bool, PgError>> + Send + Sync>;

#[derive(Clone)]
pub struct PoolOptions {
    pub(crate) max_connections: u32,
    pub(crate) min_connections: u32,
    pub(crate) max_lifetime: Option<Duration>,
    pub(crate) max_lifetime_jitter: Duration,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) health_check_period: Duration,
    pub(crate) acquire_timeout: Duration,
    pub(crate) test_before_acquire: bool,
    pub(crate) before_connect: Option<BeforeConnectHook>,
    pub(crate) after_connect: Option<ConnectionHook>,
    pub(crate) before_acquire: Option<AcquireHook>,
    pub(crate) after_release: Option<AcquireHook>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions::new()
    }
}

impl PoolOptions {
    /// spec.md §4.7 "Pool config" defaults: `MaxConns = max(4, logical
    /// CPUs)`, `MinConns = 0`, `MaxConnLifetime = 1h`,
    /// `MaxConnLifetimeJitter = 0`, `MaxConnIdleTime = 30m`,
    /// `HealthCheckPeriod = 1m`.
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        PoolOptions {
            max_connections: cpus.max(4),
            min_connections: 0,
            max_lifetime: Some(Duration::from_secs(60 * 60)),
            max_lifetime_jitter: Duration::ZERO,
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            health_check_period: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
            test_before_acquire: true,
            before_connect: None,
            after_connect: None,
            before_acquire: None,
            after_release: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_lifetime(mut self, lifetime: impl Into<Option<Duration>>) -> Self {
        self.max_lifetime = lifetime.into();
        self
    }

    pub fn max_lifetime_jitter(mut self, jitter: Duration) -> Self {
        self.max_lifetime_jitter = jitter;
        self
    }

    pub fn idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.idle_timeout = timeout.into();
        self
    }

    pub fn health_check_period(mut self, period: Duration) -> Self {
        self.health_check_period = period;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn test_before_acquire(mut self, test: bool) -> Self {
        self.test_before_acquire = test;
        self
    }

    pub fn before_connect<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut Config) -> BoxFuture<'c, Result<(), PgError>> + Send + Sync + 'static,
    {
        self.before_connect = Some(Arc::new(hook));
        self
    }

    pub fn after_connect<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), PgError>> + Send + Sync + 'static,
    {
        self.after_connect = Some(Arc::new(hook));
        self
    }

    pub fn before_acquire<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<bool, PgError>> + Send + Sync + 'static,
    {
        self.before_acquire = Some(Arc::new(hook));
        self
    }

    pub fn after_release<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<bool, PgError>> + Send + Sync + 'static,
    {
        self.after_release = Some(Arc::new(hook));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = PoolOptions::new();
        assert!(opts.max_connections >= 4);
        assert_eq!(opts.min_connections, 0);
        assert_eq!(opts.max_lifetime, Some(Duration::from_secs(3600)));
        assert_eq!(opts.idle_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(opts.health_check_period, Duration::from_secs(60));
    }

    #[test]
    fn builder_overrides_are_independent() {
        let opts = PoolOptions::new().max_connections(64).min_connections(4);
        assert_eq!(opts.max_connections, 64);
        assert_eq!(opts.min_connections, 4);
    }
}
