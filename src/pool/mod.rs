//! The connection pool (C7): a fixed-capacity, fair pool over
//! [`PgConnection`]s (spec.md §4.7).
//!
//! Grounded on `sqlx-core::pool::{Pool, PoolConnection}`'s public surface
//! (`acquire`, a guard type that releases on `Drop`, `close`), with the
//! acquire/release algorithm itself in [`inner`].

pub mod health;
pub mod inner;
pub mod options;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

pub use options::PoolOptions;

use crate::connect::Config;
use crate::connection::PgConnection;
use crate::error::PgError;

use inner::{Idle, PoolInner};

/// A fixed-capacity, fair connection pool. Cheap to clone -- every clone
/// shares the same underlying [`PoolInner`].
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Builds a pool with default [`PoolOptions`] and opens `min_connections`
    /// eagerly if nonzero.
    pub async fn connect(config: Config) -> Result<Pool, PgError> {
        PoolOptions::new().connect_with(config).await
    }

    /// Builds a pool without opening any connections synchronously;
    /// `min_connections` (if set) is established by a background task
    /// (spec.md §4.7 "a background task will be spawned to optimistically
    /// establish that many connections").
    pub fn connect_lazy(config: Config, options: PoolOptions) -> Pool {
        let inner = PoolInner::new(config, options);
        let replenish = inner.clone();
        tokio::spawn(async move { replenish.replenish_min_connections().await });
        spawn_health_check_loop(inner.clone());
        Pool { inner }
    }

    /// spec.md §4.7 "Acquire(ctx)".
    pub async fn acquire(&self) -> Result<PooledConnection, PgError> {
        let idle = self.inner.acquire().await?;
        Ok(PooledConnection {
            pool: self.inner.clone(),
            idle: Some(idle),
        })
    }

    /// spec.md §4.7 "Pool close is idempotent".
    pub async fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn stat(&self) -> PoolStat {
        PoolStat {
            idle: self.inner.idle_count(),
            total: self.inner.total_count(),
            max: self.inner.options.max_connections as usize,
            new_conns: self.inner.counters.new_conns.load(std::sync::atomic::Ordering::Relaxed),
            lifetime_destroys: self
                .inner
                .counters
                .lifetime_destroys
                .load(std::sync::atomic::Ordering::Relaxed),
            idle_destroys: self.inner.counters.idle_destroys.load(std::sync::atomic::Ordering::Relaxed),
            canceled_acquires: self
                .inner
                .counters
                .canceled_acquires
                .load(std::sync::atomic::Ordering::Relaxed),
            empty_acquires: self.inner.counters.empty_acquires.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.connect_config
    }
}

impl PoolOptions {
    /// Create a new pool from this `PoolOptions` and immediately satisfy
    /// `min_connections`, testing at least one connection along the way.
    pub async fn connect_with(self, config: Config) -> Result<Pool, PgError> {
        let inner = PoolInner::new(config, self);
        inner.replenish_min_connections().await;
        if inner.options.min_connections == 0 {
            // Prove the configuration works before handing back a pool that
            // has never successfully opened anything.
            let idle = inner.acquire().await?;
            inner.release(idle).await;
        }
        spawn_health_check_loop(inner.clone());
        Ok(Pool { inner })
    }
}

/// spec.md §4.7's atomic counters, snapshotted.
#[derive(Debug, Clone, Copy)]
pub struct PoolStat {
    pub idle: usize,
    pub total: usize,
    pub max: usize,
    pub new_conns: u64,
    pub lifetime_destroys: u64,
    pub idle_destroys: u64,
    pub canceled_acquires: u64,
    pub empty_acquires: u64,
}

/// A checked-out connection. Returned to the pool's idle list (or
/// destroyed, per `AfterRelease`/liveness) when dropped.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    idle: Option<Idle>,
}

impl Deref for PooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.idle.as_ref().expect("PooledConnection used after release").conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.idle.as_mut().expect("PooledConnection used after release").conn
    }
}

impl PooledConnection {
    /// Detach this connection from the pool without returning it -- the
    /// underlying `PgConnection` is the caller's to close or leak. The
    /// pool's permit for this slot is released immediately, as if the
    /// connection had been destroyed.
    pub fn leak(mut self) -> PgConnection {
        self.idle.take().expect("PooledConnection used after release").conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(idle) = self.idle.take() else { return };
        let pool = self.pool.clone();
        tokio::spawn(async move {
            pool.release(idle).await;
        });
    }
}

fn spawn_health_check_loop(inner: Arc<PoolInner>) {
    let period = inner.options.health_check_period;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            if inner.is_closed() {
                return;
            }
            inner.run_health_check().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pool_stat_reports_configured_max() {
        let config = Config::default();
        let options = PoolOptions::new().max_connections(7).min_connections(0);
        let inner = PoolInner::new(config, options);
        let pool = Pool { inner };
        assert_eq!(pool.stat().max, 7);
        assert_eq!(pool.stat().total, 0);
    }

    #[tokio::test]
    async fn acquire_on_a_closed_pool_errors() {
        let config = Config::default();
        let options = PoolOptions::new().max_connections(2).acquire_timeout(Duration::from_millis(50));
        let inner = PoolInner::new(config, options);
        inner.close();
        let pool = Pool { inner };
        assert!(matches!(pool.acquire().await, Err(PgError::PoolClosed)));
    }
}
