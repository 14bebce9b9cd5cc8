//! The pool's shared state and acquire/release algorithm (spec.md §4.7).
//!
//! Grounded on `sqlx-core::pool::inner::PoolInner`'s permit-backed
//! capacity accounting, adapted to this crate's fair-FIFO-waiter /
//! LIFO-idle-reuse requirement using a plain [`tokio::sync::Semaphore`]
//! (itself FIFO) guarding a `Vec` idle stack, rather than an
//! `event_listener`-based waiter list -- `event_listener`/`ease_off` are
//! not part of this crate's dependency stack and `Semaphore` already gives
//! the same fairness guarantee spec.md asks for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::connect::Config;
use crate::connection::deadline::Deadline;
use crate::connection::PgConnection;
use crate::error::{ConnectError, PgError};

use super::health;
use super::options::PoolOptions;

/// A bound safely above anything a correctly-written `BeforeAcquire` hook
/// would ever trigger; exists only to turn a buggy hook's infinite
/// reject-loop into an error (spec.md §4.7 "infinite acquire loop").
const MAX_ACQUIRE_REJECTIONS: u32 = 1000;

#[derive(Debug, Default)]
pub struct PoolCounters {
    pub new_conns: AtomicU64,
    pub lifetime_destroys: AtomicU64,
    pub idle_destroys: AtomicU64,
    pub canceled_acquires: AtomicU64,
    pub empty_acquires: AtomicU64,
}

pub(crate) struct Idle {
    pub conn: PgConnection,
    pub permit: OwnedSemaphorePermit,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

pub struct PoolInner {
    pub(crate) connect_config: Config,
    pub(crate) options: PoolOptions,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Idle>>,
    closed: AtomicBool,
    pub(crate) counters: PoolCounters,
}

impl PoolInner {
    pub fn new(connect_config: Config, options: PoolOptions) -> Arc<PoolInner> {
        Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(options.max_connections as usize)),
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            connect_config,
            options,
            counters: PoolCounters::default(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent (spec.md §4.7 "Pool close is idempotent"). Closing the
    /// semaphore wakes every waiter with an error; the health-check loop
    /// observes `is_closed()` on its own next tick and exits.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.semaphore.close();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.try_lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn total_count(&self) -> usize {
        self.options.max_connections as usize - self.semaphore.available_permits()
    }

    /// spec.md §4.7 "Acquire(ctx)".
    pub async fn acquire(self: &Arc<Self>) -> Result<Idle, PgError> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }
        let deadline = Deadline::after(self.options.acquire_timeout);
        match deadline.race(self.acquire_inner()).await {
            Ok(idle) => Ok(idle),
            Err(e) => {
                self.counters.canceled_acquires.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn acquire_inner(self: &Arc<Self>) -> Result<Idle, PgError> {
        let mut rejections = 0u32;
        loop {
            if rejections >= MAX_ACQUIRE_REJECTIONS {
                return Err(PgError::Configuration(
                    "pool: BeforeAcquire rejected over 1000 consecutive idle connections".into(),
                ));
            }

            if let Some(mut idle) = self.idle.lock().await.pop_back() {
                if self.validate_idle(&mut idle).await {
                    idle.last_used_at = Instant::now();
                    return Ok(idle);
                }
                self.destroy(idle, &self.counters.idle_destroys);
                rejections += 1;
                continue;
            }

            self.counters.empty_acquires.fetch_add(1, Ordering::Relaxed);
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PgError::PoolClosed)?;
            return self.connect_new(permit).await;
        }
    }

    /// `test_before_acquire` (a liveness ping) then the `BeforeAcquire` hook.
    async fn validate_idle(&self, idle: &mut Idle) -> bool {
        if self.options.test_before_acquire && idle.conn.ping().await.is_err() {
            return false;
        }
        if let Some(hook) = &self.options.before_acquire {
            return matches!(hook(&mut idle.conn).await, Ok(true));
        }
        true
    }

    async fn connect_new(&self, permit: OwnedSemaphorePermit) -> Result<Idle, PgError> {
        let mut config = self.connect_config.clone();
        if let Some(hook) = &self.options.before_connect {
            hook(&mut config).await?;
        }

        let mut conn = PgConnection::connect(&config).await.map_err(connect_error_to_pg_error)?;

        if let Some(hook) = &self.options.after_connect {
            if let Err(e) = hook(&mut conn).await {
                conn.close_hard();
                return Err(e);
            }
        }

        self.counters.new_conns.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(Idle {
            conn,
            permit,
            created_at: now,
            last_used_at: now,
        })
    }

    /// spec.md §4.7 "Release(conn)". Runs synchronously except for the
    /// `AfterRelease` hook; [`super::PooledConnection::drop`] spawns this
    /// onto the runtime since `Drop` cannot `.await`. A connection whose
    /// owning future was dropped mid-await (e.g. wrapped in an external
    /// timeout) is left `Busy` with no `ReadyForQuery` ever observed for
    /// it, so `is_busy()` is checked alongside `is_closed()`/
    /// `in_transaction()` -- handing it back out would desync the next
    /// caller's reads from the still-outstanding response.
    pub async fn release(self: &Arc<Self>, mut idle: Idle) {
        if idle.conn.is_closed() || idle.conn.in_transaction() || idle.conn.is_busy() {
            self.destroy(idle, &self.counters.idle_destroys);
            return;
        }

        if let Some(hook) = &self.options.after_release {
            match hook(&mut idle.conn).await {
                Ok(true) => {}
                _ => {
                    self.destroy(idle, &self.counters.idle_destroys);
                    return;
                }
            }
        }

        idle.last_used_at = Instant::now();
        self.idle.lock().await.push_back(idle);
    }

    /// Drops the connection and its semaphore permit, freeing a slot for a
    /// waiter. spec.md calls the wire-level close "asynchronous" with a
    /// 15-second deadline; [`PgConnection::close`] (called via `Drop`'s
    /// target here) only enqueues a `Terminate` and tears down the worker
    /// channel, which already returns immediately, so no extra background
    /// task is needed to honor that deadline.
    fn destroy(&self, mut idle: Idle, counter: &AtomicU64) {
        idle.conn.close();
        counter.fetch_add(1, Ordering::Relaxed);
        drop(idle.permit);
    }

    /// spec.md §4.7 "if total < MinConns, construct idle connections in
    /// parallel up to MinConns". Used both at pool construction and by the
    /// health-check loop.
    pub async fn replenish_min_connections(self: &Arc<Self>) {
        let min = self.options.min_connections as usize;
        loop {
            if self.total_count() >= min || self.is_closed() {
                return;
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                return;
            };
            match self.connect_new(permit).await {
                Ok(idle) => self.idle.lock().await.push_back(idle),
                Err(e) => {
                    tracing::warn!(error = %e, "pool: failed to open a min_connections replacement");
                    return;
                }
            }
        }
    }

    /// spec.md §4.7 "Health-check loop", one pass. Runs on a timer in
    /// [`super::spawn_health_check_loop`].
    pub async fn run_health_check(self: &Arc<Self>) {
        let mut survivors = VecDeque::new();
        let mut idle = self.idle.lock().await;
        while let Some(entry) = idle.pop_front() {
            if health::is_past_lifetime(entry.created_at, &self.options) {
                self.destroy(entry, &self.counters.lifetime_destroys);
            } else if health::is_past_idle_timeout(entry.last_used_at, &self.options)
                && self.total_count() > self.options.min_connections as usize
            {
                self.destroy(entry, &self.counters.idle_destroys);
            } else {
                survivors.push_back(entry);
            }
        }
        *idle = survivors;
        drop(idle);

        self.replenish_min_connections().await;
    }
}

fn connect_error_to_pg_error(e: ConnectError) -> PgError {
    match e {
        ConnectError::Config(e) => PgError::ParseConfig(e),
        ConnectError::Io { source, .. } => PgError::Io(source),
        ConnectError::Tls(msg) => PgError::Tls(msg),
        ConnectError::SslRejected => PgError::Tls("server rejected SSL request".into()),
        ConnectError::Protocol(e) => e,
        ConnectError::NotPreferred(e) => PgError::NotPreferred(e),
        ConnectError::AuthFailed { user, message } => {
            PgError::Configuration(format!("authentication failed for user {user:?}: {message}"))
        }
    }
}
