//! The connection state machine (C4): the single non-concurrent handle a
//! caller interacts with. Owns a [`WorkerHandle`] (the live socket lives in
//! the spawned worker task), the resolved [`Config`] (kept for cancellation
//! and reconnects), and a per-connection prepared-statement cache.
//!
//! Grounded on `sqlx-postgres::connection::{establish, executor, mod}`; see
//! `DESIGN.md`'s "Corrected worker architecture" for the one deliberate
//! deviation from the retrieved source.

pub mod cancel;
pub mod copy;
pub mod deadline;
pub mod establish;
pub mod executor;
pub(crate) mod response;
mod sasl;
pub mod worker;

mod shared;

use std::sync::Arc;
use std::time::Duration;

use hashlink::LruCache;

use crate::connect::Config;
use crate::error::{err_protocol, ConnectError, PgError};
use crate::message::{Bind, Close, Describe, DescribeTarget, Execute, Parse, ParameterDescription, Query, RowDescription, Sync as SyncMsg};
use crate::types::{FieldDescription, QueryResult, Row, StatementDescription};

use self::executor::Statement;
use self::response::ResponseReader;
use self::worker::{PipeUntil, WorkerHandle};

pub use shared::Shared;

/// Lifecycle status (spec.md §3 "Connection"). `Busy` only exists between
/// dispatching a request and observing its `ReadyForQuery`; since this
/// driver serializes every request through `&mut self`, the type system
/// already prevents two requests from overlapping, so `Busy` here is purely
/// informational (surfaced via [`PgConnection::is_busy`]) rather than a
/// runtime guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Idle,
    Busy,
    Closed,
}

/// One query result plus the rows it produced, as returned to the caller.
/// A thin, caller-facing wrapper over [`executor::Statement`].
#[derive(Debug, Clone, Default)]
pub struct Result_ {
    pub command_tag_rows: QueryResult,
    pub rows: Vec<Row>,
}

impl From<Statement> for Result_ {
    fn from(s: Statement) -> Self {
        Result_ {
            command_tag_rows: s.result,
            rows: s.rows,
        }
    }
}

/// The non-concurrent connection handle (spec.md §3/§6 `Connection`).
pub struct PgConnection {
    handle: WorkerHandle,
    config: Config,
    status: ConnStatus,
    statement_cache: LruCache<String, CachedStatement>,
    next_statement_id: u64,
    recover_timeout: Duration,
    /// Lazily attached by [`PgConnection::receive_message`]; kept across
    /// calls so no delivery between two `receive_message` calls is lost.
    notify_receiver: Option<futures_channel::mpsc::UnboundedReceiver<crate::message::NotificationResponse>>,
}

impl PgConnection {
    /// Try each `(host, port)` from `config.addrs()` in order, honoring
    /// `sslmode`'s transport-fallback ordering (`SslMode::attempts()`) per
    /// host, and stopping the whole fallback chain immediately on a fatal
    /// auth/permission SQLSTATE (spec.md §4.4 "Authentication failure
    /// codes"). `target_session_attrs` filtering beyond `any` is left to the
    /// pool's `BeforeAcquire`-equivalent validation hook in `src/pool`,
    /// matching spec.md §4.4's ValidateConnect design.
    pub async fn connect(config: &Config) -> Result<PgConnection, ConnectError> {
        let addrs = config.addrs();
        if addrs.is_empty() {
            return Err(ConnectError::Config(crate::error::ParseConfigError::InvalidDsn(
                "no host to connect to".into(),
            )));
        }

        let mut last_err = None;
        for (host, port) in addrs {
            match establish::establish(config, &host, port).await {
                Ok(handle) => {
                    return Ok(PgConnection {
                        handle,
                        config: config.clone(),
                        status: ConnStatus::Idle,
                        statement_cache: LruCache::new_unbounded(),
                        next_statement_id: 0,
                        recover_timeout: Duration::from_secs(30),
                        notify_receiver: None,
                    });
                }
                Err(e) => {
                    // Auth failures and the fatal SQLSTATE classes are
                    // attributable to the target server, not the transport
                    // attempt, so a different host/sslmode combination can't
                    // help either -- stop the fallback chain immediately.
                    let fatal = matches!(&e, ConnectError::AuthFailed { .. })
                        || matches!(
                            &e,
                            ConnectError::Protocol(PgError::Database(db))
                                if crate::error::is_fatal_fallback_sqlstate(&db.code)
                        );
                    last_err = Some(e);
                    if fatal {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(ConnectError::Config(crate::error::ParseConfigError::InvalidDsn(
            "no candidate address produced a connection".into(),
        ))))
    }

    /// Simple query protocol (spec.md §4.4 "Simple query (Exec)"): may
    /// contain several `;`-separated statements, yielding one `Result_` per
    /// `CommandComplete`/`EmptyQueryResponse`.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<Result_>, PgError> {
        self.status = ConnStatus::Busy;
        let mut buf = Vec::new();
        Query(sql).encode(&mut buf);

        let rx = self.handle.pipe(buf, PipeUntil::ReadyForQuery)?;
        let mut reader = ResponseReader::new(rx);
        let result = executor::run_simple_query(&mut reader).await;
        self.status = ConnStatus::Idle;
        result.map(|stmts| stmts.into_iter().map(Result_::from).collect())
    }

    /// Extended query protocol with an unnamed, one-shot statement
    /// (spec.md's `ExecParams`): `Parse` + `Bind` + `Describe(Portal)` +
    /// `Execute` + `Sync`. Rejects more than 65535 parameters rather than
    /// panicking, per the boundary test in spec.md §8 (the spec's own
    /// "Panics if len > 65535" is downgraded to a returned error, matching
    /// this crate's no-panics-on-caller-input policy).
    pub async fn query_params(
        &mut self,
        sql: &str,
        params: &[Option<&[u8]>],
    ) -> Result<Result_, PgError> {
        self.status = ConnStatus::Busy;
        let mut buf = Vec::new();
        Parse {
            statement: "",
            sql,
            param_types: &[],
        }
        .encode(&mut buf);
        Bind {
            portal: "",
            statement: "",
            param_formats: &[],
            params,
            result_formats: &[],
        }
        .encode(&mut buf)?;
        Describe {
            target: DescribeTarget::Portal,
            name: "",
        }
        .encode(&mut buf);
        Execute { portal: "", max_rows: 0 }.encode(&mut buf);
        SyncMsg.encode(&mut buf);

        let rx = self.handle.pipe(buf, PipeUntil::ReadyForQuery)?;
        let mut reader = ResponseReader::new(rx);
        let result = executor::run_extended_query(&mut reader).await;
        self.status = ConnStatus::Idle;
        result.map(Result_::from)
    }

    /// Extended query protocol against an already-[`prepare`](Self::prepare)d
    /// statement name (spec.md's `ExecPrepared`).
    pub async fn query_prepared(
        &mut self,
        statement: &Arc<StatementDescription>,
        statement_name: &str,
        params: &[Option<&[u8]>],
    ) -> Result<Result_, PgError> {
        let _ = statement; // field metadata already known to the caller via `StatementDescription`
        self.status = ConnStatus::Busy;
        let mut buf = Vec::new();
        Bind {
            portal: "",
            statement: statement_name,
            param_formats: &[],
            params,
            result_formats: &[],
        }
        .encode(&mut buf)?;
        Describe {
            target: DescribeTarget::Portal,
            name: "",
        }
        .encode(&mut buf);
        Execute { portal: "", max_rows: 0 }.encode(&mut buf);
        SyncMsg.encode(&mut buf);

        let rx = self.handle.pipe(buf, PipeUntil::ReadyForQuery)?;
        let mut reader = ResponseReader::new(rx);
        let result = executor::run_extended_query(&mut reader).await;
        self.status = ConnStatus::Idle;
        result.map(Result_::from)
    }

    /// `Parse` + `Describe(Statement)` + `Sync` (spec.md §4.4 "Prepare").
    /// A cache hit skips the round-trip entirely; a cache miss that evicts
    /// an existing entry closes the evicted statement first (`SPEC_FULL.md`
    /// §3 "StatementCache eviction").
    pub async fn prepare(&mut self, sql: &str) -> Result<(String, Arc<StatementDescription>), PgError> {
        if let Some(cached) = self.statement_cache.get(sql) {
            // `hashlink::LruCache::get` already promotes the entry to
            // most-recently-used.
            return Ok((cached.name.clone(), cached.description.clone()));
        }

        let name = format!("pgwc_s{}", self.next_statement_id);
        self.next_statement_id += 1;

        self.status = ConnStatus::Busy;
        let mut buf = Vec::new();
        Parse {
            statement: &name,
            sql,
            param_types: &[],
        }
        .encode(&mut buf);
        Describe {
            target: DescribeTarget::Statement,
            name: &name,
        }
        .encode(&mut buf);
        SyncMsg.encode(&mut buf);

        let rx = self.handle.pipe(buf, PipeUntil::ReadyForQuery)?;
        let mut reader = ResponseReader::new(rx);

        // Parse + Describe(Statement) + Sync always replies, in order:
        // ParseComplete, ParameterDescription, RowDescription|NoData,
        // ReadyForQuery.
        let parse_complete = reader.recv().await?;
        if parse_complete.format != crate::message::BackendMessageFormat::ParseComplete {
            return Err(err_protocol!(
                "expected ParseComplete, got: {:?}",
                parse_complete.format
            ));
        }
        let param_types: ParameterDescription = reader.recv_expect().await?;

        let msg = reader.recv().await?;
        let fields: Vec<FieldDescription> = match msg.format {
            crate::message::BackendMessageFormat::RowDescription => {
                let rd: RowDescription = msg.decode()?;
                rd.fields
            }
            crate::message::BackendMessageFormat::NoData => Vec::new(),
            other => return Err(err_protocol!("unexpected message after Describe: {other:?}")),
        };

        reader.wait_ready_for_query().await?;
        self.status = ConnStatus::Idle;

        let description = Arc::new(StatementDescription {
            param_types: param_types.types,
            fields: Arc::new(fields),
        });

        // Capacity 0 disables the *cache* (every `prepare()` call for the
        // same SQL re-runs Parse/Describe), but the statement this call just
        // created must stay open on the server until the caller executes
        // it, so it's simply never inserted -- not eagerly closed.
        if self.config.statement_cache_capacity == 0 {
            return Ok((name, description));
        }

        if self.statement_cache.len() >= self.config.statement_cache_capacity {
            if let Some((_, evicted)) = self.statement_cache.remove_lru() {
                self.close_statement(&evicted.name).await?;
            }
        }
        self.statement_cache.insert(
            sql.to_string(),
            CachedStatement {
                name: name.clone(),
                description: description.clone(),
            },
        );

        Ok((name, description))
    }

    /// Writes already-framed bytes and returns the response channel for
    /// them, for callers (namely [`crate::pipeline::Pipeline`]) that build
    /// their own multi-message buffers instead of going through one of the
    /// query methods above.
    pub(crate) fn pipe_raw(
        &mut self,
        data: Vec<u8>,
        ends_at: PipeUntil,
    ) -> Result<futures_channel::mpsc::UnboundedReceiver<crate::message::ReceivedMessage>, PgError> {
        self.status = ConnStatus::Busy;
        let rx = self.handle.pipe(data, ends_at)?;
        self.status = ConnStatus::Idle;
        Ok(rx)
    }

    async fn close_statement(&mut self, name: &str) -> Result<(), PgError> {
        let mut buf = Vec::new();
        Close {
            target: DescribeTarget::Statement,
            name,
        }
        .encode(&mut buf);
        SyncMsg.encode(&mut buf);

        let rx = self.handle.pipe(buf, PipeUntil::ReadyForQuery)?;
        let mut reader = ResponseReader::new(rx);
        reader.wait_for_close_complete(1).await?;
        reader.wait_ready_for_query().await?;
        Ok(())
    }

    /// `Exec("")` round-trip used as an active liveness probe. Distinct
    /// from [`PgConnection::check_conn`] (spec.md §6 `CheckConn`), which
    /// never writes to the wire -- this one does, and is what the pool's
    /// `test_before_acquire` option uses.
    pub async fn ping(&mut self) -> Result<(), PgError> {
        self.simple_query("").await.map(|_| ())
    }

    /// `CheckConn`: a non-blocking check for bytes the server has already
    /// sent unprompted (e.g. it closed the connection, or pushed a
    /// `NOTIFY` ahead of a `NOTIFY`-unrelated request). Never waits for new
    /// bytes to arrive and never writes anything -- see
    /// `BufferedSocket::peek_available`.
    pub async fn check_conn(&mut self) -> Result<bool, PgError> {
        self.handle.check_conn().await
    }

    /// `EscapeString`: doubles every `'` in `s`, without adding surrounding
    /// quotes. Rejects unless the session has already reported
    /// `standard_conforming_strings=on` and `client_encoding=UTF8`; outside
    /// that combination, backslash-escape rules differ enough that naive
    /// quote-doubling is not a safe escape.
    pub fn escape_string(&self, s: &str) -> Result<String, PgError> {
        let conforms = self.parameter_status("standard_conforming_strings");
        let encoding = self.parameter_status("client_encoding");
        if conforms.as_deref() != Some("on") || encoding.as_deref() != Some("UTF8") {
            return Err(PgError::Configuration(
                "escape_string requires standard_conforming_strings=on and client_encoding=UTF8".into(),
            ));
        }
        Ok(s.replace('\'', "''"))
    }

    /// `ReceiveMessage`: wait for the next asynchronous message the server
    /// pushes outside of any query response -- currently only `NOTIFY`
    /// deliveries. [`crate::listen::PgListener`] is built on the same
    /// `Shared` notification slot; attaching both to one connection races
    /// for it. The subscriber is attached once and reused across calls so
    /// no notification between two calls is missed.
    pub async fn receive_message(&mut self) -> Result<crate::message::NotificationResponse, PgError> {
        if self.notify_receiver.is_none() {
            let (tx, rx) = futures_channel::mpsc::unbounded();
            self.handle.shared().set_notify_sender(Some(tx));
            self.notify_receiver = Some(rx);
        }
        futures_util::StreamExt::next(self.notify_receiver.as_mut().expect("just set above"))
            .await
            .ok_or_else(|| PgError::WorkerCrashed("worker task is no longer running".into()))
    }

    /// `CleanupDone`: whether `Close`'s wire-level teardown has finished.
    /// [`PgConnection::close`] only ever enqueues a `Terminate` and tears
    /// down the worker channel, both of which complete synchronously, so
    /// there is no asynchronous cleanup window to poll here -- this simply
    /// reports whether `close`/`close_hard` has already run.
    pub fn cleanup_done(&self) -> bool {
        self.is_closed()
    }

    /// The backend process id and cancel secret from `BackendKeyData`,
    /// needed to build a [`cancel::send_cancel_request`] call.
    pub fn process_id_and_secret(&self) -> Option<(u32, u32)> {
        self.handle.shared().backend_key_data()
    }

    pub fn parameter_status(&self, name: &str) -> Option<String> {
        self.handle.shared().parameter_status(name)
    }

    pub fn server_version_num(&self) -> Option<u32> {
        self.handle.shared().server_version_num()
    }

    pub fn transaction_status(&self) -> crate::message::TransactionStatus {
        self.handle.shared().transaction_status()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_status() != crate::message::TransactionStatus::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.status == ConnStatus::Busy
    }

    pub fn is_closed(&self) -> bool {
        self.status == ConnStatus::Closed
    }

    pub fn cached_statements_size(&self) -> usize {
        self.statement_cache.len()
    }

    pub fn clear_cached_statements(&mut self) {
        self.statement_cache.clear();
    }

    /// Releases the worker's read/write buffers back to their default size
    /// after handling an unusually large message. Fire-and-forget; see
    /// `connection::worker`'s `WorkerMsg::ShrinkBuffers`.
    pub fn shrink_buffers(&self) -> Result<(), PgError> {
        self.handle.shrink_buffers()
    }

    /// Exposes the shared notification sender slot so [`crate::listen`] can
    /// attach a channel without reaching into [`WorkerHandle`] directly.
    pub(crate) fn shared(&self) -> &Shared {
        self.handle.shared()
    }

    /// Fire-and-forget `Query` with no response channel of its own, for
    /// teardown paths (e.g. [`crate::listen::PgListener`]'s `Drop`) that
    /// cannot await a reply.
    pub(crate) fn queue_simple_query(&self, sql: &str) {
        let mut buf = Vec::new();
        Query(sql).encode(&mut buf);
        let _ = self.handle.write_only(buf);
    }

    /// Graceful close: sends `Terminate` and drops the channel so the
    /// worker flushes and shuts the socket down cleanly. Idempotent, per
    /// spec.md §8 "Closing an already-closed Connection is a no-op".
    pub fn close(&mut self) {
        if self.status == ConnStatus::Closed {
            return;
        }
        let mut buf = Vec::new();
        crate::message::Terminate.encode(&mut buf);
        let _ = self.handle.write_only(buf);
        self.handle.close();
        self.status = ConnStatus::Closed;
    }

    /// Asynchronous close (spec.md §4.4 "Asynchronous close"): used when a
    /// non-retryable error forces teardown mid-query. There is no separate
    /// background task to spawn in this design -- the worker already owns
    /// the only handle to the socket, so marking the connection `Closed`
    /// and dropping the handle *is* the asynchronous teardown; the worker's
    /// own shutdown path (flush outstanding writes, then close the socket)
    /// runs independently of this call returning.
    pub fn close_hard(&mut self) {
        self.status = ConnStatus::Closed;
        self.handle.close();
    }

    /// Drain the socket back to a known-good `Idle` state after a timeout
    /// aborted an in-flight request (spec.md §4.4 "Recovery"). Discards
    /// messages until `ReadyForQuery` (a `57014 query_canceled` error is
    /// expected and not treated as a recovery failure), then issues
    /// `ROLLBACK` if the transaction status isn't `I` and drains that too.
    pub async fn recover(&mut self) -> Result<(), PgError> {
        let deadline = deadline::Deadline::after(self.recover_timeout);
        deadline.race(self.recover_inner()).await
    }

    async fn recover_inner(&mut self) -> Result<(), PgError> {
        // The aborted request's own response channel was dropped along with
        // its future, but the worker may already have routed some of its
        // trailing frames nowhere; the fastest way back to a known state
        // from here is a fresh round-trip that's guaranteed to end in
        // ReadyForQuery.
        if self.in_transaction() {
            self.simple_query("ROLLBACK").await.or_else(|e| match e {
                PgError::Database(ref db) if db.code == "57014" => Ok(Vec::new()),
                other => Err(other),
            })?;
        } else {
            self.ping().await?;
        }
        self.status = ConnStatus::Idle;
        Ok(())
    }
}

/// A cached prepared statement: its server-side name plus the metadata
/// `Describe` returned for it.
struct CachedStatement {
    name: String,
    description: Arc<StatementDescription>,
}
