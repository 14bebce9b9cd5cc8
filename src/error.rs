use std::borrow::Cow;
use std::fmt;
use std::io;

/// Database-reported error, built from an `ErrorResponse` message's field set.
#[derive(Debug, Clone)]
pub struct PgDatabaseError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

impl PgDatabaseError {
    pub fn code(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.code)
    }
}

impl fmt::Display for PgDatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// The full error taxonomy (C8). Every fallible operation in this crate
/// returns one of these variants, never a bare `io::Error` or a panic, with
/// the single exception of programmer-error assertions noted in
/// `SPEC_FULL.md` (e.g. reusing an already-consumed deadline guard, which is
/// a type error rather than a runtime panic).
#[derive(Debug, thiserror::Error)]
pub enum PgError {
    /// The server returned an `ErrorResponse`. Most failures surface this way.
    #[error("database error: {0}")]
    Database(PgDatabaseError),

    /// A lower-level I/O failure (socket read/write, DNS resolution, ...).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS handshake or certificate-verification failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// The server sent bytes that do not parse as a well-formed frame, or
    /// sent a message that is not valid in the connection's current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A value could not be encoded/decoded for the wire.
    #[error("encode/decode error: {0}")]
    Codec(String),

    /// The server's host(s) produced no connectable address given the
    /// connection's `target_session_attrs` requirement (e.g. `read-write`
    /// requested but every reachable host is a standby).
    #[error("no suitable server was reachable")]
    NotPreferred(#[source] NotPreferredError),

    /// Building a [`crate::connect::Config`] from a connection string or the
    /// environment failed.
    #[error("invalid connection configuration: {0}")]
    ParseConfig(#[from] ParseConfigError),

    /// A pool- or connection-internal lock was poisoned or the owning task
    /// has gone away.
    #[error("connection lock error: {0}")]
    ConnLock(#[from] ConnLockError),

    /// An operation did not complete before its deadline/context expired.
    #[error("operation timed out")]
    Timeout(#[from] TimeoutError),

    /// The caller's context/deadline had already elapsed before the
    /// operation was attempted.
    #[error("context already done")]
    ContextAlreadyDone(#[from] ContextAlreadyDoneError),

    /// An extended-query pipeline was used without a matching `Sync`.
    #[error("pipeline was not synced before results were requested")]
    PipelineUnsynced(#[from] PipelineUnsyncedError),

    /// The background worker task for a connection has terminated; the
    /// connection handle is no longer usable.
    #[error("connection worker crashed: {0}")]
    WorkerCrashed(String),

    /// The connection pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// A prepared statement could not be reused (e.g. `max(65535)` bind
    /// parameter count exceeded).
    #[error("{0}")]
    Configuration(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("no server satisfying target_session_attrs was reachable; last error: {last_error}")]
pub struct NotPreferredError {
    pub last_error: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseConfigError {
    #[error("invalid connection URL: {0}")]
    InvalidUrl(String),
    #[error("invalid keyword/value connection string: {0}")]
    InvalidDsn(String),
    #[error("unknown connection parameter {0:?}")]
    UnknownParameter(String),
    #[error("invalid value {value:?} for parameter {param:?}")]
    InvalidValue { param: String, value: String },
    #[error("could not read passfile {path:?}: {reason}")]
    PassfileUnreadable { path: String, reason: String },
    #[error("could not read service file {path:?}: {reason}")]
    ServiceFileUnreadable { path: String, reason: String },
    #[error("unknown service {0:?} in pg_service.conf")]
    UnknownService(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("connection lock error: {0}")]
pub struct ConnLockError(pub String);

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("deadline exceeded")]
pub struct TimeoutError;

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("context was already done")]
pub struct ContextAlreadyDoneError;

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("pipeline has unsynced requests pending")]
pub struct PipelineUnsyncedError;

/// `ConnectError` wraps the subset of [`PgError`] that can occur while
/// establishing a new connection, plus a few connect-only failure modes.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ParseConfigError),
    #[error("io error connecting to {host}:{port}: {source}")]
    Io {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("server rejected SSL request")]
    SslRejected,
    #[error(transparent)]
    Protocol(#[from] PgError),
    #[error(transparent)]
    NotPreferred(#[from] NotPreferredError),
    #[error("authentication failed for user {user:?}: {message}")]
    AuthFailed { user: String, message: String },
}

pub type Result<T> = std::result::Result<T, PgError>;

/// Mirrors the spec's `SafeToRetry(err)` predicate: true for errors that
/// indicate no bytes of the failed request were durably applied (so a fresh
/// attempt, generally on a fresh connection, is safe), false otherwise.
pub fn safe_to_retry(err: &PgError) -> bool {
    match err {
        PgError::Io(_) => true,
        PgError::Timeout(_) => true,
        PgError::ContextAlreadyDone(_) => true,
        PgError::WorkerCrashed(_) => true,
        PgError::NotPreferred(_) => true,
        PgError::Database(db) => matches!(
            db.code.as_str(),
            // admin_shutdown, crash_shutdown, cannot_connect_now
            "57P01" | "57P02" | "57P03"
        ),
        _ => false,
    }
}

/// SQLSTATE classes that must stop the sslmode/host fallback chain
/// immediately rather than trying the next candidate (spec.md §4.6):
/// authentication and authorization failures, and "database does not
/// exist", are attributable to the target server, not to the transport
/// attempt, so retrying over a different transport can't help.
pub fn is_fatal_fallback_sqlstate(code: &str) -> bool {
    matches!(code, "28000" | "28P01" | "3D000" | "42501")
}

macro_rules! err_protocol {
    ($($arg:tt)*) => {
        $crate::error::PgError::Protocol(format!($($arg)*))
    };
}

pub(crate) use err_protocol;
