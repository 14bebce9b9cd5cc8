//! A low-level, non-concurrent PostgreSQL wire-protocol driver and
//! connection pool.
//!
//! This crate speaks the frontend/backend protocol (v3.0) directly: a
//! [`connection::PgConnection`] owns one socket and serializes requests
//! through `&mut self`; a [`pool::Pool`] manages many connections with
//! fair acquisition and idle/lifetime eviction; [`pipeline::Pipeline`]
//! batches several extended-query steps onto one round-trip; and
//! [`listen::PgListener`] subscribes to `LISTEN`/`NOTIFY` channels across
//! reconnects. Row/column values are handed back as raw bytes -- decoding
//! into Rust types is out of scope (see `SPEC_FULL.md`'s Non-goals).

pub mod connect;
pub mod connection;
pub mod error;
pub mod listen;
pub mod message;
pub mod net;
pub mod pipeline;
pub mod pool;
pub mod types;

pub use connect::Config;
pub use connection::{ConnStatus, PgConnection, Result_};
pub use error::{PgDatabaseError, PgError};
pub use listen::{Notification, PgListener};
pub use pipeline::{Pipeline, PipelineItem};
pub use pool::{Pool, PoolOptions, PooledConnection, PoolStat};
pub use types::{CommandTag, FieldDescription, QueryResult, Row, StatementDescription};
