//! Query execution (C4): drives the simple query protocol and the extended
//! query protocol's row-producing path over an already-open worker channel.
//!
//! Grounded on `sqlx-postgres::connection::row_stream.rs`'s message-dispatch
//! state machine (`BindComplete`/`ParseComplete`/`ParameterDescription`/
//! `NoData`/`RowDescription`/`DataRow`/`CommandComplete`/`ReadyForQuery`),
//! adapted to accumulate `QueryResult`s instead of yielding a `Stream`.

use std::sync::Arc;

use crate::error::{err_protocol, PgError};
use crate::message::{BackendMessageFormat, CommandComplete, DataRow, RowDescription};
use crate::types::{FieldDescription, QueryResult, Row};

use super::response::ResponseReader;

/// One statement's worth of rows plus its `CommandComplete` tag.
#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub result: QueryResult,
    pub rows: Vec<Row>,
}

/// Drain a simple-query response (one or more statements, terminated by
/// `ReadyForQuery`) into one `Statement` per `CommandComplete`/
/// `EmptyQueryResponse`. An `ErrorResponse` observed mid-stream ends the
/// statement currently accumulating but does not stop the drain -- the
/// server may still send results for statements before the failing one in
/// a multi-statement `Query` (spec.md §4.4's "subsequent results ... must
/// not crash the client").
pub async fn run_simple_query(reader: &mut ResponseReader) -> Result<Vec<Statement>, PgError> {
    let mut statements = Vec::new();
    let mut fields: Option<Arc<Vec<FieldDescription>>> = None;
    let mut current = Statement::default();
    let mut first_error: Option<PgError> = None;

    loop {
        let msg = match reader.recv().await {
            Ok(msg) => msg,
            Err(e @ PgError::Database(_)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
                // Resynchronize: a simple Query has no Sync of its own, so
                // the remaining messages up to ReadyForQuery still belong to
                // this same exchange.
                reader.wait_ready_for_query().await?;
                break;
            }
            Err(e) => return Err(e),
        };

        match msg.format {
            BackendMessageFormat::RowDescription => {
                let rd: RowDescription = msg.decode()?;
                fields = Some(Arc::new(rd.fields));
            }
            BackendMessageFormat::DataRow => {
                let Some(fields) = fields.clone() else {
                    return Err(err_protocol!("DataRow with no preceding RowDescription"));
                };
                let row: DataRow = msg.decode()?;
                current.rows.push(Row {
                    fields,
                    values: row.values,
                });
            }
            BackendMessageFormat::CommandComplete => {
                let cc: CommandComplete = msg.decode()?;
                current.result.rows_affected = cc.rows_affected();
                statements.push(std::mem::take(&mut current));
                fields = None;
            }
            BackendMessageFormat::EmptyQueryResponse => {
                statements.push(std::mem::take(&mut current));
                fields = None;
            }
            BackendMessageFormat::ReadyForQuery => break,
            _ => {}
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(statements)
}

/// Drain the response to one extended-query cycle (`Parse`?/`Bind`/
/// `Describe`?/`Execute`/`Sync`): `ParseComplete`/`BindComplete`/`NoData`/
/// `CloseComplete`/`PortalSuspended` are acknowledgements with nothing to
/// extract; `RowDescription` (re)establishes the row metadata for the
/// `DataRow`s that follow it.
pub async fn run_extended_query(reader: &mut ResponseReader) -> Result<Statement, PgError> {
    let mut fields: Option<Arc<Vec<FieldDescription>>> = None;
    let mut statement = Statement::default();

    loop {
        let msg = reader.recv().await?;
        match msg.format {
            BackendMessageFormat::ParseComplete
            | BackendMessageFormat::BindComplete
            | BackendMessageFormat::NoData
            | BackendMessageFormat::CloseComplete
            | BackendMessageFormat::PortalSuspended => {}
            BackendMessageFormat::RowDescription => {
                let rd: RowDescription = msg.decode()?;
                fields = Some(Arc::new(rd.fields));
            }
            BackendMessageFormat::DataRow => {
                let Some(fields) = fields.clone() else {
                    return Err(err_protocol!("DataRow with no preceding RowDescription"));
                };
                let row: DataRow = msg.decode()?;
                statement.rows.push(Row {
                    fields,
                    values: row.values,
                });
            }
            BackendMessageFormat::CommandComplete => {
                let cc: CommandComplete = msg.decode()?;
                statement.result.rows_affected = cc.rows_affected();
            }
            BackendMessageFormat::EmptyQueryResponse => {}
            BackendMessageFormat::ReadyForQuery => break,
            other => return Err(err_protocol!("unexpected message during query execution: {other:?}")),
        }
    }

    Ok(statement)
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
        buf.extend_from_slice(&1u16.to_be_bytes()); // one column
        buf.extend_from_slice(b"id\0");
        buf.extend_from_slice(&0u32.to_be_bytes()); // table_oid
        buf.extend_from_slice(&0i16.to_be_bytes()); // column_id
        buf.extend_from_slice(&23u32.to_be_bytes()); // type_oid (int4)
        buf.extend_from_slice(&4i16.to_be_bytes()); // type_size
        buf.extend_from_slice(&(-1i32).to_be_bytes()); // type_modifier
        buf.extend_from_slice(&0i16.to_be_bytes()); // format
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
    async fn simple_query_collects_one_statement_per_command_complete() {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(msg(BackendMessageFormat::RowDescription, &row_description_bytes()))
            .unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::DataRow, &data_row_bytes(b"7")))
            .unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::CommandComplete, b"SELECT 1\0"))
            .unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::ReadyForQuery, b"I"))
            .unwrap();
        drop(tx);

        let mut reader = ResponseReader::new(rx);
        let statements = run_simple_query(&mut reader).await.unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].result.rows_affected, 1);
        assert_eq!(statements[0].rows.len(), 1);
        assert_eq!(statements[0].rows[0].get(0), Some(&b"7"[..]));
    }

    #[tokio::test]
    async fn simple_query_multi_statement_continues_after_error() {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(msg(BackendMessageFormat::CommandComplete, b"INSERT 0 1\0"))
            .unwrap();
        let mut err_fields = Vec::new();
        err_fields.push(b'S');
        err_fields.extend_from_slice(b"ERROR\0");
        err_fields.push(b'C');
        err_fields.extend_from_slice(b"42601\0");
        err_fields.push(b'M');
        err_fields.extend_from_slice(b"syntax error\0");
        err_fields.push(0);
        tx.unbounded_send(msg(BackendMessageFormat::ErrorResponse, &err_fields))
            .unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::ReadyForQuery, b"I"))
            .unwrap();
        drop(tx);

        let mut reader = ResponseReader::new(rx);
        let result = run_simple_query(&mut reader).await;
        assert!(matches!(result, Err(PgError::Database(_))));
    }

    #[tokio::test]
    async fn extended_query_skips_acknowledgement_only_messages() {
        let (tx, rx) = mpsc::unbounded();
        tx.unbounded_send(msg(BackendMessageFormat::BindComplete, b""))
            .unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::RowDescription, &row_description_bytes()))
            .unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::DataRow, &data_row_bytes(b"42")))
            .unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::CommandComplete, b"SELECT 1\0"))
            .unwrap();
        tx.unbounded_send(msg(BackendMessageFormat::ReadyForQuery, b"I"))
            .unwrap();
        drop(tx);

        let mut reader = ResponseReader::new(rx);
        let statement = run_extended_query(&mut reader).await.unwrap();
        assert_eq!(statement.rows.len(), 1);
        assert_eq!(statement.result.rows_affected, 1);
    }
}
