//! `COPY TO`/`COPY FROM STDIN` streaming (C4 "Streaming COPY").
//!
//! Grounded on `sqlx-postgres::copy.rs`'s `PgCopyIn`/`PgCopyStream`, with the
//! same deadlock class fixed here as in `establish.rs`: each `CopyData`
//! chunk is a write with no response of its own, so it goes out through
//! [`super::worker::WorkerHandle::write_only`] rather than being queued as a
//! zero-response [`super::worker::PipeUntil::NumResponses`] entry (the
//! retrieved `copy.rs` still has this bug; see `DESIGN.md`).

use bytes::Bytes;

use crate::error::{err_protocol, PgError};
use crate::message::frontend::{CopyData as CopyDataMsg, CopyDone as CopyDoneMsg};
use crate::message::{
    BackendMessageFormat, CommandComplete, CopyFail, CopyInResponse, CopyOutResponse, Query,
};

use super::response::ResponseReader;
use super::worker::PipeUntil;
use super::PgConnection;

/// The largest chunk of `COPY` data sent in one `CopyData` message. One byte
/// short of the 0x3fffffff frame-length ceiling, leaving room for the 4-byte
/// length prefix itself plus the 1-byte message tag.
pub const PG_COPY_MAX_DATA_LEN: usize = 0x3fffffff - 1 - 4;

/// An in-progress `COPY FROM STDIN` upload. Must be ended with
/// [`CopyIn::finish`] or [`CopyIn::abort`] -- dropping it without either
/// sends a `CopyFail` so the server doesn't hang waiting for more data.
pub struct CopyIn<'c> {
    conn: &'c mut PgConnection,
    reader: Option<ResponseReader>,
}

impl<'c> CopyIn<'c> {
    /// Sends `copy_statement` (expected to be a `COPY ... FROM STDIN ...`)
    /// and waits for the server's `CopyInResponse`.
    pub async fn begin(conn: &'c mut PgConnection, copy_statement: &str) -> Result<CopyIn<'c>, PgError> {
        let mut buf = Vec::new();
        Query(copy_statement).encode(&mut buf);
        let rx = conn.handle.pipe(buf, PipeUntil::ReadyForQuery)?;
        let mut reader = ResponseReader::new(rx);

        let msg = reader.recv().await?;
        if msg.format != BackendMessageFormat::CopyInResponse {
            return Err(err_protocol!(
                "expected CopyInResponse, got: {:?}",
                msg.format
            ));
        }
        let _response: CopyInResponse = msg.decode()?;

        Ok(CopyIn {
            conn,
            reader: Some(reader),
        })
    }

    /// Sends `data`, chunked by [`PG_COPY_MAX_DATA_LEN`] if necessary.
    pub fn send(&mut self, data: &[u8]) -> Result<(), PgError> {
        for chunk in data.chunks(PG_COPY_MAX_DATA_LEN) {
            let mut buf = Vec::new();
            CopyDataMsg(chunk).encode(&mut buf);
            self.conn.handle.write_only(buf)?;
        }
        Ok(())
    }

    /// Sends `CopyDone` and awaits `CommandComplete` + `ReadyForQuery`,
    /// returning the number of rows the server reports having copied.
    pub async fn finish(mut self) -> Result<u64, PgError> {
        let mut reader = self.reader.take().expect("CopyIn used after finish/abort");

        let mut buf = Vec::new();
        CopyDoneMsg.encode(&mut buf);
        self.conn.handle.write_only(buf)?;

        let msg = reader.recv().await?;
        let rows_affected = match msg.format {
            BackendMessageFormat::CommandComplete => {
                let cc: CommandComplete = msg.decode()?;
                cc.rows_affected()
            }
            other => return Err(err_protocol!("expected CommandComplete, got: {other:?}")),
        };
        reader.wait_ready_for_query().await?;
        Ok(rows_affected)
    }

    /// Sends `CopyFail(message)`, which the server turns into an
    /// `ErrorResponse` (SQLSTATE `57014`) followed by `ReadyForQuery`.
    pub async fn abort(mut self, message: &str) -> Result<(), PgError> {
        let mut reader = self.reader.take().expect("CopyIn used after finish/abort");

        let mut buf = Vec::new();
        CopyFail(message).encode(&mut buf);
        self.conn.handle.write_only(buf)?;

        match reader.recv().await {
            Err(PgError::Database(_)) => {}
            Ok(msg) => {
                return Err(err_protocol!(
                    "expected an ErrorResponse acknowledging CopyFail, got: {:?}",
                    msg.format
                ))
            }
            Err(other) => return Err(other),
        }
        reader.wait_ready_for_query().await?;
        Ok(())
    }
}

impl Drop for CopyIn<'_> {
    fn drop(&mut self) {
        // Dropping `self.reader` here closes its receiver; nothing can
        // await the server's ErrorResponse/ReadyForQuery from a synchronous
        // `Drop`, so this is best-effort -- it unblocks the server (which
        // would otherwise wait forever for more COPY data) and leaves
        // resynchronization to the connection's next request.
        if self.reader.take().is_some() {
            let mut buf = Vec::new();
            CopyFail("CopyIn dropped without calling finish() or abort()").encode(&mut buf);
            let _ = self.conn.handle.write_only(buf);
        }
    }
}

/// An in-progress `COPY TO STDOUT` download.
pub struct CopyOut<'c> {
    // Holding the exclusive borrow for the lifetime of the stream is the
    // point of this field: it stops the caller from issuing another request
    // on the same connection while a COPY OUT is in progress.
    _conn: &'c mut PgConnection,
    reader: ResponseReader,
    done: bool,
}

impl<'c> CopyOut<'c> {
    pub async fn begin(conn: &'c mut PgConnection, copy_statement: &str) -> Result<CopyOut<'c>, PgError> {
        let mut buf = Vec::new();
        Query(copy_statement).encode(&mut buf);
        let rx = conn.handle.pipe(buf, PipeUntil::ReadyForQuery)?;
        let mut reader = ResponseReader::new(rx);

        let msg = reader.recv().await?;
        if msg.format != BackendMessageFormat::CopyOutResponse {
            return Err(err_protocol!(
                "expected CopyOutResponse, got: {:?}",
                msg.format
            ));
        }
        let _response: CopyOutResponse = msg.decode()?;

        Ok(CopyOut {
            _conn: conn,
            reader,
            done: false,
        })
    }

    /// The next chunk of copied data, or `None` once the server has sent
    /// `CopyDone` and the trailing `CommandComplete`/`ReadyForQuery` has
    /// been drained.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, PgError> {
        if self.done {
            return Ok(None);
        }

        let msg = self.reader.recv().await?;
        match msg.format {
            BackendMessageFormat::CopyData => {
                let data: crate::message::backend::CopyData = msg.decode()?;
                Ok(Some(data.0))
            }
            BackendMessageFormat::CopyDone => {
                let cc_msg = self.reader.recv().await?;
                if cc_msg.format != BackendMessageFormat::CommandComplete {
                    return Err(err_protocol!(
                        "expected CommandComplete after CopyDone, got: {:?}",
                        cc_msg.format
                    ));
                }
                self.reader.wait_ready_for_query().await?;
                self.done = true;
                Ok(None)
            }
            other => Err(err_protocol!("unexpected message during COPY OUT: {other:?}")),
        }
    }
}
