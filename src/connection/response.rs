//! The consuming side of a worker response channel: turns a stream of raw
//! [`ReceivedMessage`]s into typed values, converting `ErrorResponse` into
//! `Err` the moment it's seen.
//!
//! Grounded on `sqlx-postgres::connection::worker::manager.rs`'s
//! `ConnManager`.

use futures_channel::mpsc::UnboundedReceiver;
use futures_util::StreamExt;

use crate::error::{err_protocol, PgError};
use crate::message::{BackendMessageFormat, Decode, ErrorResponse, ReadyForQuery, ReceivedMessage};

pub struct ResponseReader {
    rx: UnboundedReceiver<ReceivedMessage>,
}

impl ResponseReader {
    pub fn new(rx: UnboundedReceiver<ReceivedMessage>) -> Self {
        ResponseReader { rx }
    }

    pub fn into_inner(self) -> UnboundedReceiver<ReceivedMessage> {
        self.rx
    }

    /// Receive the next message, converting `ErrorResponse` into `Err`.
    ///
    /// Per spec.md §9 Open Question (b): the first `ErrorResponse` for a
    /// request ends that request immediately; it is the caller's
    /// responsibility to call [`Self::wait_ready_for_query`] afterwards so
    /// any further messages up to the next `ReadyForQuery` barrier are
    /// drained rather than leaking into the following request.
    pub async fn recv(&mut self) -> Result<ReceivedMessage, PgError> {
        match self.rx.next().await {
            Some(msg) if msg.format == BackendMessageFormat::ErrorResponse => {
                let ErrorResponse(fields) = msg.decode()?;
                Err(PgError::Database(fields.into_database_error()))
            }
            Some(msg) => Ok(msg),
            None => Err(PgError::WorkerCrashed(
                "connection worker closed before the response completed".into(),
            )),
        }
    }

    pub async fn recv_expect<T: Decode>(&mut self) -> Result<T, PgError> {
        let msg = self.recv().await?;
        msg.decode()
    }

    /// Drain messages until (and including) a `ReadyForQuery`, discarding
    /// whatever comes before it. Used after an error to resynchronize with
    /// the `Sync` the caller already queued.
    pub async fn wait_ready_for_query(&mut self) -> Result<ReadyForQuery, PgError> {
        loop {
            match self.rx.next().await {
                Some(msg) if msg.format == BackendMessageFormat::ReadyForQuery => {
                    return msg.decode();
                }
                Some(msg) if msg.format == BackendMessageFormat::ErrorResponse => {
                    let ErrorResponse(fields) = msg.decode()?;
                    tracing::debug!(
                        code = %fields.code,
                        "additional ErrorResponse observed while resynchronizing"
                    );
                }
                Some(_) => continue,
                None => {
                    return Err(PgError::WorkerCrashed(
                        "connection worker closed before ReadyForQuery".into(),
                    ))
                }
            }
        }
    }

    /// Drain `count` `CloseComplete`/`PortalSuspended` acknowledgements,
    /// used when evicting statements from the cache.
    pub async fn wait_for_close_complete(&mut self, mut count: usize) -> Result<(), PgError> {
        while count > 0 {
            let msg = self.recv().await?;
            match msg.format {
                BackendMessageFormat::CloseComplete | BackendMessageFormat::PortalSuspended => {
                    count -= 1;
                }
                other => {
                    return Err(err_protocol!("expected CloseComplete, got: {other:?}"));
                }
            }
        }
        Ok(())
    }
}
