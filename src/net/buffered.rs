//! The buffered socket (C2): coalesces outbound frames into a single write
//! buffer and decodes inbound frames out of a single read buffer, without
//! ever blocking a thread waiting on bytes that have not arrived.
//!
//! Grounded on `sqlx-core::net::socket::framed.rs` (`Framed`,
//! `BACKPRESSURE_LIMIT`). That file expresses the same buffering discipline
//! as a manual `Sink`/`Stream` implementation so it can compose with
//! combinators elsewhere in `sqlx-core`; here the socket is driven
//! exclusively by `connection::worker`'s single event loop, so the same
//! discipline is expressed as plain `async fn`s instead.

use std::pin::Pin;
use std::task::Poll;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

use crate::error::PgError;
use crate::message::{Frame, ReceivedMessage};

use super::socket::Socket;

pub const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// Once the write buffer holds this many bytes a caller should flush before
/// queuing more, to bound memory use under a backed-up pipeline.
pub const BACKPRESSURE_LIMIT: usize = DEFAULT_BUF_SIZE;

pub struct BufferedSocket<S> {
    socket: S,
    write_buf: Vec<u8>,
    read_buf: BytesMut,
}

impl<S: Socket> BufferedSocket<S> {
    pub fn new(socket: S) -> Self {
        BufferedSocket {
            socket,
            write_buf: Vec::with_capacity(DEFAULT_BUF_SIZE),
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
        }
    }

    pub fn write_buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.write_buf
    }

    pub fn should_flush(&self) -> bool {
        self.write_buf.len() >= BACKPRESSURE_LIMIT
    }

    pub fn write_buffer_len(&self) -> usize {
        self.write_buf.len()
    }

    pub async fn flush(&mut self) -> Result<(), PgError> {
        if !self.write_buf.is_empty() {
            self.socket.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        self.socket.flush().await?;
        Ok(())
    }

    /// Decode one frame already sitting in the read buffer, without
    /// touching the socket. Used to drain backlog before issuing another
    /// syscall.
    pub fn decode_buffered(&mut self) -> Result<Option<ReceivedMessage>, PgError> {
        Ok(Frame::decode(&mut self.read_buf)?.map(ReceivedMessage::from_frame))
    }

    /// Read one frame, pulling more bytes from the socket as needed. A
    /// clean EOF with no partial frame buffered returns `Ok(None)`; EOF
    /// mid-frame is a protocol error, not a silently accepted truncation.
    pub async fn read_frame(&mut self) -> Result<Option<ReceivedMessage>, PgError> {
        loop {
            if let Some(msg) = self.decode_buffered()? {
                return Ok(Some(msg));
            }

            let had_bytes = !self.read_buf.is_empty();
            let n = self.socket.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if had_bytes || !self.read_buf.is_empty() {
                    return Err(crate::error::err_protocol!(
                        "server closed the connection unexpectedly"
                    ));
                }
                return Ok(None);
            }
        }
    }

    /// A single non-blocking poll for bytes the server has already sent
    /// unprompted -- `CheckConn`'s primitive. Never awaits: if nothing is
    /// available right now it returns `Ok(false)` instead of waiting for
    /// the next byte. Anything read is kept in the read buffer for the
    /// next `read_frame`.
    pub async fn peek_available(&mut self) -> Result<bool, PgError> {
        if !self.read_buf.is_empty() {
            return Ok(true);
        }

        let mut scratch = [0u8; 1024];
        let socket = &mut self.socket;
        let polled = std::future::poll_fn(|cx| {
            let mut read_buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut *socket).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => Poll::Ready(Some(Ok(read_buf.filled().len()))),
                Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
                Poll::Pending => Poll::Ready(None),
            }
        })
        .await;

        match polled {
            None => Ok(false),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(0)) => Ok(true), // EOF: the next read_frame surfaces this.
            Some(Ok(n)) => {
                self.read_buf.extend_from_slice(&scratch[..n]);
                Ok(true)
            }
        }
    }

    pub fn shrink_buffers(&mut self) {
        if self.write_buf.capacity() > DEFAULT_BUF_SIZE {
            self.write_buf.shrink_to(DEFAULT_BUF_SIZE);
        }
        if self.read_buf.capacity() > DEFAULT_BUF_SIZE {
            self.read_buf.reserve(DEFAULT_BUF_SIZE.saturating_sub(self.read_buf.len()));
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), PgError> {
        self.flush().await?;
        self.socket.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.socket
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.socket
    }
}
