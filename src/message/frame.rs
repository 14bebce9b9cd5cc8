//! The frame codec (C1): splitting the byte stream of a Postgres connection
//! into discrete protocol messages and back.
//!
//! Grounded on `sqlx-postgres::connection::codec::PostgresCodec` /
//! `sqlx-core::io::Codec`.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{err_protocol, PgError};

/// A decoded but not-yet-interpreted backend message: a one-byte type tag
/// (absent only for the very first byte of a fresh connection, where the
/// server may send `AuthenticationRequest`-style bytes with no tag before
/// startup has been answered; see [`Frame::decode_untagged`]) plus the
/// message body with the 4-byte length prefix already stripped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub format: u8,
    pub contents: Bytes,
}

impl Frame {
    /// Decode one frame from `buf`, advancing it past the frame on success.
    /// Returns `Ok(None)` if `buf` does not yet hold a complete frame --
    /// this is a request for more bytes, never silent acceptance of a
    /// truncated message.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, PgError> {
        // format(1) + length(4), where length counts itself but not the
        // leading format byte.
        const HEADER_LEN: usize = 5;

        if buf.len() < HEADER_LEN {
            buf.reserve(HEADER_LEN - buf.len());
            return Ok(None);
        }

        let format = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);

        let len = usize::try_from(len)
            .map_err(|_| err_protocol!("message length did not fit in usize: {len}"))?;

        if len < 4 {
            return Err(err_protocol!(
                "message length {len} is smaller than the 4-byte length field itself"
            ));
        }

        let total_len = 1 + len;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let contents = buf.split_to(len - 4).freeze();

        Ok(Some(Frame { format, contents }))
    }

    /// Decode the very first message of a TLS-capable startup handshake,
    /// which has no leading type byte: a bare 4-byte length followed by a
    /// 4-byte response code (`'S'`/`'N'` for SSLRequest, or the startup
    /// response once auth begins, which does have a tag and goes through
    /// [`Frame::decode`] instead). Used only for the single-byte
    /// SSLRequest/GSSENCRequest reply.
    pub fn decode_single_byte_reply(buf: &mut BytesMut) -> Result<Option<u8>, PgError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let byte = buf[0];
        buf.advance(1);
        Ok(Some(byte))
    }
}

/// Write a frontend message's frame: 1-byte tag (omitted when `tag` is
/// `None`, as for the bootstrap `Startup`/`SSLRequest`/`CancelRequest`
/// messages which carry no type byte), followed by a big-endian `u32`
/// length (counting itself) and the body.
pub fn write_frame(buf: &mut Vec<u8>, tag: Option<u8>, body: impl FnOnce(&mut Vec<u8>)) {
    if let Some(tag) = tag {
        buf.push(tag);
    }

    let len_pos = buf.len();
    buf.extend_from_slice(&[0u8; 4]);

    body(buf);

    let len = (buf.len() - len_pos) as u32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_full_header() {
        let mut buf = BytesMut::from(&b"R\x00\x00"[..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn decode_waits_for_full_body() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"R");
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0]); // only 3 of 4 body bytes

        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_full_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"R");
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(b"trailing");

        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.format, b'R');
        assert_eq!(&frame.contents[..], &0u32.to_be_bytes());
        assert_eq!(&buf[..], b"trailing");
    }

    #[test]
    fn rejects_length_smaller_than_itself() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"R");
        buf.extend_from_slice(&2u32.to_be_bytes());

        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn write_frame_computes_length() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Some(b'Q'), |buf| buf.extend_from_slice(b"SELECT 1\0"));

        assert_eq!(buf[0], b'Q');
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn write_frame_without_tag() {
        let mut buf = Vec::new();
        write_frame(&mut buf, None, |buf| buf.extend_from_slice(&196608u32.to_be_bytes()));

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());
    }
}
