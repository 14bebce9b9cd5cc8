//! Frontend (client-to-server) message encoding.
//!
//! Grounded on `sqlx-postgres::connection::establish.rs`'s startup message
//! construction and the encode side of `sqlx-postgres::message::*`.

use super::frame::write_frame;

pub const PROTOCOL_VERSION_3_0: u32 = 196_608;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// The very first message of a plaintext connection, or the message sent
/// after an `SSLRequest` handshake completes. Carries no type byte.
pub struct Startup<'a> {
    pub username: &'a str,
    pub database: &'a str,
    pub params: &'a [(&'static str, &'a str)],
}

impl Startup<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, None, |buf| {
            buf.extend_from_slice(&PROTOCOL_VERSION_3_0.to_be_bytes());
            write_cstr_pair(buf, "user", self.username);
            write_cstr_pair(buf, "database", self.database);
            for (k, v) in self.params {
                write_cstr_pair(buf, k, v);
            }
            buf.push(0);
        });
    }
}

fn write_cstr_pair(buf: &mut Vec<u8>, key: &str, value: &str) {
    buf.extend_from_slice(key.as_bytes());
    buf.push(0);
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

fn write_cstr(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

/// Probe sent before the startup message when `sslmode` calls for it.
pub struct SslRequest;

impl SslRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, None, |buf| {
            buf.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        });
    }
}

/// Sent on a brand-new connection (separate from the one being canceled) to
/// ask the server to abort the in-progress query on that connection.
pub struct CancelRequest {
    pub process_id: u32,
    pub secret_key: u32,
}

impl CancelRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, None, |buf| {
            buf.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
            buf.extend_from_slice(&self.process_id.to_be_bytes());
            buf.extend_from_slice(&self.secret_key.to_be_bytes());
        });
    }
}

pub enum PasswordMessage<'a> {
    Cleartext(&'a str),
    /// Pre-hashed `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
    Hashed(String),
    /// Raw bytes for a SASL exchange step (`SASLInitialResponse`/`SASLResponse`).
    Sasl(&'a [u8]),
}

impl PasswordMessage<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'p'), |buf| match self {
            PasswordMessage::Cleartext(pw) => write_cstr(buf, pw),
            PasswordMessage::Hashed(hash) => write_cstr(buf, hash),
            PasswordMessage::Sasl(bytes) => buf.extend_from_slice(bytes),
        });
    }
}

pub struct SaslInitialResponse<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl SaslInitialResponse<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'p'), |buf| {
            write_cstr(buf, self.mechanism);
            buf.extend_from_slice(&(self.data.len() as i32).to_be_bytes());
            buf.extend_from_slice(self.data);
        });
    }
}

/// Simple query protocol: a single `Q` message runs a (possibly
/// multi-statement) SQL string and is followed only by the server's
/// response sequence, with no explicit `Sync`.
pub struct Query<'a>(pub &'a str);

impl Query<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'Q'), |buf| write_cstr(buf, self.0));
    }
}

/// Extended query protocol: parse `sql` into an (optionally named)
/// statement, declaring parameter types up front when known.
pub struct Parse<'a> {
    pub statement: &'a str,
    pub sql: &'a str,
    pub param_types: &'a [u32],
}

impl Parse<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'P'), |buf| {
            write_cstr(buf, self.statement);
            write_cstr(buf, self.sql);
            buf.extend_from_slice(&(self.param_types.len() as i16).to_be_bytes());
            for oid in self.param_types {
                buf.extend_from_slice(&oid.to_be_bytes());
            }
        });
    }
}

/// Bind a (named) statement plus parameter values to a (named) portal.
/// `param_formats`/`result_formats` of length `0` mean "all text", length
/// `1` means "this format for all", otherwise one entry per parameter/column.
pub struct Bind<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub param_formats: &'a [i16],
    pub params: &'a [Option<&'a [u8]>],
    pub result_formats: &'a [i16],
}

impl Bind<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), crate::error::PgError> {
        if self.params.len() > u16::MAX as usize {
            return Err(crate::error::err_protocol!(
                "bind: too many parameters: {} (max {})",
                self.params.len(),
                u16::MAX
            ));
        }
        write_frame(buf, Some(b'B'), |buf| {
            write_cstr(buf, self.portal);
            write_cstr(buf, self.statement);

            buf.extend_from_slice(&(self.param_formats.len() as i16).to_be_bytes());
            for f in self.param_formats {
                buf.extend_from_slice(&f.to_be_bytes());
            }

            buf.extend_from_slice(&(self.params.len() as i16).to_be_bytes());
            for param in self.params {
                match param {
                    None => buf.extend_from_slice(&(-1i32).to_be_bytes()),
                    Some(bytes) => {
                        buf.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                        buf.extend_from_slice(bytes);
                    }
                }
            }

            buf.extend_from_slice(&(self.result_formats.len() as i16).to_be_bytes());
            for f in self.result_formats {
                buf.extend_from_slice(&f.to_be_bytes());
            }
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

pub struct Describe<'a> {
    pub target: DescribeTarget,
    pub name: &'a str,
}

impl Describe<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'D'), |buf| {
            buf.push(match self.target {
                DescribeTarget::Statement => b'S',
                DescribeTarget::Portal => b'P',
            });
            write_cstr(buf, self.name);
        });
    }
}

pub struct Close<'a> {
    pub target: DescribeTarget,
    pub name: &'a str,
}

impl Close<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'C'), |buf| {
            buf.push(match self.target {
                DescribeTarget::Statement => b'S',
                DescribeTarget::Portal => b'P',
            });
            write_cstr(buf, self.name);
        });
    }
}

pub struct Execute<'a> {
    pub portal: &'a str,
    /// `0` means "no limit on rows returned".
    pub max_rows: i32,
}

impl Execute<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'E'), |buf| {
            write_cstr(buf, self.portal);
            buf.extend_from_slice(&self.max_rows.to_be_bytes());
        });
    }
}

pub struct Sync;

impl Sync {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'S'), |_| {});
    }
}

pub struct Flush;

impl Flush {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'H'), |_| {});
    }
}

pub struct Terminate;

impl Terminate {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'X'), |_| {});
    }
}

pub struct CopyData<'a>(pub &'a [u8]);

impl CopyData<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'd'), |buf| buf.extend_from_slice(self.0));
    }
}

pub struct CopyDone;

impl CopyDone {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'c'), |_| {});
    }
}

pub struct CopyFail<'a>(pub &'a str);

impl CopyFail<'_> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_frame(buf, Some(b'f'), |buf| write_cstr(buf, self.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_has_no_leading_type_byte_and_protocol_version() {
        let mut buf = Vec::new();
        Startup {
            username: "postgres",
            database: "postgres",
            params: &[],
        }
        .encode(&mut buf);

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, PROTOCOL_VERSION_3_0);
    }

    #[test]
    fn ssl_request_has_magic_number() {
        let mut buf = Vec::new();
        SslRequest.encode(&mut buf);
        assert_eq!(buf.len(), 8);
        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(code, SSL_REQUEST_CODE);
    }

    #[test]
    fn bind_rejects_too_many_params() {
        let params: Vec<Option<&[u8]>> = vec![Some(&[]); u16::MAX as usize + 1];
        let mut buf = Vec::new();
        let result = Bind {
            portal: "",
            statement: "",
            param_formats: &[],
            params: &params,
            result_formats: &[],
        }
        .encode(&mut buf);
        assert!(result.is_err());
    }

    #[test]
    fn bind_accepts_max_params() {
        let params: Vec<Option<&[u8]>> = vec![Some(&[]); 65535];
        let mut buf = Vec::new();
        let result = Bind {
            portal: "",
            statement: "",
            param_formats: &[],
            params: &params,
            result_formats: &[],
        }
        .encode(&mut buf);
        assert!(result.is_ok());
    }
}
