//! Backend (server-to-client) message bodies and their tag-byte dispatch.
//!
//! Grounded on `sqlx-postgres::connection::stream.rs`'s inline dispatch and
//! `sqlx-postgres::connection::row_stream.rs`'s `BackendMessageFormat` match.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes};

use crate::error::{err_protocol, PgError};
use crate::types::FieldDescription;

use super::frame::Frame;

/// The one-byte backend message tag, given a name. `Unknown` preserves
/// forward compatibility with message types this crate has not been taught
/// about (a connection should not die just because the server speaks a
/// protocol minor-version extension it doesn't recognize outside of
/// mandatory messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMessageFormat {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    FunctionCallResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
    Unknown(u8),
}

impl BackendMessageFormat {
    pub fn from_tag(tag: u8) -> BackendMessageFormat {
        use BackendMessageFormat::*;
        match tag {
            b'R' => Authentication,
            b'K' => BackendKeyData,
            b'2' => BindComplete,
            b'3' => CloseComplete,
            b'C' => CommandComplete,
            b'd' => CopyData,
            b'c' => CopyDone,
            b'G' => CopyInResponse,
            b'H' => CopyOutResponse,
            b'W' => CopyBothResponse,
            b'D' => DataRow,
            b'I' => EmptyQueryResponse,
            b'E' => ErrorResponse,
            b'V' => FunctionCallResponse,
            b'v' => NegotiateProtocolVersion,
            b'n' => NoData,
            b'N' => NoticeResponse,
            b'A' => NotificationResponse,
            b't' => ParameterDescription,
            b'S' => ParameterStatus,
            b'1' => ParseComplete,
            b's' => PortalSuspended,
            b'Z' => ReadyForQuery,
            b'T' => RowDescription,
            other => Unknown(other),
        }
    }
}

/// A decoded frame, tagged with its message kind, ready for a specific
/// body type to be decoded out of it via [`ReceivedMessage::decode`].
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub format: BackendMessageFormat,
    pub contents: Bytes,
}

impl ReceivedMessage {
    pub fn from_frame(frame: Frame) -> ReceivedMessage {
        ReceivedMessage {
            format: BackendMessageFormat::from_tag(frame.format),
            contents: frame.contents,
        }
    }

    pub fn decode<T: Decode>(&self) -> Result<T, PgError> {
        T::decode(self.contents.clone())
    }
}

pub trait Decode: Sized {
    fn decode(buf: Bytes) -> Result<Self, PgError>;
}

fn get_cstr(buf: &mut Bytes) -> Result<String, PgError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| err_protocol!("expected NUL-terminated string"))?;
    let s = buf.split_to(nul);
    buf.advance(1);
    String::from_utf8(s.to_vec()).map_err(|e| err_protocol!("invalid utf8 in string field: {e}"))
}

#[derive(Debug, Clone)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    Gss,
    GssContinue { data: Bytes },
    Sspi,
    OAuthBearer,
}

impl Decode for Authentication {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        let code = buf.get_u32();
        Ok(match code {
            0 => Authentication::Ok,
            3 => Authentication::CleartextPassword,
            5 => {
                if buf.len() < 4 {
                    return Err(err_protocol!("AuthenticationMD5Password: missing salt"));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&buf[..4]);
                Authentication::Md5Password { salt }
            }
            7 => Authentication::Gss,
            8 => Authentication::GssContinue { data: buf },
            9 => Authentication::Sspi,
            10 => {
                let mut mechanisms = Vec::new();
                while buf.len() > 1 {
                    mechanisms.push(get_cstr(&mut buf)?);
                }
                Authentication::Sasl { mechanisms }
            }
            11 => Authentication::SaslContinue { data: buf },
            12 => Authentication::SaslFinal { data: buf },
            // PostgreSQL 18+ RFC 7628 OAUTHBEARER, used via SASL mechanism
            // negotiation in practice, but some poolers announce it directly.
            13 => Authentication::OAuthBearer,
            other => return Err(err_protocol!("unknown authentication code: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    pub process_id: u32,
    pub secret_key: u32,
}

impl Decode for BackendKeyData {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        Ok(BackendKeyData {
            process_id: buf.get_u32(),
            secret_key: buf.get_u32(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub transaction_status: TransactionStatus,
}

impl Decode for ReadyForQuery {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        let status = buf.get_u8();
        let transaction_status = match status {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Error,
            other => return Err(err_protocol!("unknown transaction status: {:?}", other as char)),
        };
        Ok(ReadyForQuery { transaction_status })
    }
}

#[derive(Debug, Clone)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl Decode for ParameterStatus {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        let name = get_cstr(&mut buf)?;
        let value = get_cstr(&mut buf)?;
        Ok(ParameterStatus { name, value })
    }
}

/// Shared field parsing for `ErrorResponse`/`NoticeResponse`, which use the
/// same severity-tagged-field-list wire format.
#[derive(Debug, Clone, Default)]
pub struct NoticeFields {
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

impl NoticeFields {
    fn parse(mut buf: Bytes) -> Result<Self, PgError> {
        let mut fields = NoticeFields::default();
        loop {
            if buf.is_empty() {
                return Err(err_protocol!("ErrorResponse/NoticeResponse missing terminator"));
            }
            let tag = buf.get_u8();
            if tag == 0 {
                break;
            }
            let value = get_cstr(&mut buf)?;
            match tag {
                b'S' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = value.parse().ok(),
                b'W' => fields.where_ = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.data_type = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = value.parse().ok(),
                b'R' => fields.routine = Some(value),
                _ => {} // unrecognized field codes are ignored, not an error
            }
        }
        Ok(fields)
    }

    pub fn into_database_error(self) -> crate::error::PgDatabaseError {
        crate::error::PgDatabaseError {
            severity: self.severity,
            code: self.code,
            message: self.message,
            detail: self.detail,
            hint: self.hint,
            position: self.position,
            where_: self.where_,
            schema: self.schema,
            table: self.table,
            column: self.column,
            data_type: self.data_type,
            constraint: self.constraint,
            file: self.file,
            line: self.line,
            routine: self.routine,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorResponse(pub NoticeFields);

impl Decode for ErrorResponse {
    fn decode(buf: Bytes) -> Result<Self, PgError> {
        Ok(ErrorResponse(NoticeFields::parse(buf)?))
    }
}

#[derive(Debug, Clone)]
pub struct NoticeResponse(pub NoticeFields);

impl Decode for NoticeResponse {
    fn decode(buf: Bytes) -> Result<Self, PgError> {
        Ok(NoticeResponse(NoticeFields::parse(buf)?))
    }
}

#[derive(Debug, Clone)]
pub struct NotificationResponse {
    pub process_id: u32,
    pub channel: String,
    pub payload: String,
}

impl Decode for NotificationResponse {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        let process_id = buf.get_u32();
        let channel = get_cstr(&mut buf)?;
        let payload = get_cstr(&mut buf)?;
        Ok(NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl Decode for RowDescription {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        let count = buf.get_u16();
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = get_cstr(&mut buf)?;
            let table_oid = buf.get_u32();
            let column_id = buf.get_i16();
            let type_oid = buf.get_u32();
            let type_size = buf.get_i16();
            let type_modifier = buf.get_i32();
            let format = buf.get_i16();
            fields.push(FieldDescription {
                name,
                table_oid: (table_oid != 0).then_some(table_oid),
                column_id: (column_id != 0).then_some(column_id),
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }
        Ok(RowDescription { fields })
    }
}

#[derive(Debug, Clone)]
pub struct ParameterDescription {
    pub types: Vec<u32>,
}

impl Decode for ParameterDescription {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        let count = buf.get_u16();
        let mut types = Vec::with_capacity(count as usize);
        for _ in 0..count {
            types.push(buf.get_u32());
        }
        Ok(ParameterDescription { types })
    }
}

#[derive(Debug, Clone)]
pub struct DataRow {
    pub values: Vec<Option<Vec<u8>>>,
}

impl Decode for DataRow {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        let count = buf.get_u16();
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = buf.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                let len = len as usize;
                if buf.len() < len {
                    return Err(err_protocol!("DataRow column shorter than declared length"));
                }
                values.push(Some(buf.split_to(len).to_vec()));
            }
        }
        Ok(DataRow { values })
    }
}

#[derive(Debug, Clone)]
pub struct CommandComplete {
    pub tag: String,
}

impl CommandComplete {
    pub fn rows_affected(&self) -> u64 {
        crate::types::CommandTag::parse(&self.tag).rows().unwrap_or(0)
    }
}

impl Decode for CommandComplete {
    fn decode(mut buf: Bytes) -> Result<Self, PgError> {
        let tag = get_cstr(&mut buf)?;
        Ok(CommandComplete { tag })
    }
}

#[derive(Debug, Clone)]
pub struct CopyResponseData {
    pub format: i8,
    pub num_columns: i16,
    pub format_codes: Vec<i16>,
}

fn decode_copy_response(mut buf: Bytes) -> Result<CopyResponseData, PgError> {
    let format = buf.get_i8();
    let num_columns = buf.get_i16();
    let mut format_codes = Vec::with_capacity(num_columns.max(0) as usize);
    for _ in 0..num_columns.max(0) {
        format_codes.push(buf.get_i16());
    }
    Ok(CopyResponseData {
        format,
        num_columns,
        format_codes,
    })
}

#[derive(Debug, Clone)]
pub struct CopyInResponse(pub CopyResponseData);

impl Decode for CopyInResponse {
    fn decode(buf: Bytes) -> Result<Self, PgError> {
        Ok(CopyInResponse(decode_copy_response(buf)?))
    }
}

#[derive(Debug, Clone)]
pub struct CopyOutResponse(pub CopyResponseData);

impl Decode for CopyOutResponse {
    fn decode(buf: Bytes) -> Result<Self, PgError> {
        Ok(CopyOutResponse(decode_copy_response(buf)?))
    }
}

#[derive(Debug, Clone)]
pub struct CopyData(pub Bytes);

impl Decode for CopyData {
    fn decode(buf: Bytes) -> Result<Self, PgError> {
        Ok(CopyData(buf))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CopyDone;

impl Decode for CopyDone {
    fn decode(_buf: Bytes) -> Result<Self, PgError> {
        Ok(CopyDone)
    }
}

/// Backend parameters collected over the lifetime of a connection, keyed by
/// name (`server_version`, `TimeZone`, `application_name`, ...).
pub type ParameterStatuses = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    fn cstr_buf(fields: &[(u8, &str)]) -> Bytes {
        let mut v = Vec::new();
        for (tag, value) in fields {
            v.push(*tag);
            v.extend_from_slice(value.as_bytes());
            v.push(0);
        }
        v.push(0);
        Bytes::from(v)
    }

    #[test]
    fn decodes_error_response_fields() {
        let buf = cstr_buf(&[(b'S', "ERROR"), (b'C', "42601"), (b'M', "syntax error")]);
        let ErrorResponse(fields) = ErrorResponse::decode(buf).unwrap();
        assert_eq!(fields.severity, "ERROR");
        assert_eq!(fields.code, "42601");
        assert_eq!(fields.message, "syntax error");
    }

    #[test]
    fn decodes_ready_for_query() {
        let buf = Bytes::from_static(b"I");
        let rfq = ReadyForQuery::decode(buf).unwrap();
        assert_eq!(rfq.transaction_status, TransactionStatus::Idle);
    }

    #[test]
    fn decodes_null_data_row_column() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        let row = DataRow::decode(Bytes::from(buf)).unwrap();
        assert_eq!(row.values, vec![None]);
    }

    #[test]
    fn decodes_present_data_row_column() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&3i32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let row = DataRow::decode(Bytes::from(buf)).unwrap();
        assert_eq!(row.values, vec![Some(b"abc".to_vec())]);
    }

    #[test]
    fn command_complete_rows_affected() {
        let mut buf = b"UPDATE 4".to_vec();
        buf.push(0);
        let cc = CommandComplete::decode(Bytes::from(buf)).unwrap();
        assert_eq!(cc.rows_affected(), 4);
    }

    #[test]
    fn md5_password_carries_salt() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let auth = Authentication::decode(Bytes::from(buf)).unwrap();
        match auth {
            Authentication::Md5Password { salt } => assert_eq!(salt, [1, 2, 3, 4]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
