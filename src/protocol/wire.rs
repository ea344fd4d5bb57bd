//! Backend messages of the PostgreSQL Frontend/Backend Protocol.
//!
//! Framing after startup: 1-byte type tag, 4-byte big-endian length that
//! includes itself, then the payload.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use crate::errors::{Error, PgServerError, Result};

/// Backend (server → client) message types.
///
/// This is a closed union: one variant per protocol message the driver
/// understands. An unknown tag is a protocol error and unrecoverable,
/// because message-boundary sync cannot be re-established.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password([u8; 4]),
    AuthenticationSASL(Vec<String>),
    AuthenticationSASLContinue(Vec<u8>),
    AuthenticationSASLFinal(Vec<u8>),
    /// Backend key data (for cancel requests)
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(CommandTag),
    EmptyQueryResponse,
    ParameterDescription(Vec<u32>),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    /// Recognized but not acted upon; this driver never limits Execute rows.
    PortalSuspended,
    NoticeResponse(PgServerError),
    NotificationResponse(Notification),
    ErrorResponse(PgServerError),
    CopyInResponse {
        format: u8,
        column_formats: Vec<i16>,
    },
    CopyOutResponse {
        format: u8,
        column_formats: Vec<i16>,
    },
    CopyData(Vec<u8>),
    CopyDone,
}

/// Transaction status byte carried by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I' - not in a transaction block
    Idle,
    /// 'T' - in a transaction block
    InTransaction,
    /// 'E' - in a failed transaction block
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// One column of a `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr_number: i16,
    pub data_type_oid: u32,
    pub data_type_size: i16,
    pub type_modifier: i32,
    /// 0 = text, 1 = binary
    pub format_code: i16,
}

/// The textual tag carried by `CommandComplete`, e.g. `INSERT 0 42`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag(pub String);

impl CommandTag {
    /// Number of rows the command affected, parsed from the trailing decimal
    /// of the tag. Tags without a trailing number report 0.
    pub fn rows_affected(&self) -> u64 {
        self.0
            .rsplit(' ')
            .next()
            .and_then(|word| word.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An asynchronous LISTEN/NOTIFY event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Backend pid of the notifying session
    pub pid: i32,
    pub channel: String,
    pub payload: String,
}

/// Checked reader over one message payload.
struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { rest: payload }
    }

    fn remaining(&self) -> usize {
        self.rest.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.rest.len() < n {
            return Err(Error::protocol("message payload truncated"));
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Null-terminated string.
    fn cstr(&mut self) -> Result<String> {
        let nul = self
            .rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::protocol("missing null terminator"))?;
        let s = String::from_utf8_lossy(&self.rest[..nul]).into_owned();
        self.rest = &self.rest[nul + 1..];
        Ok(s)
    }
}

impl BackendMessage {
    /// Decode one message given its tag byte and payload (the bytes after
    /// the length field). The framing layer has already validated lengths.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(payload);
        let message = match tag {
            b'R' => Self::decode_auth(&mut cur)?,
            b'K' => BackendMessage::BackendKeyData {
                process_id: cur.i32()?,
                secret_key: cur.i32()?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: cur.cstr()?,
                value: cur.cstr()?,
            },
            b'Z' => Self::decode_ready_for_query(&mut cur)?,
            b'T' => Self::decode_row_description(&mut cur)?,
            b'D' => Self::decode_data_row(&mut cur)?,
            b'C' => BackendMessage::CommandComplete(CommandTag(cur.cstr()?)),
            b'I' => BackendMessage::EmptyQueryResponse,
            b't' => Self::decode_parameter_description(&mut cur)?,
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b'N' => BackendMessage::NoticeResponse(Self::decode_error_fields(&mut cur)?),
            b'A' => BackendMessage::NotificationResponse(Notification {
                pid: cur.i32()?,
                channel: cur.cstr()?,
                payload: cur.cstr()?,
            }),
            b'E' => BackendMessage::ErrorResponse(Self::decode_error_fields(&mut cur)?),
            b'G' => Self::decode_copy_response(&mut cur, true)?,
            b'H' => Self::decode_copy_response(&mut cur, false)?,
            b'd' => BackendMessage::CopyData(payload.to_vec()),
            b'c' => BackendMessage::CopyDone,
            _ => {
                return Err(Error::protocol(format!(
                    "unknown backend message type '{}' (0x{:02x})",
                    tag as char, tag
                )));
            }
        };
        Ok(message)
    }

    fn decode_auth(cur: &mut Cursor<'_>) -> Result<Self> {
        let code = cur.i32()?;
        match code {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let raw = cur.take(4)?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(raw);
                Ok(BackendMessage::AuthenticationMD5Password(salt))
            }
            10 => {
                // Null-terminated mechanism list, closed by an empty string.
                let mut mechanisms = Vec::new();
                loop {
                    let mech = cur.cstr()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL(mechanisms))
            }
            11 => {
                let rest = cur.remaining();
                Ok(BackendMessage::AuthenticationSASLContinue(
                    cur.take(rest)?.to_vec(),
                ))
            }
            12 => {
                let rest = cur.remaining();
                Ok(BackendMessage::AuthenticationSASLFinal(
                    cur.take(rest)?.to_vec(),
                ))
            }
            _ => Err(Error::protocol(format!(
                "unknown authentication request code {code}"
            ))),
        }
    }

    fn decode_ready_for_query(cur: &mut Cursor<'_>) -> Result<Self> {
        let status = match cur.u8()? {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            other => {
                return Err(Error::protocol(format!(
                    "unknown transaction status byte 0x{other:02x}"
                )));
            }
        };
        Ok(BackendMessage::ReadyForQuery(status))
    }

    fn decode_row_description(cur: &mut Cursor<'_>) -> Result<Self> {
        let count = cur.i16()?;
        if count < 0 {
            return Err(Error::protocol("negative field count in RowDescription"));
        }
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            fields.push(FieldDescription {
                name: cur.cstr()?,
                table_oid: cur.u32()?,
                column_attr_number: cur.i16()?,
                data_type_oid: cur.u32()?,
                data_type_size: cur.i16()?,
                type_modifier: cur.i32()?,
                format_code: cur.i16()?,
            });
        }
        Ok(BackendMessage::RowDescription(fields))
    }

    fn decode_data_row(cur: &mut Cursor<'_>) -> Result<Self> {
        let count = cur.i16()?;
        if count < 0 {
            return Err(Error::protocol("negative column count in DataRow"));
        }
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = cur.i32()?;
            if len == -1 {
                values.push(None);
            } else if len < 0 {
                return Err(Error::protocol("negative value length in DataRow"));
            } else {
                values.push(Some(cur.take(len as usize)?.to_vec()));
            }
        }
        Ok(BackendMessage::DataRow(values))
    }

    fn decode_parameter_description(cur: &mut Cursor<'_>) -> Result<Self> {
        let count = cur.i16()?;
        if count < 0 {
            return Err(Error::protocol(
                "negative parameter count in ParameterDescription",
            ));
        }
        let mut oids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            oids.push(cur.u32()?);
        }
        Ok(BackendMessage::ParameterDescription(oids))
    }

    fn decode_copy_response(cur: &mut Cursor<'_>, copy_in: bool) -> Result<Self> {
        let format = cur.u8()?;
        let count = cur.i16()?;
        if count < 0 {
            return Err(Error::protocol("negative column count in copy response"));
        }
        let mut column_formats = Vec::with_capacity(count as usize);
        for _ in 0..count {
            column_formats.push(cur.i16()?);
        }
        Ok(if copy_in {
            BackendMessage::CopyInResponse {
                format,
                column_formats,
            }
        } else {
            BackendMessage::CopyOutResponse {
                format,
                column_formats,
            }
        })
    }

    /// Tagged field list shared by ErrorResponse and NoticeResponse.
    fn decode_error_fields(cur: &mut Cursor<'_>) -> Result<PgServerError> {
        let mut fields = PgServerError::default();
        loop {
            let kind = cur.u8()?;
            if kind == 0 {
                break;
            }
            let value = cur.cstr()?;
            match kind {
                // 'S' is localized; 'V' always carries the bare severity.
                b'S' => fields.severity = value,
                b'V' => fields.severity = value,
                b'C' => fields.sql_state = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = value.parse().ok(),
                b'p' => fields.internal_position = value.parse().ok(),
                b'q' => fields.internal_query = Some(value),
                b'W' => fields.where_ = Some(value),
                b's' => fields.schema = Some(value),
                b't' => fields.table = Some(value),
                b'c' => fields.column = Some(value),
                b'd' => fields.data_type = Some(value),
                b'n' => fields.constraint = Some(value),
                b'F' => fields.file = Some(value),
                b'L' => fields.line = value.parse().ok(),
                b'R' => fields.routine = Some(value),
                _ => {}
            }
        }
        Ok(fields)
    }
}
