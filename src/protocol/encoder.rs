//! Frontend message serialization.
//!
//! Pure, synchronous byte building: every function produces a complete wire
//! frame in a `BytesMut`. The async layer writes these buffers verbatim.

use bytes::{BufMut, BytesMut};

use crate::errors::{Error, Result};

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Magic request code carried instead of a protocol version.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic request code for an out-of-band cancel request.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Extended protocol carries the parameter count as an unsigned 16-bit
/// integer.
pub const MAX_PARAMETERS: usize = 65535;

/// Serializes frontend (client → server) messages.
pub struct FrontendEncoder;

impl FrontendEncoder {
    /// StartupMessage: no type byte; length, protocol version, then
    /// null-terminated key/value pairs closed by an empty key.
    pub fn startup(user: &str, database: Option<&str>, params: &[(String, String)]) -> BytesMut {
        let mut content = BytesMut::new();
        content.put_i32(PROTOCOL_VERSION);

        content.put_slice(b"user\0");
        content.put_slice(user.as_bytes());
        content.put_u8(0);

        if let Some(database) = database {
            content.put_slice(b"database\0");
            content.put_slice(database.as_bytes());
            content.put_u8(0);
        }

        for (name, value) in params {
            content.put_slice(name.as_bytes());
            content.put_u8(0);
            content.put_slice(value.as_bytes());
            content.put_u8(0);
        }

        content.put_u8(0);

        let mut buf = BytesMut::with_capacity(content.len() + 4);
        buf.put_i32(content.len() as i32 + 4);
        buf.put(content);
        buf
    }

    /// SSLRequest: length 8 + the SSL magic. The server answers with a
    /// single raw byte, 'S' or 'N'.
    pub fn ssl_request() -> BytesMut {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
        buf
    }

    /// CancelRequest: sent on its own socket, never answered.
    pub fn cancel_request(process_id: i32, secret_key: i32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(process_id);
        buf.put_i32(secret_key);
        buf
    }

    /// PasswordMessage ('p'): cleartext or md5-hashed password.
    pub fn password(password: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(password.len() + 6);
        buf.put_u8(b'p');
        buf.put_i32(4 + password.len() as i32 + 1);
        buf.put_slice(password.as_bytes());
        buf.put_u8(0);
        buf
    }

    /// SASLInitialResponse ('p'): mechanism name then a length-prefixed
    /// initial client response.
    pub fn sasl_initial_response(mechanism: &str, data: &[u8]) -> BytesMut {
        let content_len = mechanism.len() + 1 + 4 + data.len();
        let mut buf = BytesMut::with_capacity(content_len + 5);
        buf.put_u8(b'p');
        buf.put_i32(4 + content_len as i32);
        buf.put_slice(mechanism.as_bytes());
        buf.put_u8(0);
        buf.put_i32(data.len() as i32);
        buf.put_slice(data);
        buf
    }

    /// SASLResponse ('p'): raw continuation data.
    pub fn sasl_response(data: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(data.len() + 5);
        buf.put_u8(b'p');
        buf.put_i32(4 + data.len() as i32);
        buf.put_slice(data);
        buf
    }

    /// Query ('Q'): simple protocol, null-terminated query text.
    pub fn query(sql: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(sql.len() + 6);
        buf.put_u8(b'Q');
        buf.put_i32(4 + sql.len() as i32 + 1);
        buf.put_slice(sql.as_bytes());
        buf.put_u8(0);
        buf
    }

    /// Parse ('P'): statement name, query, then declared parameter OIDs
    /// (0 = let the server infer).
    pub fn parse(name: &str, sql: &str, param_oids: &[u32]) -> BytesMut {
        let content_len = name.len() + 1 + sql.len() + 1 + 2 + 4 * param_oids.len();
        let mut buf = BytesMut::with_capacity(content_len + 5);
        buf.put_u8(b'P');
        buf.put_i32(4 + content_len as i32);
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
        buf.put_slice(sql.as_bytes());
        buf.put_u8(0);
        buf.put_i16(param_oids.len() as i16);
        for &oid in param_oids {
            buf.put_u32(oid);
        }
        buf
    }

    /// Bind ('B'): portal, statement, parameter format codes, parameters
    /// (length-prefixed, -1 for NULL), result format codes.
    ///
    /// `param_formats` must be empty (all text), a single code applied to
    /// every parameter, or one code per parameter.
    pub fn bind(
        portal: &str,
        statement: &str,
        param_formats: &[i16],
        params: &[Option<Vec<u8>>],
        result_formats: &[i16],
    ) -> Result<BytesMut> {
        if params.len() > MAX_PARAMETERS {
            return Err(Error::InvalidArgument(
                "Extended protocol limited to 65535 parameters".into(),
            ));
        }
        if !(param_formats.is_empty()
            || param_formats.len() == 1
            || param_formats.len() == params.len())
        {
            return Err(Error::InvalidArgument(format!(
                "param_formats length must be 0, 1, or {} (got {})",
                params.len(),
                param_formats.len()
            )));
        }

        let params_size: usize = params
            .iter()
            .map(|p| 4 + p.as_ref().map_or(0, Vec::len))
            .sum();
        let content_len = portal.len()
            + 1
            + statement.len()
            + 1
            + 2
            + 2 * param_formats.len()
            + 2
            + params_size
            + 2
            + 2 * result_formats.len();

        let mut buf = BytesMut::with_capacity(content_len + 5);
        buf.put_u8(b'B');
        buf.put_i32(4 + content_len as i32);
        buf.put_slice(portal.as_bytes());
        buf.put_u8(0);
        buf.put_slice(statement.as_bytes());
        buf.put_u8(0);

        buf.put_u16(param_formats.len() as u16);
        for &code in param_formats {
            buf.put_i16(code);
        }

        buf.put_u16(params.len() as u16);
        for param in params {
            match param {
                None => buf.put_i32(-1),
                Some(data) => {
                    buf.put_i32(data.len() as i32);
                    buf.put_slice(data);
                }
            }
        }

        buf.put_u16(result_formats.len() as u16);
        for &code in result_formats {
            buf.put_i16(code);
        }
        Ok(buf)
    }

    /// Describe ('D') a prepared statement.
    pub fn describe_statement(name: &str) -> BytesMut {
        Self::describe(b'S', name)
    }

    /// Describe ('D') a portal.
    pub fn describe_portal(name: &str) -> BytesMut {
        Self::describe(b'P', name)
    }

    fn describe(kind: u8, name: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(name.len() + 7);
        buf.put_u8(b'D');
        buf.put_i32(4 + 1 + name.len() as i32 + 1);
        buf.put_u8(kind);
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
        buf
    }

    /// Execute ('E') a portal; max_rows 0 means unlimited.
    pub fn execute(portal: &str, max_rows: i32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(portal.len() + 10);
        buf.put_u8(b'E');
        buf.put_i32(4 + portal.len() as i32 + 1 + 4);
        buf.put_slice(portal.as_bytes());
        buf.put_u8(0);
        buf.put_i32(max_rows);
        buf
    }

    /// Close ('C') a prepared statement.
    pub fn close_statement(name: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(name.len() + 7);
        buf.put_u8(b'C');
        buf.put_i32(4 + 1 + name.len() as i32 + 1);
        buf.put_u8(b'S');
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
        buf
    }

    /// Sync ('S'): closes one extended-protocol unit of work.
    pub fn sync() -> BytesMut {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_slice(&[b'S', 0, 0, 0, 4]);
        buf
    }

    /// Terminate ('X'): sent best-effort before closing the socket.
    pub fn terminate() -> BytesMut {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_slice(&[b'X', 0, 0, 0, 4]);
        buf
    }

    /// CopyData ('d'): one chunk of a COPY stream.
    pub fn copy_data(data: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(data.len() + 5);
        buf.put_u8(b'd');
        buf.put_i32(4 + data.len() as i32);
        buf.put_slice(data);
        buf
    }

    /// CopyDone ('c'): client finished a COPY IN.
    pub fn copy_done() -> BytesMut {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_slice(&[b'c', 0, 0, 0, 4]);
        buf
    }

    /// CopyFail ('f'): abort a COPY IN with an error message.
    pub fn copy_fail(message: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(message.len() + 6);
        buf.put_u8(b'f');
        buf.put_i32(4 + message.len() as i32 + 1);
        buf.put_slice(message.as_bytes());
        buf.put_u8(0);
        buf
    }
}
