//! Buffered message receive.
//!
//! Backend frames are pulled out of a growable read buffer; each socket
//! read fetches at least `min_read_buffer_size` bytes of capacity worth of
//! data in one syscall. Cancellation never consumes partial bytes: a
//! partially buffered frame survives for the next call.

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::connection::PgConnection;
use crate::errors::{Error, Result};
use crate::protocol::BackendMessage;

/// Upper bound on a single backend message. PostgreSQL itself refuses
/// larger frames; anything beyond this means lost framing sync.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Frame header: tag byte and the declared length (which includes the four
/// length bytes but not the tag).
pub(crate) fn peek_frame(buffer: &[u8]) -> Result<Option<(u8, usize)>> {
    if buffer.len() < 5 {
        return Ok(None);
    }
    let tag = buffer[0];
    let len = i32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(Error::protocol(format!(
            "impossible message length {len} for type '{}'",
            tag as char
        )));
    }
    Ok(Some((tag, len as usize)))
}

impl PgConnection {
    /// Read one framed backend message, blocking until it is complete.
    pub(crate) async fn read_message(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<BackendMessage> {
        loop {
            if let Some((tag, len)) = peek_frame(&self.buffer)?
                && self.buffer.len() >= 1 + len
            {
                let frame = self.buffer.split_to(1 + len);
                return BackendMessage::decode(tag, &frame[5..]);
            }

            self.buffer.reserve(self.min_read_buffer_size);
            let read = self.stream.read_buf(&mut self.buffer);
            let n = match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(Error::Cancelled),
                        result = read => result,
                    }
                }
                None => read.await,
            }
            .map_err(|e| Error::closed(format!("read failed: {e}")))?;

            if n == 0 {
                return Err(Error::closed("server closed the connection"));
            }
        }
    }
}
