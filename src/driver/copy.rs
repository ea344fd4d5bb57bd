//! COPY IN / COPY OUT drivers.
//!
//! COPY IN forwards a caller-supplied byte stream as `CopyData` frames
//! while watching the wire for early server errors; exactly one of
//! `CopyDone` or `CopyFail` terminates the stream no matter which side
//! fails first. COPY OUT writes every received `CopyData` payload into a
//! caller-supplied sink.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::connection::{OpCancel, PgConnection};
use crate::errors::{Error, Result};
use crate::protocol::{BackendMessage, CommandTag, FrontendEncoder};

/// Size of one forwarded COPY chunk.
const COPY_CHUNK_SIZE: usize = 65536;

/// What woke the COPY IN loop.
enum CopyInStep {
    Source(std::io::Result<usize>),
    Wire(Result<BackendMessage>),
}

impl PgConnection {
    /// Run `sql` (normally a `COPY ... FROM STDIN`) and stream `source` to
    /// the server. Returns the server's command tag, whose
    /// `rows_affected()` is the number of rows copied.
    ///
    /// A non-copy statement is tolerated: its results are discarded and
    /// its tag returned.
    pub async fn copy_from<R>(
        &mut self,
        sql: &str,
        source: &mut R,
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandTag>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut op = OpCancel::new(cancel);
        op.check_before_start()?;
        self.lock().await?;
        if let Err(e) = self.send(&FrontendEncoder::query(sql)).await {
            self.unlock_quiet();
            return Err(e);
        }

        // copy_from_inner leaves the wire at ReadyForQuery on every path
        // where the connection survives.
        let result = self.copy_from_inner(source, &mut op).await;
        self.unlock_quiet();
        result
    }

    async fn copy_from_inner<R>(
        &mut self,
        source: &mut R,
        op: &mut OpCancel,
    ) -> Result<CommandTag>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut tag: Option<CommandTag> = None;

        // Wait for the server to open the copy stream. A non-copy reply
        // runs to completion right here.
        loop {
            match self.receive_for_op(op).await {
                Ok(BackendMessage::CopyInResponse { .. }) => break,
                Ok(BackendMessage::CommandComplete(t)) => tag = Some(t),
                Ok(BackendMessage::ReadyForQuery(_)) => {
                    return Ok(tag.unwrap_or_default());
                }
                Ok(other) => trace!("ignoring {other:?} before copy stream"),
                Err(Error::Pg(pg)) if !pg.is_fatal() => {
                    self.restore_connection_state().await?;
                    return Err(Error::Pg(pg));
                }
                Err(e) => return Err(e),
            }
        }

        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        let mut sent_final = false;
        let mut source_error: Option<std::io::Error> = None;
        let mut server_error: Option<Error> = None;

        loop {
            if sent_final || server_error.is_some() {
                // Our side of the stream is closed; drain to ReadyForQuery.
                match self.receive_for_op(op).await {
                    Ok(BackendMessage::CommandComplete(t)) => tag = Some(t),
                    Ok(BackendMessage::ReadyForQuery(_)) => break,
                    Ok(other) => trace!("ignoring {other:?} while finishing copy"),
                    Err(Error::Pg(pg)) if !pg.is_fatal() => {
                        if server_error.is_none() {
                            server_error = Some(Error::Pg(pg));
                        }
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            let step = {
                let token = if op.fired { None } else { op.token.as_ref() };
                let wire = self.read_message(token);
                tokio::select! {
                    biased;
                    message = wire => CopyInStep::Wire(message),
                    read = source.read(&mut chunk) => CopyInStep::Source(read),
                }
            };

            match step {
                CopyInStep::Source(Ok(0)) => {
                    self.send(&FrontendEncoder::copy_done()).await?;
                    sent_final = true;
                }
                CopyInStep::Source(Ok(n)) => {
                    self.send(&FrontendEncoder::copy_data(&chunk[..n])).await?;
                }
                CopyInStep::Source(Err(e)) => {
                    debug!("copy source failed: {e}");
                    self.send(&FrontendEncoder::copy_fail(&e.to_string()))
                        .await?;
                    sent_final = true;
                    source_error = Some(e);
                }
                CopyInStep::Wire(Err(Error::Cancelled)) => {
                    debug!("copy cancelled, sending CopyFail");
                    op.fired = true;
                    self.send(&FrontendEncoder::copy_fail("COPY cancelled"))
                        .await?;
                    sent_final = true;
                }
                CopyInStep::Wire(Ok(message)) => {
                    // Early server traffic; apply the same side effects
                    // receive_message would.
                    match self.apply_side_effects(message) {
                        Ok(BackendMessage::CommandComplete(t)) => tag = Some(t),
                        Ok(BackendMessage::ReadyForQuery(_)) => break,
                        Ok(other) => trace!("ignoring {other:?} during copy"),
                        Err(Error::Pg(pg)) if !pg.is_fatal() => {
                            server_error = Some(Error::Pg(pg));
                        }
                        Err(e) => return Err(e),
                    }
                }
                CopyInStep::Wire(Err(e)) => {
                    self.abort();
                    return Err(e);
                }
            }
        }

        if let Some(e) = server_error {
            return Err(e);
        }
        if let Some(e) = source_error {
            return Err(Error::Io(e));
        }
        Ok(tag.unwrap_or_default())
    }

    /// Run `sql` (normally a `COPY ... TO STDOUT`) and write every
    /// received chunk into `sink`. A sink failure fires a best-effort
    /// cancel request, the wire is still drained to ReadyForQuery, and the
    /// sink error is re-raised.
    pub async fn copy_to<W>(
        &mut self,
        sql: &str,
        sink: &mut W,
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandTag>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut op = OpCancel::new(cancel);
        op.check_before_start()?;
        self.lock().await?;
        if let Err(e) = self.send(&FrontendEncoder::query(sql)).await {
            self.unlock_quiet();
            return Err(e);
        }

        let mut tag: Option<CommandTag> = None;
        let mut sink_error: Option<std::io::Error> = None;
        let mut server_error: Option<Error> = None;

        loop {
            match self.receive_for_op(&mut op).await {
                Ok(BackendMessage::CopyData(bytes)) => {
                    if sink_error.is_none()
                        && let Err(e) = sink.write_all(&bytes).await
                    {
                        debug!("copy sink failed: {e}");
                        sink_error = Some(e);
                        if let Err(cancel_err) = self.cancel_request(None).await {
                            debug!("cancel request failed: {cancel_err}");
                        }
                    }
                }
                Ok(BackendMessage::CopyOutResponse { .. }) | Ok(BackendMessage::CopyDone) => {}
                Ok(BackendMessage::CommandComplete(t)) => tag = Some(t),
                Ok(BackendMessage::ReadyForQuery(_)) => break,
                Ok(other) => trace!("ignoring {other:?} during copy out"),
                Err(Error::Pg(pg)) if !pg.is_fatal() => {
                    if server_error.is_none() {
                        server_error = Some(Error::Pg(pg));
                    }
                }
                Err(e) => {
                    self.unlock_quiet();
                    return Err(e);
                }
            }
        }
        self.unlock_quiet();

        if sink_error.is_none()
            && let Err(e) = sink.flush().await
        {
            sink_error = Some(e);
        }
        if let Some(e) = sink_error {
            return Err(Error::Io(e));
        }
        if let Some(e) = server_error {
            return Err(e);
        }
        Ok(tag.unwrap_or_default())
    }

    /// The side-effect half of `receive_message`, for messages read
    /// through the raw framer inside the COPY select loop.
    fn apply_side_effects(&mut self, message: BackendMessage) -> Result<BackendMessage> {
        match &message {
            BackendMessage::ErrorResponse(err) => {
                let err = Box::new(err.clone());
                if err.is_fatal() {
                    self.abort();
                }
                Err(Error::Pg(err))
            }
            BackendMessage::NoticeResponse(notice) => {
                if let Some(hook) = &self.on_notice {
                    hook(notice);
                }
                Ok(message)
            }
            BackendMessage::NotificationResponse(notification) => {
                if let Some(hook) = &self.on_notification {
                    hook(notification);
                }
                Ok(message)
            }
            _ => Ok(message),
        }
    }
}
