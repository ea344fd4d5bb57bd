//! Connection core: the lock/status machine, `receive_message` with its
//! standard side effects, error recovery, and the public query operations.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::results::{ExtendedResultReader, MultiResultReader};
use super::stream::PgStream;
use crate::config::{NoticeHook, NotificationHook};
use crate::errors::{Error, Result};
use crate::protocol::{
    BackendMessage, FieldDescription, FrontendEncoder, Notification, TransactionStatus,
};

/// Where the backend lives, remembered so cancel requests can open a second
/// socket to the same place.
#[derive(Debug, Clone)]
pub(crate) enum RemoteAddr {
    Tcp(String, u16),
    #[cfg_attr(not(unix), allow(dead_code))]
    Unix(PathBuf),
}

/// Connection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Ready for the next operation
    Idle,
    /// A reader or in-flight operation owns the wire
    Busy,
    /// Terminal; no operation resets it
    Closed,
}

/// Result of a successful `prepare`. Immutable once returned.
#[derive(Debug, Clone)]
pub struct StatementDescription {
    pub name: String,
    pub sql: String,
    pub param_oids: Vec<u32>,
    pub fields: Vec<FieldDescription>,
}

/// Per-operation cancellation state. The token is consulted until it fires
/// once; after that the operation keeps draining the wire and ignores it.
pub(crate) struct OpCancel {
    pub(crate) token: Option<CancellationToken>,
    pub(crate) fired: bool,
}

impl OpCancel {
    pub(crate) fn new(token: Option<&CancellationToken>) -> Self {
        Self {
            token: token.cloned(),
            fired: false,
        }
    }

    /// Pre-signalled tokens fail the operation before it touches the wire.
    pub(crate) fn check_before_start(&self) -> Result<()> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// A single PostgreSQL connection. Not a pool, and not safe for concurrent
/// use: a higher layer owns each connection and runs one operation at a
/// time on it.
pub struct PgConnection {
    pub(crate) stream: PgStream,
    pub(crate) buffer: BytesMut,
    pub(crate) min_read_buffer_size: usize,
    pub(crate) remote: RemoteAddr,

    status: ConnectionStatus,
    /// Set when a reader was dropped mid-stream; the next lock() drains the
    /// wire back to ReadyForQuery before granting.
    pub(crate) needs_resync: bool,

    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,
    tx_status: TransactionStatus,
    parameters: HashMap<String, String>,

    pub(crate) on_notice: Option<NoticeHook>,
    pub(crate) on_notification: Option<NotificationHook>,
}

impl PgConnection {
    pub(crate) fn new(
        stream: PgStream,
        remote: RemoteAddr,
        min_read_buffer_size: usize,
        on_notice: Option<NoticeHook>,
        on_notification: Option<NotificationHook>,
    ) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(min_read_buffer_size),
            min_read_buffer_size,
            remote,
            status: ConnectionStatus::Idle,
            needs_resync: false,
            process_id: 0,
            secret_key: 0,
            tx_status: TransactionStatus::Idle,
            parameters: HashMap::new(),
            on_notice,
            on_notification,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Backend pid reported by `BackendKeyData`.
    pub fn backend_pid(&self) -> i32 {
        self.process_id
    }

    /// Transaction status byte from the most recent `ReadyForQuery`.
    pub fn tx_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Most recent `ParameterStatus` value for a setting, e.g.
    /// `server_version` or `client_encoding`.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    // ==================== state machine ====================

    /// Take exclusive ownership of the wire for one operation.
    pub(crate) async fn lock(&mut self) -> Result<()> {
        match self.status {
            ConnectionStatus::Closed => Err(Error::Lock("connection is CLOSED".into())),
            ConnectionStatus::Busy => Err(Error::Lock("connection is BUSY".into())),
            ConnectionStatus::Idle => {
                self.status = ConnectionStatus::Busy;
                if self.needs_resync {
                    debug!("draining wire left unfinished by a dropped reader");
                    if let Err(e) = self.restore_connection_state().await {
                        return Err(e);
                    }
                    self.needs_resync = false;
                }
                Ok(())
            }
        }
    }

    pub(crate) fn unlock(&mut self) -> Result<()> {
        match self.status {
            ConnectionStatus::Closed => Ok(()),
            ConnectionStatus::Idle => Err(Error::Unlock(
                "connection is IDLE, no operation to release".into(),
            )),
            ConnectionStatus::Busy => {
                self.status = ConnectionStatus::Idle;
                Ok(())
            }
        }
    }

    /// Release after an error path, where the connection may already be
    /// closed and a second failure has nothing useful to add.
    pub(crate) fn unlock_quiet(&mut self) {
        if self.status == ConnectionStatus::Busy {
            self.status = ConnectionStatus::Idle;
        }
    }

    /// Drop the connection into its terminal state without the Terminate
    /// handshake; used when the wire is already broken.
    pub(crate) fn abort(&mut self) {
        if self.status != ConnectionStatus::Closed {
            self.status = ConnectionStatus::Closed;
        }
    }

    // ==================== wire primitives ====================

    /// Write one group of frontend frames. Any failure closes the
    /// connection: a partial write leaves the stream unusable.
    pub(crate) async fn send(&mut self, frames: &[u8]) -> Result<()> {
        if self.status == ConnectionStatus::Closed {
            return Err(Error::closed("connection is closed"));
        }
        let result = async {
            self.stream.write_all(frames).await?;
            self.stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.abort();
            return Err(Error::closed(format!("write failed: {e}")));
        }
        Ok(())
    }

    /// Receive the next backend message and apply its standard side
    /// effects before handing it to the caller:
    ///
    /// - `ParameterStatus` updates the parameter map
    /// - `ReadyForQuery` updates the transaction status
    /// - notices and notifications are dispatched to their callbacks
    /// - `ErrorResponse` is raised as [`Error::Pg`]; FATAL severities close
    ///   the connection first
    /// - stream or codec failures close the connection
    ///
    /// A cancellation firing mid-read surfaces as [`Error::Cancelled`] and
    /// consumes nothing: the connection stays usable.
    pub async fn receive_message(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<BackendMessage> {
        if self.status == ConnectionStatus::Closed {
            return Err(Error::closed("connection is closed"));
        }
        let message = match self.read_message(cancel).await {
            Ok(message) => message,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };

        match &message {
            BackendMessage::ParameterStatus { name, value } => {
                trace!(name = %name, value = %value, "parameter status");
                self.parameters.insert(name.clone(), value.clone());
            }
            BackendMessage::ReadyForQuery(status) => {
                self.tx_status = *status;
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.process_id = *process_id;
                self.secret_key = *secret_key;
            }
            BackendMessage::NoticeResponse(notice) => {
                if let Some(hook) = &self.on_notice {
                    hook(notice);
                }
            }
            BackendMessage::NotificationResponse(notification) => {
                if let Some(hook) = &self.on_notification {
                    hook(notification);
                }
            }
            BackendMessage::ErrorResponse(err) => {
                let err = Box::new(err.clone());
                if err.is_fatal() {
                    debug!(sql_state = %err.sql_state, "fatal server error, closing connection");
                    self.abort();
                }
                return Err(Error::Pg(err));
            }
            _ => {}
        }
        Ok(message)
    }

    /// Receive inside a data operation. The first time the token fires, a
    /// best-effort cancel request goes out on a secondary socket and the
    /// operation keeps reading; the protocol still has to reach
    /// ReadyForQuery, usually via a `57014` error from the server.
    pub(crate) async fn receive_for_op(&mut self, cancel: &mut OpCancel) -> Result<BackendMessage> {
        if cancel.fired {
            return self.receive_message(None).await;
        }
        match self.receive_message(cancel.token.as_ref()).await {
            Err(Error::Cancelled) => {
                cancel.fired = true;
                if let Err(e) = self.cancel_request(None).await {
                    debug!("cancel request failed: {e}");
                }
                self.receive_message(None).await
            }
            other => other,
        }
    }

    /// Drain the wire back to ReadyForQuery after a recoverable error.
    /// Further non-fatal server errors during the drain are absorbed; a
    /// fatal one stops it (the connection is closed by then). Not
    /// cancellable.
    pub(crate) async fn restore_connection_state(&mut self) -> Result<()> {
        loop {
            match self.receive_message(None).await {
                Ok(BackendMessage::ReadyForQuery(_)) => return Ok(()),
                Ok(_) => {}
                Err(Error::Pg(e)) if !e.is_fatal() => {
                    trace!(sql_state = %e.sql_state, "absorbed server error during drain");
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ==================== public operations ====================

    /// Execute one or more statements with the simple protocol. Rows
    /// stream through the returned reader; the connection stays BUSY until
    /// the reader finishes or is closed.
    pub async fn exec(
        &mut self,
        sql: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<MultiResultReader<'_>> {
        let op = OpCancel::new(cancel);
        op.check_before_start()?;
        self.lock().await?;
        if let Err(e) = self.send(&FrontendEncoder::query(sql)).await {
            self.unlock_quiet();
            return Err(e);
        }
        Ok(MultiResultReader::new(self, op))
    }

    /// Prepare a named statement and describe it. The connection is IDLE
    /// again when this returns, success or error.
    pub async fn prepare(
        &mut self,
        name: &str,
        sql: &str,
        param_oids: &[u32],
        cancel: Option<&CancellationToken>,
    ) -> Result<StatementDescription> {
        let mut op = OpCancel::new(cancel);
        op.check_before_start()?;
        self.lock().await?;

        let result = self.prepare_inner(name, sql, param_oids, &mut op).await;
        match result {
            Ok(description) => {
                self.unlock()?;
                Ok(description)
            }
            Err(Error::Pg(e)) if !e.is_fatal() => {
                self.restore_connection_state().await?;
                self.unlock_quiet();
                Err(Error::Pg(e))
            }
            Err(e) => {
                self.unlock_quiet();
                Err(e)
            }
        }
    }

    async fn prepare_inner(
        &mut self,
        name: &str,
        sql: &str,
        param_oids: &[u32],
        cancel: &mut OpCancel,
    ) -> Result<StatementDescription> {
        let mut frames = FrontendEncoder::parse(name, sql, param_oids);
        frames.extend_from_slice(&FrontendEncoder::describe_statement(name));
        frames.extend_from_slice(&FrontendEncoder::sync());
        self.send(&frames).await?;

        let mut description = StatementDescription {
            name: name.to_string(),
            sql: sql.to_string(),
            param_oids: param_oids.to_vec(),
            fields: Vec::new(),
        };
        loop {
            match self.receive_for_op(cancel).await? {
                BackendMessage::ParameterDescription(oids) => description.param_oids = oids,
                BackendMessage::RowDescription(fields) => description.fields = fields,
                BackendMessage::ReadyForQuery(_) => return Ok(description),
                _ => {}
            }
        }
    }

    /// One-shot extended-protocol query: parse, bind, describe, execute,
    /// sync. The reader has already consumed up to `RowDescription` /
    /// `NoData` when this returns.
    pub async fn exec_params(
        &mut self,
        sql: &str,
        values: &[Option<Vec<u8>>],
        param_oids: &[u32],
        param_formats: &[i16],
        result_formats: &[i16],
        cancel: Option<&CancellationToken>,
    ) -> Result<ExtendedResultReader<'_>> {
        // Validation happens while encoding, before the wire is touched.
        let mut frames = FrontendEncoder::parse("", sql, param_oids);
        frames.extend_from_slice(&FrontendEncoder::bind(
            "",
            "",
            param_formats,
            values,
            result_formats,
        )?);
        frames.extend_from_slice(&FrontendEncoder::describe_portal(""));
        frames.extend_from_slice(&FrontendEncoder::execute("", 0));
        frames.extend_from_slice(&FrontendEncoder::sync());
        self.start_extended(frames, cancel).await
    }

    /// Execute a statement prepared earlier with [`PgConnection::prepare`].
    pub async fn exec_prepared(
        &mut self,
        statement: &str,
        values: &[Option<Vec<u8>>],
        param_formats: &[i16],
        result_formats: &[i16],
        cancel: Option<&CancellationToken>,
    ) -> Result<ExtendedResultReader<'_>> {
        let mut frames =
            FrontendEncoder::bind("", statement, param_formats, values, result_formats)?;
        frames.extend_from_slice(&FrontendEncoder::describe_portal(""));
        frames.extend_from_slice(&FrontendEncoder::execute("", 0));
        frames.extend_from_slice(&FrontendEncoder::sync());
        self.start_extended(frames, cancel).await
    }

    async fn start_extended(
        &mut self,
        frames: BytesMut,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExtendedResultReader<'_>> {
        let mut op = OpCancel::new(cancel);
        op.check_before_start()?;
        self.lock().await?;
        if let Err(e) = self.send(&frames).await {
            self.unlock_quiet();
            return Err(e);
        }

        match self.read_extended_header(&mut op).await {
            Ok(fields) => Ok(ExtendedResultReader::new(self, op, fields)),
            Err(Error::Pg(e)) if !e.is_fatal() => {
                self.restore_connection_state().await?;
                self.unlock_quiet();
                Err(Error::Pg(e))
            }
            Err(e) => {
                self.unlock_quiet();
                Err(e)
            }
        }
    }

    /// Drain ParseComplete/BindComplete up to the result shape.
    async fn read_extended_header(
        &mut self,
        cancel: &mut OpCancel,
    ) -> Result<Vec<FieldDescription>> {
        loop {
            match self.receive_for_op(cancel).await? {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::ParameterDescription(_) => {}
                BackendMessage::RowDescription(fields) => return Ok(fields),
                BackendMessage::NoData => return Ok(Vec::new()),
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected message while waiting for row description: {other:?}"
                    )));
                }
            }
        }
    }

    /// Block until a notification arrives. Messages received along the way
    /// get their normal processing.
    pub async fn wait_for_notification(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Notification> {
        let op = OpCancel::new(cancel);
        op.check_before_start()?;
        self.lock().await?;
        loop {
            match self.receive_message(op.token.as_ref()).await {
                Ok(BackendMessage::NotificationResponse(notification)) => {
                    self.unlock_quiet();
                    return Ok(notification);
                }
                Ok(_) => {}
                Err(e) => {
                    // Cancelled here leaves no request outstanding; the
                    // connection simply returns to IDLE.
                    self.unlock_quiet();
                    return Err(e);
                }
            }
        }
    }

    /// Close the connection: best-effort Terminate, then drop the socket.
    /// Safe to call any number of times.
    pub async fn close(&mut self) {
        if self.status == ConnectionStatus::Closed {
            return;
        }
        self.status = ConnectionStatus::Closed;
        let _ = self.stream.write_all(&FrontendEncoder::terminate()).await;
        let _ = self.stream.flush().await;
        let _ = self.stream.shutdown().await;
        debug!(pid = self.process_id, "connection closed");
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if self.status != ConnectionStatus::Closed {
            // Async close never ran; tell the server we are leaving.
            self.stream.try_write(&FrontendEncoder::terminate());
        }
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("status", &self.status)
            .field("process_id", &self.process_id)
            .field("tx_status", &self.tx_status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_cancel_pre_signalled() {
        let token = CancellationToken::new();
        token.cancel();
        let op = OpCancel::new(Some(&token));
        assert!(matches!(op.check_before_start(), Err(Error::Cancelled)));

        let op = OpCancel::new(None);
        assert!(op.check_before_start().is_ok());
    }
}
