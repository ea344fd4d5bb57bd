//! Streaming result readers.
//!
//! A reader owns the wire (the connection stays BUSY) until it has seen
//! the protocol back to its boundary: `ReadyForQuery` for the top-level
//! readers, `CommandComplete` for the per-result reader of the simple
//! protocol. Every reader releases the connection exactly once; dropping
//! an unfinished reader defers the drain to the next operation.

use tracing::trace;

use super::connection::{OpCancel, PgConnection};
use crate::errors::{Error, Result};
use crate::protocol::{BackendMessage, CommandTag, FieldDescription};

/// One fully materialized statement result.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub field_descriptions: Vec<FieldDescription>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub command_tag: CommandTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultiState {
    /// Waiting for the next RowDescription / CommandComplete / ReadyForQuery
    BetweenResults,
    /// Inside a result; rows may follow
    InResult,
    /// Current result already hit CommandComplete
    ResultComplete,
    /// Saw ReadyForQuery; the connection has been released
    Finished,
}

/// Reader over the results of one simple-protocol `Query`, which may hold
/// any number of statements.
pub struct MultiResultReader<'conn> {
    conn: &'conn mut PgConnection,
    cancel: OpCancel,
    state: MultiState,
    fields: Vec<FieldDescription>,
    current_row: Option<Vec<Option<Vec<u8>>>>,
    command_tag: Option<CommandTag>,
    partial: Vec<QueryResult>,
    released: bool,
}

impl<'conn> MultiResultReader<'conn> {
    pub(crate) fn new(conn: &'conn mut PgConnection, cancel: OpCancel) -> Self {
        Self {
            conn,
            cancel,
            state: MultiState::BetweenResults,
            fields: Vec::new(),
            current_row: None,
            command_tag: None,
            partial: Vec::new(),
            released: false,
        }
    }

    /// Advance to the next result. Returns `false` once the server is back
    /// at ReadyForQuery, at which point the connection is IDLE again.
    pub async fn next_result(&mut self) -> Result<bool> {
        match self.state {
            MultiState::Finished => return Ok(false),
            // The previous result was not consumed; finish it first.
            MultiState::InResult => {
                while self.state == MultiState::InResult {
                    self.advance_row().await?;
                }
            }
            MultiState::BetweenResults | MultiState::ResultComplete => {}
        }

        loop {
            match self.receive().await? {
                BackendMessage::RowDescription(fields) => {
                    self.fields = fields;
                    self.current_row = None;
                    self.command_tag = None;
                    self.state = MultiState::InResult;
                    return Ok(true);
                }
                BackendMessage::CommandComplete(tag) => {
                    // A statement without rows, e.g. CREATE TABLE.
                    self.fields = Vec::new();
                    self.current_row = None;
                    self.command_tag = Some(tag);
                    self.state = MultiState::ResultComplete;
                    return Ok(true);
                }
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::ReadyForQuery(_) => {
                    self.state = MultiState::Finished;
                    self.release();
                    return Ok(false);
                }
                other => {
                    trace!("ignoring {other:?} between results");
                }
            }
        }
    }

    /// Reader over the rows of the result `next_result` just produced.
    pub fn result_reader(&mut self) -> ResultReaderSimple<'_, 'conn> {
        ResultReaderSimple { reader: self }
    }

    /// Drain every remaining result into a list. On error the results
    /// completed so far stay available through
    /// [`MultiResultReader::partial_results`].
    pub async fn read_all(&mut self) -> Result<Vec<QueryResult>> {
        while self.next_result().await? {
            let result = self.result_reader().read_result().await?;
            self.partial.push(result);
        }
        Ok(std::mem::take(&mut self.partial))
    }

    /// Results fully received before `read_all` failed.
    pub fn partial_results(&self) -> &[QueryResult] {
        &self.partial
    }

    /// Whether the wire has reached ReadyForQuery.
    pub fn is_finished(&self) -> bool {
        self.state == MultiState::Finished
    }

    /// Finish the reader, draining any unread results.
    pub async fn close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        let result = self.conn.restore_connection_state().await;
        self.state = MultiState::Finished;
        self.release();
        result
    }

    /// One wire message, with the shared error discipline: non-fatal
    /// server errors drain to ReadyForQuery and release before re-raising.
    async fn receive(&mut self) -> Result<BackendMessage> {
        match self.conn.receive_for_op(&mut self.cancel).await {
            Ok(message) => Ok(message),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn fail(&mut self, e: Error) -> Error {
        if let Error::Pg(pg) = &e
            && !pg.is_fatal()
            && let Err(drain_error) = self.conn.restore_connection_state().await
        {
            self.state = MultiState::Finished;
            self.release();
            return drain_error;
        }
        self.state = MultiState::Finished;
        self.release();
        e
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.conn.unlock_quiet();
        }
    }

    /// Pull the next row of the current result.
    async fn advance_row(&mut self) -> Result<bool> {
        loop {
            match self.receive().await? {
                BackendMessage::DataRow(values) => {
                    self.current_row = Some(values);
                    return Ok(true);
                }
                BackendMessage::CommandComplete(tag) => {
                    self.command_tag = Some(tag);
                    self.current_row = None;
                    self.state = MultiState::ResultComplete;
                    return Ok(false);
                }
                other => {
                    trace!("ignoring {other:?} inside a result");
                }
            }
        }
    }
}

impl Drop for MultiResultReader<'_> {
    fn drop(&mut self) {
        if !self.released {
            // Cannot drain here; the next lock() resynchronizes the wire.
            self.conn.needs_resync = true;
            self.released = true;
            self.conn.unlock_quiet();
        }
    }
}

/// Row-by-row reader for one result of the simple protocol. Wraps the
/// multi-result reader and leaves it positioned for the next result.
pub struct ResultReaderSimple<'r, 'conn> {
    reader: &'r mut MultiResultReader<'conn>,
}

impl ResultReaderSimple<'_, '_> {
    pub fn field_descriptions(&self) -> &[FieldDescription] {
        &self.reader.fields
    }

    /// Advance to the next row; `false` once the result is complete.
    pub async fn next_row(&mut self) -> Result<bool> {
        if self.reader.state != MultiState::InResult {
            return Ok(false);
        }
        self.reader.advance_row().await
    }

    /// Values of the row `next_row` just produced.
    pub fn row_values(&self) -> Option<&[Option<Vec<u8>>]> {
        self.reader.current_row.as_deref()
    }

    /// Tag of the completed result; present once `next_row` returned false.
    pub fn command_tag(&self) -> Option<&CommandTag> {
        self.reader.command_tag.as_ref()
    }

    /// Collect the remaining rows of this result.
    pub async fn read_result(&mut self) -> Result<QueryResult> {
        let mut rows = Vec::new();
        while self.next_row().await? {
            if let Some(values) = self.reader.current_row.take() {
                rows.push(values);
            }
        }
        Ok(QueryResult {
            field_descriptions: std::mem::take(&mut self.reader.fields),
            rows,
            command_tag: self.reader.command_tag.clone().unwrap_or_default(),
        })
    }

    /// Skip the rest of this result so the outer reader stays usable.
    pub async fn close(&mut self) -> Result<()> {
        while self.next_row().await? {}
        Ok(())
    }
}

/// Single-result reader for the extended protocol. Construction (via
/// `exec_params` / `exec_prepared`) has already consumed the wire up to
/// `RowDescription` or `NoData`.
pub struct ExtendedResultReader<'conn> {
    conn: &'conn mut PgConnection,
    cancel: OpCancel,
    fields: Vec<FieldDescription>,
    current_row: Option<Vec<Option<Vec<u8>>>>,
    command_tag: Option<CommandTag>,
    finished: bool,
    released: bool,
}

impl<'conn> ExtendedResultReader<'conn> {
    pub(crate) fn new(
        conn: &'conn mut PgConnection,
        cancel: OpCancel,
        fields: Vec<FieldDescription>,
    ) -> Self {
        Self {
            conn,
            cancel,
            fields,
            current_row: None,
            command_tag: None,
            finished: false,
            released: false,
        }
    }

    pub fn field_descriptions(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Advance to the next row; `false` once the server is back at
    /// ReadyForQuery (the connection is IDLE again at that point).
    pub async fn next_row(&mut self) -> Result<bool> {
        while !self.finished {
            let message = match self.conn.receive_for_op(&mut self.cancel).await {
                Ok(message) => message,
                Err(e) => return Err(self.fail(e).await),
            };
            match message {
                BackendMessage::DataRow(values) => {
                    self.current_row = Some(values);
                    return Ok(true);
                }
                BackendMessage::CommandComplete(tag) => {
                    self.command_tag = Some(tag);
                    self.current_row = None;
                }
                // An empty query produces no rows and no tag.
                BackendMessage::EmptyQueryResponse => {
                    self.current_row = None;
                }
                BackendMessage::PortalSuspended => {}
                BackendMessage::ReadyForQuery(_) => {
                    self.finished = true;
                    self.release();
                }
                other => {
                    trace!("ignoring {other:?} in extended result");
                }
            }
        }
        Ok(false)
    }

    pub fn row_values(&self) -> Option<&[Option<Vec<u8>>]> {
        self.current_row.as_deref()
    }

    pub fn command_tag(&self) -> Option<&CommandTag> {
        self.command_tag.as_ref()
    }

    /// Collect all remaining rows.
    pub async fn read_result(&mut self) -> Result<QueryResult> {
        let mut rows = Vec::new();
        while self.next_row().await? {
            if let Some(values) = self.current_row.take() {
                rows.push(values);
            }
        }
        Ok(QueryResult {
            field_descriptions: self.fields.clone(),
            rows,
            command_tag: self.command_tag.clone().unwrap_or_default(),
        })
    }

    /// Finish the reader, draining any unread protocol messages.
    pub async fn close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        let result = if self.finished {
            Ok(())
        } else {
            self.conn.restore_connection_state().await
        };
        self.finished = true;
        self.release();
        result
    }

    async fn fail(&mut self, e: Error) -> Error {
        if let Error::Pg(pg) = &e
            && !pg.is_fatal()
            && let Err(drain_error) = self.conn.restore_connection_state().await
        {
            self.finished = true;
            self.release();
            return drain_error;
        }
        self.finished = true;
        self.release();
        e
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.conn.unlock_quiet();
        }
    }
}

impl Drop for ExtendedResultReader<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.conn.needs_resync = true;
            self.released = true;
            self.conn.unlock_quiet();
        }
    }
}
