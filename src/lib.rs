//! # pglink
//!
//! A low-level driver for the PostgreSQL v3 wire protocol: one
//! connection, no pool, no type mapping. It speaks the frontend/backend
//! protocol directly and hands rows back as raw bytes, leaving query
//! building, pooling, and value decoding to the layer above.
//!
//! ## Architecture
//!
//! ```text
//! Config ──connect()──► PgConnection ──exec()/exec_params()──► readers
//!                            │
//!                   protocol (pure, sync)
//!                            │
//!                     TCP / TLS / Unix
//! ```
//!
//! - `protocol` — message framing, encoding, and SCRAM; no I/O
//! - `driver` — the async connection core, establishment, readers, COPY
//! - `config` — hosts, TLS, hooks, connection strings, `PG*` environment
//!
//! ## Example
//!
//! ```ignore
//! use pglink::{Config, connect};
//!
//! let config = Config::from_conninfo("host=localhost user=postgres dbname=app")?;
//! let mut conn = connect(&config).await?;
//!
//! let mut reader = conn.exec("select 'Hello, world'", None).await?;
//! let results = reader.read_all().await?;
//! assert_eq!(results[0].rows[0][0].as_deref(), Some(&b"Hello, world"[..]));
//! ```
//!
//! The connection enforces single ownership of the wire: while a reader
//! is open the connection is BUSY and any other operation fails with a
//! lock error. Recoverable failures (server errors, cancellation) leave
//! the connection IDLE and usable; broken-wire failures close it.

pub mod config;
pub mod driver;
pub mod errors;
pub mod protocol;

pub use config::{Config, HostConfig, SslMode, TargetSessionAttrs, TlsConfig};
pub use driver::{
    ConnectionStatus, ExtendedResultReader, MultiResultReader, PgConnection, QueryResult,
    ResultReaderSimple, StatementDescription, connect,
};
pub use errors::{Error, PgServerError, Result};
pub use protocol::{
    BackendMessage, CommandTag, FieldDescription, Notification, TransactionStatus,
};

/// Re-exported so callers can build cancellation tokens without taking a
/// tokio-util dependency of their own.
pub use tokio_util::sync::CancellationToken;
