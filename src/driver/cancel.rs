//! Out-of-band query cancellation.
//!
//! A cancel request travels on a *new* socket to the same address,
//! carrying the pid and secret key remembered from `BackendKeyData`. The
//! primary socket is never reused for this.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use super::connection::{PgConnection, RemoteAddr};
use crate::errors::{Error, Result};
use crate::protocol::FrontendEncoder;

impl PgConnection {
    /// Attempt to cancel whatever this connection is executing. Per
    /// protocol the outcome is neither guaranteed nor observable; the
    /// in-flight operation must still be awaited on the primary socket.
    pub async fn cancel_request(&self, timeout: Option<Duration>) -> Result<()> {
        let frame = FrontendEncoder::cancel_request(self.process_id, self.secret_key);
        debug!(pid = self.process_id, "sending cancel request");

        let io = async {
            match &self.remote {
                RemoteAddr::Tcp(host, port) => {
                    let mut socket = TcpStream::connect((host.as_str(), *port)).await?;
                    socket.write_all(&frame).await?;
                    socket.shutdown().await
                }
                #[cfg(unix)]
                RemoteAddr::Unix(path) => {
                    let mut socket = UnixStream::connect(path).await?;
                    socket.write_all(&frame).await?;
                    socket.shutdown().await
                }
                #[cfg(not(unix))]
                RemoteAddr::Unix(_) => Err(std::io::Error::other(
                    "unix sockets are not supported on this platform",
                )),
            }
        };

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, io)
                .await
                .map_err(|_| Error::connect("cancel request timed out"))?,
            None => io.await,
        };
        result.map_err(|e| Error::connect(format!("cancel request failed: {e}")))
    }
}
