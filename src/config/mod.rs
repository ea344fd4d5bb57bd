//! Connection configuration.
//!
//! A [`Config`] can be built programmatically or parsed from a libpq-style
//! connection string / URI (see [`Config::from_conninfo`]), with `PG*`
//! environment variables, `.pgpass` and `.pg_service.conf` layered in the
//! same way libpq layers them.

mod conninfo;
mod passfile;
mod service;

pub(crate) use passfile::lookup_password;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::driver::PgConnection;
use crate::errors::{Error, PgServerError, Result};
use crate::protocol::Notification;

/// Default minimum size of one read from the socket.
pub const DEFAULT_MIN_READ_BUFFER_SIZE: usize = 8192;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Synchronous callback invoked for every `NoticeResponse`.
pub type NoticeHook = Arc<dyn Fn(&PgServerError) + Send + Sync>;

/// Synchronous callback invoked for every `NotificationResponse`.
pub type NotificationHook = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Async hook run against a freshly established connection. Failure aborts
/// the connection attempt.
pub type ConnectHook = Arc<
    dyn for<'a> Fn(&'a mut PgConnection) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
        + Send
        + Sync,
>;

/// `sslmode` connection keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(Error::config(format!("invalid sslmode {other:?}"))),
        }
    }

    /// Whether a plaintext 'N' reply to SSLRequest is acceptable.
    pub fn allows_plaintext(self) -> bool {
        matches!(self, SslMode::Disable | SslMode::Allow | SslMode::Prefer)
    }
}

/// Minimum TLS protocol version (`ssl_min_protocol_version`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "TLSv1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.3" => Ok(TlsVersion::Tls13),
            other => Err(Error::config(format!(
                "invalid ssl_min_protocol_version {other:?}"
            ))),
        }
    }
}

/// `target_session_attrs` connection keyword, validated after
/// authentication against the server's `hot_standby` and
/// `transaction_read_only` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetSessionAttrs {
    #[default]
    Any,
    ReadWrite,
    ReadOnly,
    Primary,
    Standby,
}

impl TargetSessionAttrs {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "any" => Ok(TargetSessionAttrs::Any),
            "read-write" => Ok(TargetSessionAttrs::ReadWrite),
            "read-only" => Ok(TargetSessionAttrs::ReadOnly),
            "primary" => Ok(TargetSessionAttrs::Primary),
            "standby" => Ok(TargetSessionAttrs::Standby),
            "prefer-standby" => Err(Error::config(
                "target_session_attrs=prefer-standby is not supported",
            )),
            other => Err(Error::config(format!(
                "invalid target_session_attrs {other:?}"
            ))),
        }
    }
}

/// TLS settings for one host.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ssl_mode: SslMode,
    /// `sslrootcert`: CA bundle used instead of the system store
    pub root_cert: Option<PathBuf>,
    /// `sslcert` / `sslkey`: client certificate authentication
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Server name for certificate checks, when it differs from the host
    pub server_name: Option<String>,
    /// `sslsni`: send the server name in the handshake (default on)
    pub sni: bool,
    pub min_protocol_version: Option<TlsVersion>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ssl_mode: SslMode::default(),
            root_cert: None,
            client_cert: None,
            client_key: None,
            server_name: None,
            sni: true,
            min_protocol_version: None,
        }
    }
}

/// One host to try. A host starting with `/` names the directory of a Unix
/// socket (`<dir>/.s.PGSQL.<port>`); anything else is a TCP host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl HostConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            tls: None,
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn is_unix(&self) -> bool {
        self.host.starts_with('/')
    }

    /// Full path of the Unix socket for this host.
    pub fn unix_socket_path(&self) -> PathBuf {
        PathBuf::from(&self.host).join(format!(".s.PGSQL.{}", self.port))
    }
}

/// Connection configuration. At least one host and a user are required.
#[derive(Clone, Default)]
pub struct Config {
    pub hosts: Vec<HostConfig>,
    pub user: String,
    pub database: Option<String>,
    /// Zero disables the timeout.
    pub connect_timeout: Duration,
    /// Extra startup parameters, sent in order.
    pub runtime_params: Vec<(String, String)>,
    pub target_session_attrs: TargetSessionAttrs,
    pub min_read_buffer_size: usize,
    pub on_notice: Option<NoticeHook>,
    pub on_notification: Option<NotificationHook>,
    pub after_connect: Option<ConnectHook>,
    pub validate_connect: Option<ConnectHook>,
}

impl Config {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            min_read_buffer_size: DEFAULT_MIN_READ_BUFFER_SIZE,
            ..Default::default()
        }
    }

    /// Parse a keyword/value connection string (`host=... user=...`) or a
    /// `postgres://` / `postgresql://` URI, layering `PG*` environment
    /// variables, the service file, and the password file underneath.
    pub fn from_conninfo(conninfo: &str) -> Result<Self> {
        conninfo::parse(conninfo)
    }

    /// Configuration from environment variables alone.
    pub fn from_env() -> Result<Self> {
        conninfo::parse("")
    }

    pub fn host(mut self, host: HostConfig) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn runtime_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.runtime_params.push((name.into(), value.into()));
        self
    }

    pub fn target_session_attrs(mut self, attrs: TargetSessionAttrs) -> Self {
        self.target_session_attrs = attrs;
        self
    }

    pub fn min_read_buffer_size(mut self, size: usize) -> Self {
        self.min_read_buffer_size = size;
        self
    }

    pub fn on_notice(mut self, hook: NoticeHook) -> Self {
        self.on_notice = Some(hook);
        self
    }

    pub fn on_notification(mut self, hook: NotificationHook) -> Self {
        self.on_notification = Some(hook);
        self
    }

    pub fn after_connect(mut self, hook: ConnectHook) -> Self {
        self.after_connect = Some(hook);
        self
    }

    pub fn validate_connect(mut self, hook: ConnectHook) -> Self {
        self.validate_connect = Some(hook);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::config("at least one host is required"));
        }
        if self.user.is_empty() {
            return Err(Error::config("user is required"));
        }
        for host in &self.hosts {
            if host.port == 0 {
                return Err(Error::config(format!(
                    "invalid port 0 for host {:?}",
                    host.host
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("hosts", &self.hosts)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .field("runtime_params", &self.runtime_params)
            .field("target_session_attrs", &self.target_session_attrs)
            .field("min_read_buffer_size", &self.min_read_buffer_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_host_and_user() {
        let config = Config::new("alice");
        assert!(config.validate().is_err());

        let config = Config::new("").host(HostConfig::new("localhost", 5432));
        assert!(config.validate().is_err());

        let config = Config::new("alice").host(HostConfig::new("localhost", 5432));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unix_socket_detection() {
        let host = HostConfig::new("/var/run/postgresql", 5432);
        assert!(host.is_unix());
        assert_eq!(
            host.unix_socket_path(),
            PathBuf::from("/var/run/postgresql/.s.PGSQL.5432")
        );
        assert!(!HostConfig::new("db.example.com", 5432).is_unix());
    }

    #[test]
    fn sslmode_plaintext_rules() {
        for mode in [SslMode::Disable, SslMode::Allow, SslMode::Prefer] {
            assert!(mode.allows_plaintext());
        }
        for mode in [SslMode::Require, SslMode::VerifyCa, SslMode::VerifyFull] {
            assert!(!mode.allows_plaintext());
        }
    }

    #[test]
    fn prefer_standby_is_rejected() {
        match TargetSessionAttrs::parse("prefer-standby") {
            Err(Error::ConfigParse(msg)) => assert!(msg.contains("not supported")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
