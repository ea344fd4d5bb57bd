//! Connection establishment: socket, optional TLS, startup message,
//! authentication, and ingestion of the initial server parameters.

use std::sync::Arc;

use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tracing::{debug, warn};

use super::connection::{PgConnection, RemoteAddr};
use super::stream::PgStream;
use crate::config::{Config, HostConfig, SslMode, TargetSessionAttrs, TlsConfig, TlsVersion};
use crate::errors::{Error, Result};
use crate::protocol::{BackendMessage, FrontendEncoder, ScramClient};

/// Safety bound on authentication round-trips; SCRAM needs four.
const AUTH_MESSAGE_LIMIT: usize = 5;

/// Safety bound on startup parameter ingestion.
const STARTUP_MESSAGE_LIMIT: usize = 1000;

/// Establish a connection, trying `config.hosts` in order and returning
/// the first success. Authentication rejections abort the fallback; any
/// other failure moves on to the next host.
pub async fn connect(config: &Config) -> Result<PgConnection> {
    config.validate()?;

    let mut last_error = None;
    for host in &config.hosts {
        debug!(host = %host.host, port = host.port, "connecting");
        match connect_host(config, host).await {
            Ok(conn) => return Ok(conn),
            Err(e) if e.aborts_fallback() => return Err(e),
            Err(e) => {
                warn!(host = %host.host, port = host.port, "connection attempt failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.expect("config.validate() guarantees at least one host"))
}

async fn connect_host(config: &Config, host: &HostConfig) -> Result<PgConnection> {
    let open = open_stream(host);
    let (stream, remote) = if config.connect_timeout.is_zero() {
        open.await?
    } else {
        tokio::time::timeout(config.connect_timeout, open)
            .await
            .map_err(|_| {
                Error::connect(format!(
                    "timed out connecting to {}:{}",
                    host.host, host.port
                ))
            })??
    };

    let mut conn = PgConnection::new(
        stream,
        remote,
        config.min_read_buffer_size,
        config.on_notice.clone(),
        config.on_notification.clone(),
    );

    let startup = FrontendEncoder::startup(
        &config.user,
        config.database.as_deref(),
        &config.runtime_params,
    );
    let result = async {
        conn.send(&startup).await?;
        authenticate(&mut conn, config, host).await?;
        ingest_startup_parameters(&mut conn).await
    }
    .await;
    if let Err(e) = result {
        conn.close().await;
        return Err(startup_error(e));
    }

    if let Some(hook) = &config.after_connect
        && let Err(e) = hook(&mut conn).await
    {
        conn.close().await;
        return Err(Error::connect(format!("after_connect hook failed: {e}")));
    }

    if let Err(e) = validate_target_session_attrs(&mut conn, config.target_session_attrs).await {
        conn.close().await;
        return Err(startup_error(e));
    }

    if let Some(hook) = &config.validate_connect
        && let Err(e) = hook(&mut conn).await
    {
        conn.close().await;
        return Err(Error::connect(format!("validate_connect hook failed: {e}")));
    }

    debug!(pid = conn.backend_pid(), "connection established");
    Ok(conn)
}

/// Startup failures are connection errors; keep the SQLSTATE so host
/// fallback can recognize authentication rejections.
fn startup_error(e: Error) -> Error {
    match e {
        Error::Pg(pg) => Error::Connect {
            message: pg.to_string(),
            sql_state: Some(pg.sql_state.clone()),
        },
        Error::Closed(message) | Error::Protocol(message) => Error::Connect {
            message,
            sql_state: None,
        },
        other => other,
    }
}

async fn open_stream(host: &HostConfig) -> Result<(PgStream, RemoteAddr)> {
    if host.is_unix() {
        #[cfg(unix)]
        {
            let path = host.unix_socket_path();
            let stream = UnixStream::connect(&path)
                .await
                .map_err(|e| Error::connect(format!("cannot open {}: {e}", path.display())))?;
            return Ok((PgStream::Unix(stream), RemoteAddr::Unix(path)));
        }
        #[cfg(not(unix))]
        return Err(Error::connect(
            "unix sockets are not supported on this platform",
        ));
    }

    let mut tcp = TcpStream::connect((host.host.as_str(), host.port))
        .await
        .map_err(|e| Error::connect(format!("cannot reach {}:{}: {e}", host.host, host.port)))?;
    tcp.set_nodelay(true)
        .map_err(|e| Error::connect(format!("set_nodelay failed: {e}")))?;
    let remote = RemoteAddr::Tcp(host.host.clone(), host.port);

    let Some(tls) = &host.tls else {
        return Ok((PgStream::Tcp(tcp), remote));
    };

    // SSLRequest dance: the server answers with a single raw byte before
    // any TLS bytes flow.
    tcp.write_all(&FrontendEncoder::ssl_request())
        .await
        .map_err(|e| Error::connect(format!("SSL request failed: {e}")))?;
    let mut reply = [0u8; 1];
    tcp.read_exact(&mut reply)
        .await
        .map_err(|e| Error::connect(format!("no reply to SSL request: {e}")))?;

    match reply[0] {
        b'S' => {
            let connector = tls_connector(tls)?;
            let server_name = tls_server_name(tls, &host.host)?;
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::connect(format!("TLS handshake failed: {e}")))?;
            Ok((PgStream::Tls(Box::new(stream)), remote))
        }
        b'N' if tls.ssl_mode.allows_plaintext() => Ok((PgStream::Tcp(tcp), remote)),
        b'N' => Err(Error::connect(format!(
            "server refused TLS and sslmode is {:?}",
            tls.ssl_mode
        ))),
        other => Err(Error::connect(format!(
            "unexpected reply 0x{other:02x} to SSL request"
        ))),
    }
}

fn tls_server_name(tls: &TlsConfig, host: &str) -> Result<ServerName<'static>> {
    let name = tls.server_name.as_deref().unwrap_or(host);
    if !tls.sni
        && let Ok(ip) = name.parse::<std::net::IpAddr>()
    {
        // IP-address names never go out as SNI.
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(name.to_string())
        .map_err(|_| Error::connect(format!("invalid TLS server name {name:?}")))
}

fn tls_connector(tls: &TlsConfig) -> Result<TlsConnector> {
    let versions: &[&rustls::SupportedProtocolVersion] = match tls.min_protocol_version {
        Some(TlsVersion::Tls13) => &[&rustls::version::TLS13],
        _ => rustls::DEFAULT_VERSIONS,
    };
    let builder = ClientConfig::builder_with_protocol_versions(versions);

    let builder = match tls.ssl_mode {
        SslMode::VerifyFull => builder.with_root_certificates(root_store(tls)?),
        SslMode::VerifyCa => {
            let roots = root_store(tls)?;
            let webpki = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::connect(format!("cannot build TLS verifier: {e}")))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier(webpki)))
        }
        // allow/prefer/require take any certificate, matching libpq.
        _ => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate::default())),
    };

    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::connect(format!("invalid client certificate: {e}")))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::config(
                "sslcert and sslkey must be provided together",
            ));
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn root_store(tls: &TlsConfig) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    match &tls.root_cert {
        Some(path) => {
            for cert in load_certs(path)? {
                store
                    .add(cert)
                    .map_err(|e| Error::connect(format!("invalid root certificate: {e}")))?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs().certs {
                let _ = store.add(cert);
            }
        }
    }
    if store.is_empty() {
        return Err(Error::connect("no trusted root certificates available"));
    }
    Ok(store)
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::connect(format!("cannot read {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::connect(format!("invalid PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::connect(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &std::path::Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::connect(format!("cannot read {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| Error::connect(format!("invalid PEM in {}: {e}", path.display())))?
        .ok_or_else(|| Error::connect(format!("no private key found in {}", path.display())))
}

/// Verifier for `sslmode=allow|prefer|require`: encryption without
/// authentication, exactly libpq's contract for those modes.
#[derive(Debug)]
struct AcceptAnyCertificate(rustls::crypto::CryptoProvider);

impl Default for AcceptAnyCertificate {
    fn default() -> Self {
        Self(rustls::crypto::aws_lc_rs::default_provider())
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifier for `sslmode=verify-ca`: full chain validation, hostname
/// deliberately not checked.
#[derive(Debug)]
struct ChainOnlyVerifier(Arc<rustls::client::WebPkiServerVerifier>);

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        use rustls::CertificateError;
        match self.0.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

async fn authenticate(conn: &mut PgConnection, config: &Config, host: &HostConfig) -> Result<()> {
    let mut scram: Option<ScramClient> = None;

    for _ in 0..AUTH_MESSAGE_LIMIT {
        match conn.receive_message(None).await? {
            BackendMessage::AuthenticationOk => return Ok(()),
            BackendMessage::AuthenticationCleartextPassword => {
                let password = required_password(host)?;
                conn.send(&FrontendEncoder::password(password)).await?;
            }
            BackendMessage::AuthenticationMD5Password(salt) => {
                let password = required_password(host)?;
                let hashed = md5_password(&config.user, password, &salt);
                conn.send(&FrontendEncoder::password(&hashed)).await?;
            }
            BackendMessage::AuthenticationSASL(mechanisms) => {
                if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                    return Err(Error::connect(format!(
                        "no supported SASL mechanism offered (got {mechanisms:?})"
                    )));
                }
                let password = required_password(host)?;
                let client = ScramClient::new(password);
                conn.send(&FrontendEncoder::sasl_initial_response(
                    "SCRAM-SHA-256",
                    &client.client_first_message(),
                ))
                .await?;
                scram = Some(client);
            }
            BackendMessage::AuthenticationSASLContinue(data) => {
                let client = scram
                    .as_mut()
                    .ok_or_else(|| Error::connect("SASL continue before SASL start"))?;
                let response = client.process_server_first(&data)?;
                conn.send(&FrontendEncoder::sasl_response(&response)).await?;
            }
            BackendMessage::AuthenticationSASLFinal(data) => {
                let client = scram
                    .as_ref()
                    .ok_or_else(|| Error::connect("SASL final before SASL start"))?;
                client.verify_server_final(&data)?;
                // AuthenticationOk follows immediately.
            }
            other => {
                return Err(Error::connect(format!(
                    "unexpected message during authentication: {other:?}"
                )));
            }
        }
    }
    Err(Error::connect(
        "authentication did not complete within the message limit",
    ))
}

fn required_password(host: &HostConfig) -> Result<&str> {
    host.password
        .as_deref()
        .ok_or_else(|| Error::connect("server requested a password but none was configured"))
}

/// `"md5" || md5hex(md5hex(password || user) || salt)`
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let first = format!("{:x}", md5.finalize_reset());

    md5.update(first.as_bytes());
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

/// Accept BackendKeyData and ParameterStatus until ReadyForQuery; the
/// connection core already records both as side effects.
async fn ingest_startup_parameters(conn: &mut PgConnection) -> Result<()> {
    for _ in 0..STARTUP_MESSAGE_LIMIT {
        match conn.receive_message(None).await? {
            BackendMessage::BackendKeyData { .. }
            | BackendMessage::ParameterStatus { .. }
            | BackendMessage::NoticeResponse(_) => {}
            BackendMessage::ReadyForQuery(_) => return Ok(()),
            other => {
                return Err(Error::connect(format!(
                    "unexpected message during startup: {other:?}"
                )));
            }
        }
    }
    Err(Error::connect(
        "server kept sending startup parameters past the message limit",
    ))
}

/// Post-authentication session validation for `target_session_attrs`.
async fn validate_target_session_attrs(
    conn: &mut PgConnection,
    attrs: TargetSessionAttrs,
) -> Result<()> {
    if attrs == TargetSessionAttrs::Any {
        return Ok(());
    }

    let hot_standby = show_setting(conn, "hot_standby").await?;
    let satisfied = match attrs {
        TargetSessionAttrs::Any => true,
        TargetSessionAttrs::Primary => hot_standby == "off",
        TargetSessionAttrs::Standby => hot_standby == "on",
        TargetSessionAttrs::ReadWrite => {
            hot_standby == "off" && show_setting(conn, "transaction_read_only").await? == "off"
        }
        TargetSessionAttrs::ReadOnly => {
            hot_standby == "on" || show_setting(conn, "transaction_read_only").await? == "on"
        }
    };
    if satisfied {
        Ok(())
    } else {
        Err(Error::connect(format!(
            "server does not satisfy target_session_attrs={attrs:?}"
        )))
    }
}

async fn show_setting(conn: &mut PgConnection, name: &str) -> Result<String> {
    let results = conn.exec(&format!("show {name}"), None).await?.read_all().await?;
    let value = results
        .first()
        .and_then(|r| r.rows.first())
        .and_then(|row| row.first())
        .and_then(|v| v.as_deref())
        .ok_or_else(|| Error::connect(format!("show {name} returned no value")))?;
    Ok(String::from_utf8_lossy(value).into_owned())
}
