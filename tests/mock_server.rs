//! Protocol-level tests against a scripted in-process backend.
//!
//! Each test spawns a TCP listener that plays the server side of the
//! exchange byte-for-byte, which lets the state machine be exercised
//! without a running PostgreSQL: recovery after errors, cancellation on a
//! secondary socket, COPY streams, reader teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pglink::{
    CancellationToken, Config, ConnectionStatus, Error, HostConfig, Notification, PgConnection,
    connect,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

// ==================== backend frame builders ====================

fn msg(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(tag);
    out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn auth_ok() -> Vec<u8> {
    msg(b'R', &0i32.to_be_bytes())
}

fn auth_cleartext() -> Vec<u8> {
    msg(b'R', &3i32.to_be_bytes())
}

fn auth_md5(salt: [u8; 4]) -> Vec<u8> {
    let mut payload = 5i32.to_be_bytes().to_vec();
    payload.extend_from_slice(&salt);
    msg(b'R', &payload)
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    msg(b'S', &payload)
}

fn backend_key_data(pid: i32, secret: i32) -> Vec<u8> {
    let mut payload = pid.to_be_bytes().to_vec();
    payload.extend_from_slice(&secret.to_be_bytes());
    msg(b'K', &payload)
}

fn ready_for_query(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

fn row_description(columns: &[&str]) -> Vec<u8> {
    let mut payload = (columns.len() as i16).to_be_bytes().to_vec();
    for name in columns {
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&0u32.to_be_bytes()); // table oid
        payload.extend_from_slice(&0i16.to_be_bytes()); // attnum
        payload.extend_from_slice(&25u32.to_be_bytes()); // text
        payload.extend_from_slice(&(-1i16).to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        payload.extend_from_slice(&0i16.to_be_bytes());
    }
    msg(b'T', &payload)
}

fn data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
    let mut payload = (values.len() as i16).to_be_bytes().to_vec();
    for value in values {
        match value {
            None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(bytes) => {
                payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                payload.extend_from_slice(bytes);
            }
        }
    }
    msg(b'D', &payload)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut payload = tag.as_bytes().to_vec();
    payload.push(0);
    msg(b'C', &payload)
}

fn error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for (kind, value) in [
        (b'S', severity),
        (b'V', severity),
        (b'C', code),
        (b'M', message),
    ] {
        payload.push(kind);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload.push(0);
    msg(b'E', &payload)
}

fn notification(pid: i32, channel: &str, notify_payload: &str) -> Vec<u8> {
    let mut payload = pid.to_be_bytes().to_vec();
    payload.extend_from_slice(channel.as_bytes());
    payload.push(0);
    payload.extend_from_slice(notify_payload.as_bytes());
    payload.push(0);
    msg(b'A', &payload)
}

fn copy_in_response() -> Vec<u8> {
    msg(b'G', &[0, 0, 0])
}

fn copy_out_response() -> Vec<u8> {
    msg(b'H', &[0, 0, 0])
}

fn copy_data(bytes: &[u8]) -> Vec<u8> {
    msg(b'd', bytes)
}

fn copy_done() -> Vec<u8> {
    msg(b'c', &[])
}

// ==================== scripted server ====================

struct ServerConn {
    stream: TcpStream,
}

impl ServerConn {
    /// Consume the startup message and check the protocol version.
    async fn accept_startup(&mut self) {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await.unwrap();
        let len = i32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        let version = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(version, 196608, "unexpected protocol version");
    }

    /// Read one regular frontend frame.
    async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut head = [0u8; 5];
        self.stream.read_exact(&mut head).await.unwrap();
        let len = i32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        (head[0], payload)
    }

    /// Read frames until a Query ('Q') arrives; returns its SQL.
    async fn expect_query(&mut self) -> String {
        let (tag, payload) = self.read_frame().await;
        assert_eq!(tag, b'Q', "expected Query, got '{}'", tag as char);
        String::from_utf8(payload[..payload.len() - 1].to_vec()).unwrap()
    }

    async fn write(&mut self, frames: &[Vec<u8>]) {
        let mut bytes = Vec::new();
        for frame in frames {
            bytes.extend_from_slice(frame);
        }
        self.stream.write_all(&bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Startup + trust auth + the usual session preamble.
    async fn trust_handshake(&mut self) {
        self.accept_startup().await;
        self.write(&[
            auth_ok(),
            parameter_status("server_version", "16.2"),
            parameter_status("client_encoding", "UTF8"),
            backend_key_data(42, 1234),
            ready_for_query(b'I'),
        ])
        .await;
    }
}

struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn config(&self, user: &str) -> Config {
        let port = self.listener.local_addr().unwrap().port();
        Config::new(user).host(HostConfig::new("127.0.0.1", port))
    }

    async fn accept(&self) -> ServerConn {
        let (stream, _) = self.listener.accept().await.unwrap();
        ServerConn { stream }
    }

    /// Run a script against the next accepted connection.
    fn script<F, Fut>(self, script: F) -> (Config, JoinHandle<()>)
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let config = self.config("test");
        let handle = tokio::spawn(async move { script(self).await });
        (config, handle)
    }
}

async fn connected(server: MockServer) -> (PgConnection, JoinHandle<ServerConn>) {
    let config = server.config("test");
    let handle = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.trust_handshake().await;
        conn
    });
    let conn = connect(&config).await.unwrap();
    (conn, handle)
}

// ==================== establishment ====================

#[tokio::test]
async fn connects_with_trust_auth() {
    let server = MockServer::bind().await;
    let (conn, handle) = connected(server).await;

    assert_eq!(conn.status(), ConnectionStatus::Idle);
    assert_eq!(conn.backend_pid(), 42);
    assert_eq!(conn.parameter_status("server_version"), Some("16.2"));
    handle.await.unwrap();
}

#[tokio::test]
async fn connects_with_cleartext_password() {
    let server = MockServer::bind().await;
    let mut config = server.config("alice");
    config.hosts[0].password = Some("secret".into());

    let handle = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.accept_startup().await;
        conn.write(&[auth_cleartext()]).await;
        let (tag, payload) = conn.read_frame().await;
        assert_eq!(tag, b'p');
        assert_eq!(payload, b"secret\0");
        conn.write(&[
            auth_ok(),
            backend_key_data(7, 7),
            ready_for_query(b'I'),
        ])
        .await;
    });

    let conn = connect(&config).await.unwrap();
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    handle.await.unwrap();
}

#[tokio::test]
async fn connects_with_md5_password() {
    let server = MockServer::bind().await;
    let mut config = server.config("alice");
    config.hosts[0].password = Some("secret".into());

    let handle = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.accept_startup().await;
        conn.write(&[auth_md5([1, 2, 3, 4])]).await;
        let (tag, payload) = conn.read_frame().await;
        assert_eq!(tag, b'p');
        // "md5" + 32 hex digits + NUL
        assert_eq!(payload.len(), 36);
        assert!(payload.starts_with(b"md5"));
        conn.write(&[
            auth_ok(),
            backend_key_data(7, 7),
            ready_for_query(b'I'),
        ])
        .await;
    });

    connect(&config).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn auth_rejection_aborts_host_fallback() {
    let server = MockServer::bind().await;
    let (mut config, handle) = server.script(|server| async move {
        let mut conn = server.accept().await;
        conn.accept_startup().await;
        conn.write(&[error_response(
            "FATAL",
            "28P01",
            "password authentication failed for user \"test\"",
        )])
        .await;
    });
    // A second host that must never be tried.
    config.hosts.push(HostConfig::new("127.0.0.1", 1));

    match connect(&config).await {
        Err(Error::Connect { sql_state, .. }) => {
            assert_eq!(sql_state.as_deref(), Some("28P01"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    handle.await.unwrap();
}

#[tokio::test]
async fn host_fallback_tries_next_host() {
    // First host: a port with nothing listening.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let server = MockServer::bind().await;
    let live_port = server.listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.trust_handshake().await;
    });

    let config = Config::new("test")
        .host(HostConfig::new("127.0.0.1", dead_port))
        .host(HostConfig::new("127.0.0.1", live_port));
    let conn = connect(&config).await.unwrap();
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    handle.await.unwrap();
}

// ==================== simple protocol ====================

#[tokio::test]
async fn exec_streams_one_result() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        assert_eq!(server.expect_query().await, "select 'Hello, world'");
        server
            .write(&[
                row_description(&["?column?"]),
                data_row(&[Some(b"Hello, world")]),
                command_complete("SELECT 1"),
                ready_for_query(b'I'),
            ])
            .await;
    });

    let mut reader = conn.exec("select 'Hello, world'", None).await.unwrap();
    let results = reader.read_all().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].command_tag.as_str(), "SELECT 1");
    assert_eq!(results[0].rows.len(), 1);
    assert_eq!(results[0].rows[0][0].as_deref(), Some(&b"Hello, world"[..]));
    drop(reader);

    assert_eq!(conn.status(), ConnectionStatus::Idle);
    script.await.unwrap();
}

#[tokio::test]
async fn exec_error_keeps_partial_results_and_recovers() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        server.expect_query().await;
        server
            .write(&[
                row_description(&["?column?"]),
                data_row(&[Some(b"1")]),
                command_complete("SELECT 1"),
                error_response("ERROR", "22012", "division by zero"),
                ready_for_query(b'I'),
            ])
            .await;

        // The connection must still work afterwards.
        assert_eq!(server.expect_query().await, "select 2");
        server
            .write(&[
                row_description(&["?column?"]),
                data_row(&[Some(b"2")]),
                command_complete("SELECT 1"),
                ready_for_query(b'I'),
            ])
            .await;
    });

    let mut reader = conn.exec("select 1; select 1/0; select 1", None).await.unwrap();
    match reader.read_all().await {
        Err(Error::Pg(e)) => assert_eq!(e.sql_state, "22012"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(reader.partial_results().len(), 1);
    assert_eq!(
        reader.partial_results()[0].rows[0][0].as_deref(),
        Some(&b"1"[..])
    );
    drop(reader);
    assert_eq!(conn.status(), ConnectionStatus::Idle);

    // Liveness after a recoverable error.
    let mut reader = conn.exec("select 2", None).await.unwrap();
    let results = reader.read_all().await.unwrap();
    assert_eq!(results[0].rows[0][0].as_deref(), Some(&b"2"[..]));
    drop(reader);

    script.await.unwrap();
}

#[tokio::test]
async fn dropped_reader_resynchronizes_on_next_operation() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        server.expect_query().await;
        server
            .write(&[
                row_description(&["n"]),
                data_row(&[Some(b"1")]),
                data_row(&[Some(b"2")]),
                command_complete("SELECT 2"),
                ready_for_query(b'I'),
            ])
            .await;

        assert_eq!(server.expect_query().await, "select 'after'");
        server
            .write(&[
                row_description(&["v"]),
                data_row(&[Some(b"after")]),
                command_complete("SELECT 1"),
                ready_for_query(b'I'),
            ])
            .await;
    });

    let mut reader = conn.exec("select n", None).await.unwrap();
    assert!(reader.next_result().await.unwrap());
    {
        let mut rows = reader.result_reader();
        assert!(rows.next_row().await.unwrap());
        assert_eq!(rows.row_values().unwrap()[0].as_deref(), Some(&b"1"[..]));
    }
    // Dropped with a row and the tail of the protocol still unread.
    drop(reader);

    let mut reader = conn.exec("select 'after'", None).await.unwrap();
    let results = reader.read_all().await.unwrap();
    assert_eq!(results[0].rows[0][0].as_deref(), Some(&b"after"[..]));
    drop(reader);

    script.await.unwrap();
}

#[tokio::test]
async fn result_reader_streams_rows_individually() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        server.expect_query().await;
        server
            .write(&[
                row_description(&["n"]),
                data_row(&[Some(b"1")]),
                data_row(&[None]),
                command_complete("SELECT 2"),
                command_complete("CREATE TABLE"),
                ready_for_query(b'I'),
            ])
            .await;
    });

    let mut reader = conn.exec("select n; create table t ()", None).await.unwrap();

    assert!(reader.next_result().await.unwrap());
    let mut rows = reader.result_reader();
    assert_eq!(rows.field_descriptions()[0].name, "n");
    assert!(rows.next_row().await.unwrap());
    assert_eq!(rows.row_values().unwrap()[0].as_deref(), Some(&b"1"[..]));
    assert!(rows.next_row().await.unwrap());
    assert_eq!(rows.row_values().unwrap()[0], None);
    assert!(!rows.next_row().await.unwrap());
    assert_eq!(rows.command_tag().unwrap().as_str(), "SELECT 2");

    // Second statement produced no rows, only a tag.
    assert!(reader.next_result().await.unwrap());
    let mut rows = reader.result_reader();
    assert!(!rows.next_row().await.unwrap());
    assert_eq!(rows.command_tag().unwrap().as_str(), "CREATE TABLE");
    assert_eq!(rows.command_tag().unwrap().rows_affected(), 0);

    assert!(!reader.next_result().await.unwrap());
    assert!(reader.is_finished());
    drop(reader);
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    script.await.unwrap();
}

// ==================== extended protocol ====================

#[tokio::test]
async fn exec_params_round_trip() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        // Parse, Bind, Describe, Execute, Sync arrive as one group.
        let mut tags = Vec::new();
        for _ in 0..5 {
            let (tag, _) = server.read_frame().await;
            tags.push(tag);
        }
        assert_eq!(tags, vec![b'P', b'B', b'D', b'E', b'S']);
        server
            .write(&[
                msg(b'1', &[]), // ParseComplete
                msg(b'2', &[]), // BindComplete
                row_description(&["msg"]),
                data_row(&[Some(b"Hello, world")]),
                command_complete("SELECT 1"),
                ready_for_query(b'I'),
            ])
            .await;
    });

    let mut reader = conn
        .exec_params(
            "select $1::text as msg",
            &[Some(b"Hello, world".to_vec())],
            &[],
            &[],
            &[],
            None,
        )
        .await
        .unwrap();
    assert_eq!(reader.field_descriptions()[0].name, "msg");
    assert!(reader.next_row().await.unwrap());
    assert_eq!(
        reader.row_values().unwrap()[0].as_deref(),
        Some(&b"Hello, world"[..])
    );
    assert!(!reader.next_row().await.unwrap());
    assert_eq!(reader.command_tag().unwrap().as_str(), "SELECT 1");
    drop(reader);

    assert_eq!(conn.status(), ConnectionStatus::Idle);
    script.await.unwrap();
}

#[tokio::test]
async fn exec_params_validates_parameter_count_client_side() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    handle.await.unwrap();

    let params = vec![None; 65536];
    match conn.exec_params("select 1", &params, &[], &[], &[], None).await {
        Err(Error::InvalidArgument(message)) => {
            assert_eq!(message, "Extended protocol limited to 65535 parameters");
        }
        other => panic!("unexpected result, ok={}", other.is_ok()),
    }
    // Nothing touched the wire; the connection is still usable.
    assert_eq!(conn.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn prepare_describes_statement() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        let (tag, payload) = server.read_frame().await;
        assert_eq!(tag, b'P');
        assert!(payload.starts_with(b"ps1\0select $1::int\0"));
        let (tag, _) = server.read_frame().await; // Describe
        assert_eq!(tag, b'D');
        let (tag, _) = server.read_frame().await; // Sync
        assert_eq!(tag, b'S');

        let mut param_desc = 1i16.to_be_bytes().to_vec();
        param_desc.extend_from_slice(&23u32.to_be_bytes());
        server
            .write(&[
                msg(b'1', &[]),
                msg(b't', &param_desc),
                row_description(&["int4"]),
                ready_for_query(b'I'),
            ])
            .await;
    });

    let statement = conn.prepare("ps1", "select $1::int", &[], None).await.unwrap();
    assert_eq!(statement.name, "ps1");
    assert_eq!(statement.param_oids, vec![23]);
    assert_eq!(statement.fields[0].name, "int4");
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    script.await.unwrap();
}

#[tokio::test]
async fn prepare_error_leaves_connection_usable() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        for _ in 0..3 {
            server.read_frame().await;
        }
        server
            .write(&[
                error_response("ERROR", "42601", "syntax error at or near \"SYNTAX\""),
                ready_for_query(b'I'),
            ])
            .await;

        assert_eq!(server.expect_query().await, "select 1");
        server
            .write(&[
                row_description(&["?column?"]),
                data_row(&[Some(b"1")]),
                command_complete("SELECT 1"),
                ready_for_query(b'I'),
            ])
            .await;
    });

    match conn.prepare("ps1", "SYNTAX ERROR", &[], None).await {
        Err(Error::Pg(e)) => assert_eq!(e.sql_state, "42601"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(conn.status(), ConnectionStatus::Idle);

    let mut reader = conn.exec("select 1", None).await.unwrap();
    reader.read_all().await.unwrap();
    drop(reader);
    script.await.unwrap();
}

// ==================== COPY ====================

#[tokio::test]
async fn copy_from_streams_source_and_reports_tag() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        server.expect_query().await;
        server.write(&[copy_in_response()]).await;

        let mut received = Vec::new();
        loop {
            let (tag, payload) = server.read_frame().await;
            match tag {
                b'd' => received.extend_from_slice(&payload),
                b'c' => break,
                other => panic!("unexpected frame '{}'", other as char),
            }
        }
        assert_eq!(received, b"1,a\n2,b\n");
        server
            .write(&[command_complete("COPY 2"), ready_for_query(b'I')])
            .await;
    });

    let mut source: &[u8] = b"1,a\n2,b\n";
    let tag = conn
        .copy_from("COPY foo FROM STDIN WITH (FORMAT csv)", &mut source, None)
        .await
        .unwrap();
    assert_eq!(tag.rows_affected(), 2);
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    script.await.unwrap();
}

#[tokio::test]
async fn copy_from_error_drains_to_ready() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        server.expect_query().await;
        server.write(&[copy_in_response()]).await;
        // Swallow copy frames until the client finishes, then fail.
        loop {
            let (tag, _) = server.read_frame().await;
            if tag == b'c' || tag == b'f' {
                break;
            }
        }
        server
            .write(&[
                error_response("ERROR", "22P04", "bad copy data"),
                ready_for_query(b'I'),
            ])
            .await;
    });

    let mut source: &[u8] = b"broken\n";
    match conn.copy_from("COPY foo FROM STDIN", &mut source, None).await {
        Err(Error::Pg(e)) => assert_eq!(e.sql_state, "22P04"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    script.await.unwrap();
}

#[tokio::test]
async fn copy_to_writes_into_sink() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        server.expect_query().await;
        server
            .write(&[
                copy_out_response(),
                copy_data(b"1,a\n"),
                copy_data(b"2,b\n"),
                copy_done(),
                command_complete("COPY 2"),
                ready_for_query(b'I'),
            ])
            .await;
    });

    let mut sink = Vec::new();
    let tag = conn
        .copy_to("COPY foo TO STDOUT WITH (FORMAT csv)", &mut sink, None)
        .await
        .unwrap();
    assert_eq!(tag.rows_affected(), 2);
    assert_eq!(sink, b"1,a\n2,b\n");
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    script.await.unwrap();
}

// ==================== notifications & cancellation ====================

#[tokio::test]
async fn wait_for_notification_returns_and_dispatches() {
    let server = MockServer::bind().await;
    let mut config = server.config("test");
    let seen: Arc<Mutex<Vec<Notification>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    config = config.on_notification(Arc::new(move |n: &Notification| {
        sink.lock().unwrap().push(n.clone());
    }));

    let handle = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.trust_handshake().await;
        conn.write(&[notification(99, "foo", "bar")]).await;
    });

    let mut conn = connect(&config).await.unwrap();
    let n = conn.wait_for_notification(None).await.unwrap();
    assert_eq!(n.pid, 99);
    assert_eq!(n.channel, "foo");
    assert_eq!(n.payload, "bar");
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    handle.await.unwrap();
}

#[tokio::test]
async fn pre_cancelled_token_never_touches_the_wire() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    handle.await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    match conn.exec("select 1", Some(&token)).await {
        Err(Error::Cancelled) => {}
        other => panic!("unexpected result, ok={}", other.is_ok()),
    }
    assert_eq!(conn.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn cancellation_fires_cancel_request_and_drains() {
    let server = MockServer::bind().await;
    let config = server.config("test");

    let handle = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.trust_handshake().await;

        // Start answering, then stall until the cancel request arrives on
        // a second socket.
        conn.expect_query().await;
        conn.write(&[row_description(&["pg_sleep"])]).await;

        let mut cancel_conn = server.accept().await;
        let mut frame = [0u8; 16];
        cancel_conn.stream.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[0..4], &16i32.to_be_bytes());
        assert_eq!(&frame[4..8], &80877102i32.to_be_bytes());
        assert_eq!(&frame[8..12], &42i32.to_be_bytes());
        assert_eq!(&frame[12..16], &1234i32.to_be_bytes());

        // The "cancelled" query fails on the primary socket.
        conn.write(&[
            error_response("ERROR", "57014", "canceling statement due to user request"),
            ready_for_query(b'I'),
        ])
        .await;
    });

    let mut conn = connect(&config).await.unwrap();
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let mut reader = conn.exec("select pg_sleep(10)", Some(&token)).await.unwrap();
    match reader.read_all().await {
        Err(Error::Pg(e)) => {
            assert_eq!(e.sql_state, "57014");
            assert!(Error::Pg(e).to_string().contains("SQLSTATE 57014"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    drop(reader);
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    handle.await.unwrap();
}

// ==================== lifecycle ====================

#[tokio::test]
async fn fatal_error_closes_connection() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        server.expect_query().await;
        server
            .write(&[error_response(
                "FATAL",
                "57P01",
                "terminating connection due to administrator command",
            )])
            .await;
    });

    let mut reader = conn.exec("select 1", None).await.unwrap();
    match reader.read_all().await {
        Err(Error::Pg(e)) => assert!(e.is_fatal()),
        other => panic!("unexpected result: {other:?}"),
    }
    drop(reader);
    assert_eq!(conn.status(), ConnectionStatus::Closed);

    // Terminal: operations now fail with a lock error naming CLOSED.
    match conn.exec("select 1", None).await {
        Err(Error::Lock(message)) => assert!(message.contains("CLOSED")),
        other => panic!("unexpected result, ok={}", other.is_ok()),
    }
    script.await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let server = MockServer::bind().await;
    let (mut conn, handle) = connected(server).await;
    let mut server = handle.await.unwrap();

    let script = tokio::spawn(async move {
        // Expect a Terminate frame, then EOF.
        let (tag, _) = server.read_frame().await;
        assert_eq!(tag, b'X');
    });

    conn.close().await;
    assert_eq!(conn.status(), ConnectionStatus::Closed);
    conn.close().await;
    assert_eq!(conn.status(), ConnectionStatus::Closed);
    script.await.unwrap();
}
