//! In-process embedded database server.
//!
//! The server owns a shared-cache in-memory SQLite database and serves it
//! over a line protocol on a TCP listener. An anchor connection keeps the
//! in-memory database alive until the server is stopped; pooled connections
//! reach the same database through its `file:` URI.
//!
//! The listener runs on a dedicated tokio runtime with one task per client.
//! Every task watches a shutdown signal, and the runtime is torn down with a
//! bounded timeout, so `stop` returns promptly whatever clients are doing.
//!
//! Protocol, one request per line:
//!
//! - `PING` answers `PONG <database>`
//! - `QUERY <sql>` runs one statement. Result rows come back one per line
//!   with tab-separated columns, followed by `OK <rows>`. Statements without
//!   a result set answer `OK <changed rows>`. Failures answer `ERR <message>`.
//! - anything else answers `ERR unknown command`

use crate::config::{embedded_connection_url, EMBEDDED_DATABASE_NAME};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::io::{self, BufRead, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::watch;

/// Port the embedded server listens on.
pub const EMBEDDED_SERVER_PORT: u16 = 9001;

/// Grace period allowed for the listener to come up.
pub const READINESS_GRACE: Duration = Duration::from_secs(2);

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for the embedded server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedServerSettings {
    /// Name of the in-memory database.
    pub database_name: String,
    /// Address to bind.
    pub host: IpAddr,
    /// Port to bind. `0` picks an ephemeral port.
    pub port: u16,
    /// How long startup waits for the listener to answer.
    pub readiness_grace: Duration,
    /// Suppresses the server's own log output.
    pub silent: bool,
}

impl Default for EmbeddedServerSettings {
    fn default() -> Self {
        Self {
            database_name: EMBEDDED_DATABASE_NAME.to_string(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: EMBEDDED_SERVER_PORT,
            readiness_grace: READINESS_GRACE,
            silent: true,
        }
    }
}

/// Errors raised when the embedded server cannot start.
#[derive(Debug, Error)]
pub enum EmbeddedServerError {
    /// The in-memory database could not be created.
    #[error("failed to open embedded database '{database}': {source}")]
    Database {
        /// The database name.
        database: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The listen address could not be bound.
    #[error("failed to bind embedded server to {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The server runtime could not be built.
    #[error("failed to start embedded server runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// The listener did not answer within the grace period.
#[derive(Debug, Error)]
#[error("embedded server at {addr} not ready after {waited:?}")]
pub struct ReadinessWaitInterrupted {
    /// Address that was polled.
    pub addr: SocketAddr,
    /// Time spent waiting.
    pub waited: Duration,
}

/// State shared by every client task.
struct Shared {
    database_name: String,
    silent: bool,
    db: Mutex<Connection>,
}

/// Handle to a running embedded server.
pub struct EmbeddedServer {
    database_name: String,
    addr: SocketAddr,
    silent: bool,
    shutdown: watch::Sender<bool>,
    runtime: Option<Runtime>,
    shared: Option<Arc<Shared>>,
}

impl EmbeddedServer {
    /// Opens the in-memory database and starts the listener.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddedServerError::Bind`] if the port is already in use,
    /// [`EmbeddedServerError::Database`] if the database cannot be opened,
    /// and [`EmbeddedServerError::Runtime`] if the runtime cannot start.
    pub fn start(settings: &EmbeddedServerSettings) -> Result<Self, EmbeddedServerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("arkive-embedded-{}", settings.database_name))
            .enable_all()
            .build()
            .map_err(EmbeddedServerError::Runtime)?;

        let requested = SocketAddr::new(settings.host, settings.port);
        let bind_err = |source: io::Error| EmbeddedServerError::Bind {
            addr: requested,
            source,
        };
        let listener = runtime
            .block_on(TcpListener::bind(requested))
            .map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;

        let anchor = Connection::open_with_flags(
            embedded_connection_url(&settings.database_name),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|source| EmbeddedServerError::Database {
            database: settings.database_name.clone(),
            source,
        })?;

        let shared = Arc::new(Shared {
            database_name: settings.database_name.clone(),
            silent: settings.silent,
            db: Mutex::new(anchor),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        runtime.spawn(accept_loop(listener, Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            database_name: settings.database_name.clone(),
            addr,
            silent: settings.silent,
            shutdown,
            runtime: Some(runtime),
            shared: Some(shared),
        })
    }

    /// Name of the served database.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Storage location, always memory-backed.
    pub fn storage_path(&self) -> String {
        format!("mem:{}", self.database_name)
    }

    /// URL pooled connections use to reach the database.
    pub fn connection_url(&self) -> String {
        embedded_connection_url(&self.database_name)
    }

    /// Port the listener is bound to.
    pub fn listen_port(&self) -> u16 {
        self.addr.port()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns `true` until [`stop`](Self::stop) has run.
    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Polls the listener until it answers `PING` or `grace` elapses.
    ///
    /// A zero grace period does not poll at all.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessWaitInterrupted`] when the grace period runs out.
    pub fn wait_ready(&self, grace: Duration) -> Result<Duration, ReadinessWaitInterrupted> {
        let started = Instant::now();
        let deadline = started + grace;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ReadinessWaitInterrupted {
                    addr: self.addr,
                    waited: started.elapsed(),
                });
            }
            let budget = (deadline - now).min(READINESS_POLL_INTERVAL);
            if ping(self.addr, &self.database_name, budget).is_ok() {
                return Ok(started.elapsed());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(READINESS_POLL_INTERVAL.min(remaining));
        }
    }

    /// Stops the listener and client sessions, then releases the in-memory
    /// database.
    ///
    /// Returns within a bounded time regardless of connected clients. Safe
    /// to call more than once. Failures are logged.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        // Receivers may all be gone already; that is fine.
        let _ = self.shutdown.send(true);
        runtime.shutdown_timeout(STOP_TIMEOUT);

        if let Some(shared) = self.shared.take() {
            match Arc::try_unwrap(shared) {
                Ok(shared) => {
                    let anchor = shared
                        .db
                        .into_inner()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Err((_, e)) = anchor.close() {
                        tracing::warn!(
                            database = %self.database_name,
                            error = %e,
                            "failed to close embedded database"
                        );
                    }
                }
                Err(_) => tracing::debug!(
                    database = %self.database_name,
                    "embedded database still referenced by a finishing query"
                ),
            }
        }

        if !self.silent {
            tracing::info!(database = %self.database_name, "embedded server stopped");
        }
    }
}

impl Drop for EmbeddedServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EmbeddedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedServer")
            .field("database_name", &self.database_name)
            .field("storage_path", &self.storage_path())
            .field("addr", &self.addr)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                let shared = Arc::clone(&shared);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, &shared, shutdown).await {
                        if !shared.silent {
                            tracing::debug!(%peer, error = %e, "embedded client connection ended");
                        }
                    }
                });
            }
            Err(e) => {
                if !shared.silent {
                    tracing::warn!(error = %e, "embedded server accept failed");
                }
            }
        }
    }
}

async fn serve(
    stream: TcpStream,
    shared: &Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        if *shutdown.borrow() {
            break;
        }
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.changed() => break,
        };
        let Some(line) = line else {
            break;
        };

        let request = line.trim();
        let reply = if request.is_empty() {
            continue;
        } else if request == "PING" {
            vec![format!("PONG {}", shared.database_name)]
        } else if let Some(sql) = request.strip_prefix("QUERY ") {
            run_query(shared, sql.to_string()).await
        } else {
            vec!["ERR unknown command".to_string()]
        };

        for out in reply {
            writer.write_all(out.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
    }
    Ok(())
}

async fn run_query(shared: &Arc<Shared>, sql: String) -> Vec<String> {
    let shared = Arc::clone(shared);
    let result = tokio::task::spawn_blocking(move || {
        let conn = shared
            .db
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        execute(&conn, &sql)
    })
    .await;

    match result {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => vec![format!("ERR {}", single_line(&e.to_string()))],
        Err(e) => vec![format!("ERR query task failed: {e}")],
    }
}

/// Runs one statement and renders the reply lines.
fn execute(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt.column_count();
    if columns == 0 {
        let changed = stmt.execute([])?;
        return Ok(vec![format!("OK {changed}")]);
    }

    let mut lines = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let fields = (0..columns)
            .map(|i| row.get_ref(i).map(render))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        lines.push(fields.join("\t"));
    }
    let count = lines.len();
    lines.push(format!("OK {count}"));
    Ok(lines)
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => single_line(&String::from_utf8_lossy(t)),
        ValueRef::Blob(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("x'{hex}'")
        }
    }
}

fn single_line(s: &str) -> String {
    s.replace(['\n', '\r', '\t'], " ")
}

fn ping(addr: SocketAddr, database_name: &str, timeout: Duration) -> io::Result<()> {
    let mut stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;
    stream.write_all(b"PING\n")?;
    let mut reply = String::new();
    io::BufReader::new(&stream).read_line(&mut reply)?;
    if reply.trim() == format!("PONG {database_name}") {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected reply: {}", reply.trim()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    fn ephemeral(name: &str) -> EmbeddedServerSettings {
        EmbeddedServerSettings {
            database_name: name.to_string(),
            port: 0,
            ..EmbeddedServerSettings::default()
        }
    }

    /// Sends one request line and reads reply lines up to the `OK`/`ERR`
    /// terminator.
    fn request(stream: &mut StdTcpStream, line: &str) -> Vec<String> {
        stream
            .write_all(format!("{line}\n").as_bytes())
            .expect("should write request");
        let mut reader = io::BufReader::new(stream.try_clone().expect("should clone stream"));
        let mut out = Vec::new();
        loop {
            let mut reply = String::new();
            reader.read_line(&mut reply).expect("should read reply");
            let reply = reply.trim_end().to_string();
            let done = ["OK", "ERR", "PONG"].iter().any(|t| reply.starts_with(t));
            out.push(reply);
            if done {
                return out;
            }
        }
    }

    #[test]
    fn start_answers_ping_and_stops() {
        let mut server =
            EmbeddedServer::start(&ephemeral("EmbeddedPingTest")).expect("server should start");
        assert_ne!(server.listen_port(), 0);
        assert_eq!(server.storage_path(), "mem:EmbeddedPingTest");

        server
            .wait_ready(Duration::from_secs(2))
            .expect("listener should answer");

        server.stop();
        assert!(!server.is_running());
        server.stop();
    }

    #[test]
    fn zero_grace_reports_interrupted_wait() {
        let server =
            EmbeddedServer::start(&ephemeral("EmbeddedZeroGrace")).expect("server should start");
        let err = server
            .wait_ready(Duration::ZERO)
            .expect_err("no time to poll");
        assert_eq!(err.addr, server.local_addr());
    }

    #[test]
    fn unknown_commands_get_an_error_line() {
        let server =
            EmbeddedServer::start(&ephemeral("EmbeddedProtocolTest")).expect("server should start");
        let mut stream = StdTcpStream::connect(server.local_addr()).expect("should connect");
        assert_eq!(request(&mut stream, "SHUTDOWN"), vec!["ERR unknown command"]);
    }

    #[test]
    fn query_runs_statements_against_the_database() {
        let server =
            EmbeddedServer::start(&ephemeral("EmbeddedQueryTest")).expect("server should start");
        let mut stream = StdTcpStream::connect(server.local_addr()).expect("should connect");

        assert_eq!(
            request(&mut stream, "QUERY CREATE TABLE notes (id INTEGER, body TEXT)"),
            vec!["OK 0"]
        );
        assert_eq!(
            request(&mut stream, "QUERY INSERT INTO notes VALUES (1, 'a'), (2, NULL)"),
            vec!["OK 2"]
        );
        assert_eq!(
            request(&mut stream, "QUERY SELECT id, body FROM notes ORDER BY id"),
            vec!["1\ta", "2\tNULL", "OK 2"]
        );

        let err = request(&mut stream, "QUERY SELECT * FROM missing");
        assert_eq!(err.len(), 1);
        assert!(err[0].starts_with("ERR "), "got {err:?}");
    }

    #[test]
    fn anchor_keeps_database_shared() {
        let mut server =
            EmbeddedServer::start(&ephemeral("EmbeddedAnchorTest")).expect("server should start");
        let url = server.connection_url();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI;

        let writer = Connection::open_with_flags(&url, flags).expect("should open");
        writer
            .execute_batch("CREATE TABLE marker (id INTEGER); INSERT INTO marker VALUES (7);")
            .expect("should write");
        drop(writer);

        let reader = Connection::open_with_flags(&url, flags).expect("should reopen");
        let id: i64 = reader
            .query_row("SELECT id FROM marker", [], |row| row.get(0))
            .expect("data should survive while the server runs");
        assert_eq!(id, 7);
        drop(reader);
        server.stop();
    }

    #[test]
    fn stop_is_bounded_with_active_clients() {
        let mut server =
            EmbeddedServer::start(&ephemeral("EmbeddedBusyStop")).expect("server should start");
        let addr = server.local_addr();

        // One client pings continuously, another holds an idle session.
        let chatty = thread::spawn(move || {
            let mut stream = StdTcpStream::connect(addr).expect("should connect");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("should set timeout");
            let mut reader = io::BufReader::new(stream.try_clone().expect("should clone"));
            loop {
                if stream.write_all(b"PING\n").is_err() {
                    break;
                }
                let mut reply = String::new();
                match reader.read_line(&mut reply) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => thread::sleep(Duration::from_millis(100)),
                }
            }
        });
        let _idle = StdTcpStream::connect(addr).expect("should connect");
        thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        server.stop();
        let took = started.elapsed();
        assert!(took < Duration::from_secs(3), "stop took {took:?}");

        chatty.join().expect("client thread should finish");
    }

    #[test]
    fn bound_port_is_a_start_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind");
        let port = taken.local_addr().expect("addr").port();
        let settings = EmbeddedServerSettings {
            port,
            ..ephemeral("EmbeddedConflictTest")
        };

        let err = EmbeddedServer::start(&settings).expect_err("port is taken");
        assert!(matches!(err, EmbeddedServerError::Bind { .. }), "got {err:?}");
    }
}
