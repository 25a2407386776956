use arkive_db::embedded::EMBEDDED_SERVER_PORT;
use arkive_db::{
    resolve, ConfigError, DatabaseLifecycleManager, EmbeddedServerSettings, LifecycleSettings,
    StartupError,
};
use std::collections::HashMap;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn embedded_server_mode_needs_only_db_type() {
    let mut manager = DatabaseLifecycleManager::new();
    let pool = manager
        .on_startup(&source(&[("Globals.DbType", "hsql_server")]))
        .expect("embedded server startup should succeed");

    assert_eq!(pool.policy().max_wait, Duration::from_millis(10_000));
    assert!(pool.policy().test_on_borrow);

    let server = manager
        .embedded_server()
        .expect("an embedded server should be running");
    assert_eq!(server.listen_port(), EMBEDDED_SERVER_PORT);
    assert_eq!(server.database_name(), "ArkiveDB");
    assert_eq!(server.storage_path(), "mem:ArkiveDB");

    let conn = pool.get().expect("should borrow a connection");
    conn.execute_batch("CREATE TABLE IF NOT EXISTS boot_marker (id INTEGER)")
        .expect("embedded database should accept writes");
    drop(conn);

    manager.on_shutdown();
    manager.on_shutdown();
    assert!(manager.embedded_server().is_none());
}

#[test]
fn mysql_without_username_is_incomplete() {
    let err = resolve(&source(&[
        ("Globals.DbType", "mysql"),
        ("Globals.mysql.DriverClassName", "com.mysql.cj.jdbc.Driver"),
        ("Globals.mysql.Url", "jdbc:mysql://localhost:3306/arkive"),
        ("Globals.mysql.Password", "secret"),
    ]))
    .expect_err("UserName is missing");

    assert!(
        matches!(err, ConfigError::IncompleteBackendConfig { field: "UserName", .. }),
        "got {err:?}"
    );
    assert!(err.to_string().contains("Globals.mysql.UserName"));
}

#[test]
fn occupied_port_fails_startup_without_a_pool() {
    let occupied = TcpListener::bind("127.0.0.1:0").expect("should bind a port");
    let port = occupied.local_addr().expect("should read addr").port();

    let mut manager = DatabaseLifecycleManager::with_settings(LifecycleSettings {
        embedded: EmbeddedServerSettings {
            database_name: "IntegrationConflict".to_string(),
            port,
            ..EmbeddedServerSettings::default()
        },
        ..LifecycleSettings::default()
    });

    let result = manager.on_startup(&source(&[("Globals.DbType", "hsql_server")]));
    assert!(
        matches!(result, Err(StartupError::EmbeddedServerStartFailure(_))),
        "got {result:?}"
    );
    assert!(manager.embedded_server().is_none());
    manager.stop();
}

#[test]
fn external_sqlite_backend_persists_to_file() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("arkive.db");
    let url = path.to_str().expect("utf-8 path");

    let mut manager = DatabaseLifecycleManager::new();
    let pool = manager
        .on_startup(&source(&[
            ("Globals.DbType", "local"),
            ("Globals.local.DriverClassName", "sqlite"),
            ("Globals.local.Url", url),
            ("Globals.local.UserName", "arkive"),
        ]))
        .expect("external backend should start");

    assert!(manager.embedded_server().is_none());
    assert_eq!(
        manager.backend_config().map(|c| c.username.as_str()),
        Some("arkive")
    );

    {
        let conn = pool.get().expect("should borrow");
        conn.execute_batch("CREATE TABLE notes (body TEXT); INSERT INTO notes VALUES ('hi');")
            .expect("should write");
    }
    manager.stop();
    drop(pool);

    let reopened = rusqlite::Connection::open(&path).expect("file should exist");
    let body: String = reopened
        .query_row("SELECT body FROM notes", [], |row| row.get(0))
        .expect("row should be persisted");
    assert_eq!(body, "hi");
}

#[test]
fn unsupported_external_driver_is_fatal() {
    let mut manager = DatabaseLifecycleManager::new();
    let err = manager
        .on_startup(&source(&[
            ("Globals.DbType", "oracle"),
            ("Globals.oracle.DriverClassName", "oracle.jdbc.OracleDriver"),
            ("Globals.oracle.Url", "jdbc:oracle:thin:@localhost:1521:xe"),
            ("Globals.oracle.UserName", "scott"),
        ]))
        .expect_err("driver is not available");
    assert!(matches!(err, StartupError::UnsupportedDriver { .. }), "got {err:?}");
}

#[test]
fn embedded_mode_without_server_starts_no_listener() {
    let mut manager = DatabaseLifecycleManager::new();
    let pool = manager
        .on_startup(&source(&[
            ("Globals.DbType", "HSQL"),
            (
                "Globals.HSQL.Url",
                "file:IntegrationPrivate?mode=memory&cache=shared",
            ),
        ]))
        .expect("embedded mode should start");
    assert!(manager.embedded_server().is_none());
    pool.get().expect("should borrow a connection");
}

#[test]
fn pool_is_shared_across_threads() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("shared.db");
    let url = path.to_str().expect("utf-8 path").to_string();

    let mut manager = DatabaseLifecycleManager::new();
    let pool = manager
        .on_startup(&source(&[
            ("Globals.DbType", "shared"),
            ("Globals.shared.DriverClassName", "sqlite"),
            ("Globals.shared.Url", &url),
            ("Globals.shared.UserName", "arkive"),
        ]))
        .expect("backend should start");

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let pool = pool.clone();
            thread::spawn(move || {
                let conn = pool.get().expect("borrow should succeed within max wait");
                let n: i64 = conn
                    .query_row("SELECT ?1", [i], |row| row.get(0))
                    .expect("query should run");
                assert_eq!(n, i);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker should not panic");
    }

    let status = pool.status();
    assert!(status.connections <= pool.policy().max_total);
}
