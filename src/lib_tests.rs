use super::{OlapManager, create_private_dir_all};
use crate::config::OlapConfig;
use crate::engine::fake::FakeEngine;
use crate::engine::{Connection, Value};
use crate::error::OlapErrorCode;
use crate::storage::{TableVersion, write_marker};
use crate::txlock::Consistency;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn open(engine: &FakeEngine, config: OlapConfig) -> OlapManager {
    OlapManager::open(Arc::new(engine.clone()), config).expect("open manager")
}

fn seed_table(root: &Path, table: &str, version: i64) {
    let version = TableVersion::from_millis(version);
    let dir = root.join(table);
    FakeEngine::write_database_file(&dir.join(version.file_name())).expect("table file");
    write_marker(&dir, version).expect("marker");
}

#[tokio::test]
async fn every_connection_runs_the_boot_sequence() {
    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::in_memory().with_pool_size(2));

    let meta = manager.acquire_meta().await.expect("meta");
    assert_eq!(engine.boot_count(), 1);
    let olap = manager.acquire_olap(0, false, false).await.expect("olap");
    assert_eq!(engine.boot_count(), 2);

    let executed = engine.executed();
    assert_eq!(
        executed
            .iter()
            .filter(|q| q.as_str() == "SET preserve_insertion_order TO false")
            .count(),
        2
    );
    assert_eq!(executed.len(), 26);
    drop((meta, olap));
}

#[tokio::test]
async fn host_access_keeps_insertion_order() {
    let engine = FakeEngine::new();
    let config = OlapConfig {
        allow_host_access: true,
        ..OlapConfig::in_memory()
    };
    let manager = open(&engine, config);
    drop(manager.acquire_meta().await.expect("meta"));
    assert!(
        !engine
            .executed()
            .iter()
            .any(|q| q.contains("preserve_insertion_order"))
    );
}

#[tokio::test]
async fn meta_slot_is_not_starved_by_olap_queries() {
    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::in_memory().with_pool_size(2));
    let olap = manager.acquire_olap(0, true, false).await.expect("olap");
    assert_eq!(manager.stats().olap_available, 0);

    let meta = tokio::time::timeout(Duration::from_millis(200), manager.acquire_meta())
        .await
        .expect("meta must not wait for olap")
        .expect("meta");
    assert_eq!(manager.stats().connections_in_use, 2);
    drop((meta, olap));
    let stats = manager.stats();
    assert_eq!(stats.connections_in_use, 0);
    assert_eq!(stats.olap_available, 1);
    assert_eq!(stats.long_running_available, 1);
}

#[tokio::test]
async fn transactional_acquisition_reopens_file_backed_handle_once() {
    let dir = tempdir().expect("temp dir");
    let engine = FakeEngine::new();
    let manager = Arc::new(open(
        &engine,
        OlapConfig::file(dir.path().join("main.db")).with_pool_size(3),
    ));

    let reader = manager.acquire_olap(0, false, false).await.expect("reader");
    let tx = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire_olap(0, false, true).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!tx.is_finished(), "transaction waits for the reader");
    assert_eq!(engine.open_count(), 1);

    drop(reader);
    let exclusive = tx.await.expect("join").expect("transactional lease");
    assert_eq!(exclusive.consistency(), Consistency::Exclusive);
    assert_eq!(engine.open_count(), 2);
    assert_eq!(engine.close_count(), 1);
    assert!(manager.stats().exclusive_held);

    let blocked =
        tokio::time::timeout(Duration::from_millis(30), manager.acquire_meta()).await;
    assert!(blocked.is_err(), "no reader while the transaction runs");

    exclusive.release().expect("release");
    let after = manager.acquire_meta().await.expect("meta after transaction");
    assert_eq!(after.consistency(), Consistency::Shared);
    assert_eq!(engine.open_count(), 2, "release does not reopen");
    assert_eq!(manager.stats().reopens, 1);
}

#[tokio::test]
async fn transactional_acquisition_in_memory_keeps_the_handle() {
    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::in_memory());
    let lease = manager.acquire_olap(0, false, true).await.expect("tx");
    assert_eq!(lease.consistency(), Consistency::Exclusive);
    assert_eq!(engine.open_count(), 1);
}

#[tokio::test]
async fn nested_acquisitions_reuse_the_scoped_connection() {
    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::in_memory().with_pool_size(2));
    let m = &manager;

    let in_use = manager
        .with_connection(0, false, false, |mut lease| async move {
            lease.query("SELECT 1")?;
            let mut nested = m.acquire_olap(5, true, true).await?;
            assert!(nested.is_scoped());
            nested.query("SELECT 1")?;
            let meta = m.acquire_meta().await?;
            assert!(meta.is_scoped());
            let inner = m
                .with_connection(1, false, false, |lease| async move {
                    Ok::<_, crate::OlapError>(lease.is_scoped())
                })
                .await?;
            assert!(inner);
            Ok::<_, crate::OlapError>(m.stats().connections_in_use)
        })
        .await
        .expect("with_connection");

    assert_eq!(in_use, 1);
    assert_eq!(engine.max_connections_live(), 1);
    assert_eq!(manager.stats().connections_in_use, 0);
    assert_eq!(manager.stats().olap_available, 1);
}

#[tokio::test]
async fn lease_returned_from_with_connection_is_cut_off() {
    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::in_memory().with_pool_size(2));

    let mut escaped = manager
        .with_connection(0, false, false, |lease| async move {
            Ok::<_, crate::OlapError>(lease)
        })
        .await
        .expect("with_connection");
    assert_eq!(manager.stats().connections_in_use, 0);
    assert_eq!(engine.connections_live(), 0);

    let err = escaped.query("SELECT 1").expect_err("scope ended");
    assert!(err.message.contains("lease already released"));
    escaped.release().expect("no-op release");
}

#[tokio::test]
async fn acquisition_times_out_and_releases_partial_slots() {
    let engine = FakeEngine::new();
    let manager = open(
        &engine,
        OlapConfig::in_memory()
            .with_pool_size(2)
            .with_acquire_timeout(Duration::from_millis(30)),
    );
    let held = manager.acquire_olap(0, false, false).await.expect("held");

    let err = manager
        .acquire_olap(9, true, false)
        .await
        .expect_err("pool exhausted");
    assert_eq!(err.code(), OlapErrorCode::Timeout);
    let stats = manager.stats();
    assert_eq!(stats.long_running_available, 1);
    assert_eq!(stats.connections_in_use, 1);

    drop(held);
    manager
        .acquire_olap(0, true, false)
        .await
        .expect("slot freed after timeout");
}

#[tokio::test]
async fn fatal_error_drains_then_reopens_and_reattaches_tables() {
    let dir = tempdir().expect("temp dir");
    seed_table(&dir.path().join("main.db.tables"), "orders", 100);
    let engine = FakeEngine::new();
    let manager = Arc::new(open(
        &engine,
        OlapConfig::file(dir.path().join("main.db"))
            .with_pool_size(3)
            .with_external_table_storage(true),
    ));
    assert_eq!(engine.attached(), vec!["orders_100".to_string()]);

    let mut first = manager.acquire_olap(0, false, false).await.expect("first");
    let second = manager.acquire_olap(0, false, false).await.expect("second");
    engine.fail_statement_once("crash", "INTERNAL Error: crash");
    let err = first.execute("SELECT crash").expect_err("fatal");
    assert!(err.message.starts_with("INTERNAL Error"));
    assert!(manager.stats().reopen_pending);

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut lease = manager.acquire_meta().await?;
            Ok::<_, crate::OlapError>(lease.query("SELECT * FROM \"orders\"")?)
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    first.release().expect("release first");
    assert_eq!(engine.open_count(), 1, "second lease still live");
    drop(second);

    let rows = waiter.await.expect("join").expect("query after reopen");
    assert_eq!(rows.scalar(), Some(&Value::Text("orders_100".into())));
    assert_eq!(engine.open_count(), 2);
    assert_eq!(engine.attached(), vec!["orders_100".to_string()]);
    assert_eq!(manager.stats().reopens, 1);
}

#[tokio::test]
async fn failed_reopen_fails_all_later_acquisitions() {
    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::in_memory());
    let mut lease = manager.acquire_olap(0, false, false).await.expect("lease");
    engine.fail_statement_once("boom", "FATAL Error: boom");
    lease.execute("SELECT boom").expect_err("fatal");
    engine.fail_next_open("IO Error: disk detached");

    let err = lease.release().expect_err("reopen fails");
    assert!(err.to_string().contains("disk detached"));
    for _ in 0..2 {
        let err = manager.acquire_meta().await.expect_err("sticky");
        assert_eq!(err.code(), OlapErrorCode::ReopenFailed);
    }
    assert!(manager.stats().failed);
}

#[tokio::test]
async fn check_err_schedules_reopen_for_errors_from_elsewhere() {
    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::in_memory());
    let lease = manager.acquire_meta().await.expect("lease");
    let err = manager.check_err(crate::EngineError::new("INTERNAL Error: bad cast"));
    assert_eq!(err.message, "INTERNAL Error: bad cast");
    assert!(manager.stats().reopen_pending);
    drop(lease);
    assert_eq!(manager.stats().reopens, 1);
}

#[test]
fn incompatible_database_is_recreated_unless_configured_to_fail() {
    let dir = tempdir().expect("temp dir");
    let db = dir.path().join("main.db");
    fs::write(&db, b"written by an older engine").expect("db");
    fs::write(dir.path().join("main.db.wal"), b"wal").expect("wal");

    let strict = OlapConfig {
        error_on_incompatible_version: true,
        ..OlapConfig::file(&db)
    };
    let err = OlapManager::open(Arc::new(FakeEngine::new()), strict).expect_err("strict");
    assert_eq!(err.code(), OlapErrorCode::IncompatibleFormat);
    assert!(err.to_string().contains("older, incompatible version"));
    assert!(db.exists(), "strict mode keeps the file");

    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::file(&db));
    assert_eq!(engine.open_count(), 1);
    assert!(!dir.path().join("main.db.wal").exists());
    assert!(
        fs::read(&db)
            .expect("db")
            .starts_with(crate::engine::fake::FAKE_DB_MAGIC)
    );
    drop(manager);
}

#[test]
fn lock_conflict_reports_another_instance() {
    let dir = tempdir().expect("temp dir");
    let engine = FakeEngine::new();
    engine.fail_next_open("IO Error: Could not set lock on file \"main.db\": Conflicting lock is held");
    let err = OlapManager::open(
        Arc::new(engine),
        OlapConfig::file(dir.path().join("main.db")),
    )
    .expect_err("locked");
    assert_eq!(err.code(), OlapErrorCode::LockedByAnotherProcess);
    assert!(err.to_string().contains("another instance"));
}

#[tokio::test]
async fn restart_recovers_table_storage() {
    let dir = tempdir().expect("temp dir");
    let root = dir.path().join("tables");
    seed_table(&root, "orders", 100);
    write_marker(&root.join("ghost"), TableVersion::from_millis(5)).expect("ghost marker");
    fs::create_dir_all(root.join("unfinished")).expect("unfinished");

    let config = OlapConfig {
        external_storage_path: Some(root.clone()),
        ..OlapConfig::file(dir.path().join("main.db")).with_external_table_storage(true)
    };
    let engine = FakeEngine::new();
    let manager = open(&engine, config.clone());
    assert!(root.join("orders").exists());
    assert!(!root.join("ghost").exists());
    assert!(!root.join("unfinished").exists());

    let storage = manager.table_storage().expect("storage");
    let mut lease = manager.acquire_olap(0, false, false).await.expect("lease");
    let staged = storage.stage_version("orders").expect("stage");
    FakeEngine::write_database_file(staged.path()).expect("fill");
    let new_db = staged.db_name();
    storage.publish(&mut lease, staged).expect("publish");
    drop(lease);
    manager.close().expect("close");
    drop(manager);

    let engine = FakeEngine::new();
    let manager = open(&engine, config.clone());
    assert_eq!(engine.attached(), vec![new_db.clone()]);
    let mut lease = manager.acquire_meta().await.expect("lease");
    let rows = lease.query("SELECT * FROM \"orders\"").expect("query");
    assert_eq!(rows.scalar(), Some(&Value::Text(new_db)));
    drop(lease);
    drop(manager);

    OlapManager::drop_storage(&config).expect("drop storage");
    assert!(!root.exists());
}

#[tokio::test]
async fn closed_manager_rejects_acquisitions() {
    let engine = FakeEngine::new();
    let manager = open(&engine, OlapConfig::in_memory());
    manager.close().expect("close");
    manager.close().expect("close is idempotent");
    assert_eq!(engine.close_count(), 1);
    assert_eq!(
        manager.acquire_meta().await.expect_err("meta").code(),
        OlapErrorCode::Closed
    );
    assert_eq!(
        manager
            .acquire_olap(0, false, false)
            .await
            .expect_err("olap")
            .code(),
        OlapErrorCode::Closed
    );
}

#[tokio::test]
async fn close_wakes_acquisitions_queued_on_a_saturated_pool() {
    let engine = FakeEngine::new();
    let manager = Arc::new(open(&engine, OlapConfig::in_memory().with_pool_size(2)));
    let held = manager.acquire_olap(0, false, false).await.expect("held");

    let queued = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire_olap(3, false, false).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.close().expect("close");

    let err = tokio::time::timeout(Duration::from_millis(500), queued)
        .await
        .expect("queued acquisition returns")
        .expect("join")
        .expect_err("closed");
    assert_eq!(err.code(), OlapErrorCode::Closed);

    let err = tokio::time::timeout(
        Duration::from_millis(500),
        manager.acquire_olap(0, false, false),
    )
    .await
    .expect("new acquisition returns")
    .expect_err("closed");
    assert_eq!(err.code(), OlapErrorCode::Closed);
    drop(held);
}

#[tokio::test]
async fn reopen_between_stage_and_publish_keeps_the_staged_version() {
    let dir = tempdir().expect("temp dir");
    let config = OlapConfig::file(dir.path().join("main.db")).with_external_table_storage(true);
    let engine = FakeEngine::new();
    let manager = open(&engine, config);
    let storage = manager.table_storage().expect("storage");

    let mut lease = manager.acquire_olap(0, false, false).await.expect("lease");
    let first = storage.stage_version("t").expect("stage");
    FakeEngine::write_database_file(first.path()).expect("fill");
    storage.publish(&mut lease, first).expect("publish first");
    drop(lease);

    let staged = storage.stage_version("t").expect("stage");
    FakeEngine::write_database_file(staged.path()).expect("fill");
    manager.check_err(crate::EngineError::new("INTERNAL Error: unrelated failure"));
    assert_eq!(manager.stats().reopens, 1);
    assert!(staged.path().exists());

    let staged_db = staged.db_name();
    let mut lease = manager.acquire_olap(0, false, false).await.expect("lease");
    storage.publish(&mut lease, staged).expect("publish after reopen");
    let rows = lease.query("SELECT * FROM \"t\"").expect("query");
    assert_eq!(rows.scalar(), Some(&Value::Text(staged_db)));
}

#[test]
fn private_dirs_are_created_recursively() {
    let dir = tempdir().expect("temp dir");
    let nested = dir.path().join("a").join("b");
    create_private_dir_all(&nested).expect("create");
    assert!(nested.is_dir());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&nested).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
    let file = dir.path().join("file");
    fs::write(&file, b"x").expect("file");
    assert!(create_private_dir_all(&file).is_err());
}
