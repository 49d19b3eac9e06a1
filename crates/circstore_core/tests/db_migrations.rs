use circstore_core::db::migrations::latest_version;
use circstore_core::db::{open_db, open_db_in_memory, DbError};
use circstore_core::{RepoError, SqliteLoanRepository, SqliteRecordStore, SqliteRequestRepository};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "requests");
    assert_table_exists(&conn, "loans");
    assert_table_exists(&conn, "loan_history");
    assert_unique_index(&conn, "request_item_id_position_idx_unique");
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("circstore.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "requests");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unmigrated_connection_is_refused_by_store_and_repositories() {
    let conn = Connection::open_in_memory().unwrap();

    assert!(matches!(
        SqliteRecordStore::try_new(&conn),
        Err(DbError::UnsupportedSchemaVersion { db_version: 0, .. })
    ));
    assert!(matches!(
        SqliteRequestRepository::try_new(&conn),
        Err(RepoError::UninitializedConnection {
            actual_version: 0,
            ..
        })
    ));
    assert!(matches!(
        SqliteLoanRepository::try_new(&conn),
        Err(RepoError::UninitializedConnection { .. })
    ));
}

#[test]
fn null_positions_do_not_collide() {
    let conn = open_db_in_memory().unwrap();
    let item_id = "0f6a8a4e-4d4c-4c1e-9b7a-7b1f0a3c2d11";

    for id in [
        "7d1c9e02-1a5f-4f0e-8d0b-2a6a3b4c5d61",
        "7d1c9e02-1a5f-4f0e-8d0b-2a6a3b4c5d62",
    ] {
        conn.execute(
            "INSERT INTO requests (id, item_id, position, jsonb) VALUES (?1, ?2, NULL, '{}');",
            [id, item_id],
        )
        .unwrap();
    }

    let duplicate = conn.execute(
        "INSERT INTO requests (id, item_id, position, jsonb)
         VALUES ('7d1c9e02-1a5f-4f0e-8d0b-2a6a3b4c5d63', ?1, 1, '{}'),
                ('7d1c9e02-1a5f-4f0e-8d0b-2a6a3b4c5d64', ?1, 1, '{}');",
        [item_id],
    );
    assert!(duplicate.is_err());
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}

fn assert_unique_index(conn: &Connection, index_name: &str) {
    let unique: i64 = conn
        .query_row(
            "SELECT \"unique\" FROM pragma_index_list('requests') WHERE name = ?1;",
            [index_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(unique, 1, "index {index_name} is not unique");
}
