mod common;

use std::thread;

use common::Harness;
use rusqlite::types::Value;
use seeker_db::{
    create_pool, Column, DbError, DbRuntimeSettings, Patch, PoolError, QueryExecutor,
    UpdateBuilder,
};

#[test]
fn db_initialization_works() {
    let h = Harness::new();
    h.manager.ensure_table().expect("failed to bootstrap tracking table");

    let tables: Vec<String> = h
        .executor
        .execute_query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
            [],
        )
        .expect("failed to execute table query")
        .iter()
        .map(|row| row.get_as("name").expect("failed to read table name"))
        .collect();

    assert_eq!(tables, ["schema_migrations"]);
}

#[test]
fn pool_construction_fails_on_a_non_database_file() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("garbage.db");
    std::fs::write(&path, "this is not a sqlite database ".repeat(64)).expect("write garbage");

    let err = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect_err("opening garbage must fail at startup");

    assert!(matches!(err, PoolError::Connect(_)), "got {err:?}");
}

#[test]
fn concurrent_writers_share_the_pool() {
    let h = Harness::new();
    h.executor
        .execute_update("CREATE TABLE hits (id INTEGER PRIMARY KEY, worker INTEGER NOT NULL)", [])
        .expect("create table");

    thread::scope(|s| {
        for worker in 0..8 {
            let executor: &QueryExecutor = &h.executor;
            s.spawn(move || {
                for _ in 0..10 {
                    executor
                        .execute_insert("INSERT INTO hits (worker) VALUES (?1)", [worker])
                        .expect("insert should succeed under contention");
                }
            });
        }
    });

    let rows = h
        .executor
        .execute_query("SELECT COUNT(*) AS n FROM hits", [])
        .expect("count");
    assert_eq!(rows[0].get_as::<i64>("n").expect("count converts"), 80);

    let status = h.executor.pool().status();
    assert_eq!(status.leased, 0);
    assert_eq!(status.idle, status.capacity);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountColumn {
    DisplayName,
    Email,
    IsActive,
}

impl Column for AccountColumn {
    fn name(self) -> &'static str {
        match self {
            Self::DisplayName => "display_name",
            Self::Email => "email",
            Self::IsActive => "is_active",
        }
    }
}

#[derive(Default)]
struct AccountPatch {
    display_name: Option<String>,
    email: Option<String>,
    is_active: Option<bool>,
}

impl Patch for AccountPatch {
    type Column = AccountColumn;

    fn assignments(&self) -> Vec<(AccountColumn, Value)> {
        let mut out = Vec::new();
        if let Some(name) = &self.display_name {
            out.push((AccountColumn::DisplayName, Value::from(name.clone())));
        }
        if let Some(email) = &self.email {
            out.push((AccountColumn::Email, Value::from(email.clone())));
        }
        if let Some(active) = self.is_active {
            out.push((AccountColumn::IsActive, Value::from(active)));
        }
        out
    }
}

#[test]
fn patch_updates_only_present_fields() {
    let h = Harness::new();
    h.executor
        .execute_update(
            "CREATE TABLE accounts (
                id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )
        .expect("create table");
    let id = h
        .executor
        .execute_insert(
            "INSERT INTO accounts (display_name, email) VALUES (?1, ?2)",
            ["Ada", "ada@example.com"],
        )
        .expect("insert");

    let patch = AccountPatch {
        display_name: Some("Robert'); DROP TABLE accounts; --".to_string()),
        is_active: Some(false),
        ..AccountPatch::default()
    };
    let stmt = UpdateBuilder::from_patch("accounts", &patch)
        .build("id", id)
        .expect("patch has fields");
    let changed = h.executor.execute_statement(&stmt).expect("update");
    assert_eq!(changed, 1);

    let rows = h
        .executor
        .execute_query(
            "SELECT display_name, email, is_active FROM accounts WHERE id = ?1",
            [id],
        )
        .expect("select");
    let row = &rows[0];
    assert_eq!(
        row.get_as::<String>("display_name").expect("name"),
        "Robert'); DROP TABLE accounts; --"
    );
    assert_eq!(row.get_as::<String>("email").expect("email"), "ada@example.com");
    assert!(!row.get_as::<bool>("is_active").expect("flag"));
}

#[test]
fn closed_pool_surfaces_connection_errors() {
    let h = Harness::new();
    h.executor.pool().close_all();

    let err = h
        .executor
        .execute_query("SELECT 1", [])
        .expect_err("closed pool cannot serve queries");

    assert!(err.is_connection_error());
    assert!(matches!(err, DbError::Connection(PoolError::Closed)));
}
