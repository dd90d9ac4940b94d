#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use seeker_db::{
    create_pool, DbRuntimeSettings, MigrationManager, MigrationSettings, QueryExecutor, Row,
};
use tempfile::TempDir;

/// A scratch database plus a migrations directory inside one temp dir.
pub struct Harness {
    pub root: TempDir,
    pub executor: QueryExecutor,
    pub manager: MigrationManager,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("should create temp dir");
        let db_path = root.path().join("seeker.db");
        let pool = create_pool(
            db_path.to_str().expect("utf-8 path"),
            DbRuntimeSettings {
                pool_size: 3,
                acquire_timeout_ms: 2_000,
                ..DbRuntimeSettings::default()
            },
        )
        .expect("pool should build");
        let executor = QueryExecutor::new(pool);
        let manager = MigrationManager::new(
            executor.clone(),
            MigrationSettings {
                dir: root.path().join("migrations"),
                ..MigrationSettings::default()
            },
        )
        .expect("manager should build");

        Self {
            root,
            executor,
            manager,
        }
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.root.path().join("migrations")
    }

    pub fn write(&self, file_name: &str, sql: &str) -> PathBuf {
        let dir = self.migrations_dir();
        fs::create_dir_all(&dir).expect("should create migrations dir");
        let path = dir.join(file_name);
        fs::write(&path, sql).expect("should write migration");
        path
    }

    pub fn remove(&self, file_name: &str) {
        fs::remove_file(self.migrations_dir().join(file_name)).expect("should remove migration");
    }

    /// Three forward migrations, each with a rollback script.
    pub fn write_standard_set(&self) {
        self.write(
            "01_create_users.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE);",
        );
        self.write("R01_create_users.sql", "DROP TABLE users;");
        self.write(
            "02_create_posts.sql",
            "CREATE TABLE posts (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                title TEXT NOT NULL
            );
            CREATE INDEX idx_posts_user ON posts(user_id);",
        );
        self.write(
            "R02_create_posts.sql",
            "DROP INDEX idx_posts_user;\nDROP TABLE posts;",
        );
        self.write(
            "03_create_tags.sql",
            "CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT NOT NULL);
             INSERT INTO tags (label) VALUES ('general');",
        );
        self.write("R03_create_tags.sql", "DROP TABLE tags;");
    }

    pub fn applied_versions(&self) -> Vec<String> {
        self.manager
            .get_applied_migrations()
            .expect("should read applied migrations")
            .into_iter()
            .map(|record| record.version)
            .collect()
    }

    /// Every schema object except the tracking table and its trigger.
    pub fn schema(&self) -> Vec<Row> {
        self.executor
            .execute_query(
                "SELECT type, name, tbl_name, sql FROM sqlite_master
                 WHERE name NOT LIKE 'sqlite_%' AND tbl_name <> 'schema_migrations'
                 ORDER BY type, name",
                [],
            )
            .expect("should introspect schema")
    }

    pub fn table_exists(&self, table: &str) -> bool {
        !self
            .executor
            .execute_query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
            )
            .expect("should query sqlite_master")
            .is_empty()
    }
}
