//! Embedded, ordered SQL migration runner (C1).
//!
//! Migration bodies are compiled into the binary via `include_str!` so the
//! whole `eve` binary is self-contained — there is no migrations directory
//! to ship or locate on disk at runtime.

pub mod error;

use rusqlite::Connection;
use tracing::{info, warn};

pub use error::{MigrateError, Result};

/// One embedded migration: a filename (used as the tracking key, and for
/// ordering) and its full SQL body.
struct Migration {
    filename: &'static str,
    sql: &'static str,
}

const WAREHOUSE_MIGRATIONS: &[Migration] = &[
    Migration {
        filename: "0001_core.sql",
        sql: include_str!("../migrations/warehouse/0001_core.sql"),
    },
    Migration {
        filename: "0002_conversations.sql",
        sql: include_str!("../migrations/warehouse/0002_conversations.sql"),
    },
    Migration {
        filename: "0003_compute.sql",
        sql: include_str!("../migrations/warehouse/0003_compute.sql"),
    },
    Migration {
        filename: "0004_facet_null_contact_index.sql",
        sql: include_str!("../migrations/warehouse/0004_facet_null_contact_index.sql"),
    },
];

const QUEUE_MIGRATIONS: &[Migration] = &[Migration {
    filename: "0001_core.sql",
    sql: include_str!("../migrations/queue/0001_core.sql"),
}];

/// Which database a migration run targets. Each has its own independent
/// `schema_migrations` table and migration sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationTarget {
    Warehouse,
    Queue,
}

impl MigrationTarget {
    fn migrations(self) -> &'static [Migration] {
        match self {
            MigrationTarget::Warehouse => WAREHOUSE_MIGRATIONS,
            MigrationTarget::Queue => QUEUE_MIGRATIONS,
        }
    }

    fn label(self) -> &'static str {
        match self {
            MigrationTarget::Warehouse => "warehouse",
            MigrationTarget::Queue => "queue",
        }
    }
}

/// Apply all not-yet-applied migrations for `target`, in lexical filename
/// order, each inside its own transaction. Returns the number newly applied.
///
/// Safe to call on every startup: already-applied filenames are skipped.
pub fn run(conn: &mut Connection, target: MigrationTarget) -> Result<usize> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     TEXT PRIMARY KEY,
            applied_ts  INTEGER NOT NULL
        );",
    )?;

    let mut migrations: Vec<&Migration> = target.migrations().iter().collect();
    migrations.sort_by_key(|m| m.filename);

    let mut applied = 0usize;
    for migration in migrations {
        let already_applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            [migration.filename],
            |row| row.get(0),
        )?;
        if already_applied {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| MigrateError::Apply {
                filename: migration.filename,
                source: e,
            })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_ts) VALUES (?1, ?2)",
            rusqlite::params![migration.filename, chrono::Utc::now().timestamp()],
        )?;
        tx.commit()?;

        info!(target = target.label(), file = migration.filename, "migration applied");
        applied += 1;
    }

    if applied == 0 {
        warn!(target = target.label(), "no pending migrations");
    }
    Ok(applied)
}

/// Open a SQLite connection with the PRAGMAs required by §5: WAL journal
/// mode, foreign keys enabled, and a busy timeout so transient writer locks
/// surface as waits rather than `SQLITE_BUSY` errors.
pub fn open_with_pragmas(path: &str, busy_timeout_ms: u32) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms as u64))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_all_migrations_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        let applied = run(&mut conn, MigrationTarget::Warehouse).unwrap();
        assert_eq!(applied, WAREHOUSE_MIGRATIONS.len());

        // Re-running is a no-op.
        let applied_again = run(&mut conn, MigrationTarget::Warehouse).unwrap();
        assert_eq!(applied_again, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count as usize, WAREHOUSE_MIGRATIONS.len());
    }

    #[test]
    fn queue_migrations_create_jobs_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn, MigrationTarget::Queue).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn migration_filenames_are_distinct_and_sorted() {
        for migrations in [WAREHOUSE_MIGRATIONS, QUEUE_MIGRATIONS] {
            let mut names: Vec<&str> = migrations.iter().map(|m| m.filename).collect();
            let original = names.clone();
            names.sort();
            assert_eq!(names, original, "migrations must be listed in lexical order");
        }
    }

    #[test]
    fn failed_migration_is_not_recorded() {
        // A connection that already has a conflicting table makes the second
        // migration's CREATE TABLE fail; it must not be marked applied.
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_migrations (version TEXT PRIMARY KEY, applied_ts INTEGER NOT NULL);
             CREATE TABLE conversations (id INTEGER PRIMARY KEY);",
        )
        .unwrap();

        let result = run(&mut conn, MigrationTarget::Warehouse);
        assert!(result.is_err());

        let recorded: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE version = '0002_conversations.sql'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(recorded, 0);
    }
}
