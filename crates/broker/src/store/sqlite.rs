use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use huddle_common::room::RoomName;

use super::SnapshotStore;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE room_snapshots (
    room_name   TEXT PRIMARY KEY,
    state       BLOB NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// SQLite-backed [`SnapshotStore`]. A single connection behind a mutex
/// is plenty: saves are debounced upstream and loads happen once per
/// room hydration.
#[derive(Debug)]
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create snapshot db parent directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open snapshot db at `{}`", path.display()))?;
        Self::initialize(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory snapshot db")?;
        Self::initialize(conn)
    }

    fn initialize(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .context("failed to configure sqlite pragmas for snapshot db")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        current_schema_version(&conn)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("snapshot db connection lock poisoned"))
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self, room: &RoomName) -> Result<Option<Vec<u8>>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT state FROM room_snapshots WHERE room_name = ?1",
            params![room.as_str()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to load snapshot for room `{room}`"))
    }

    fn save(&self, room: &RoomName, state: &[u8]) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO room_snapshots (room_name, state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(room_name) DO UPDATE SET
                 state = excluded.state,
                 updated_at = excluded.updated_at",
            params![room.as_str(), state, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("failed to save snapshot for room `{room}`"))?;
        Ok(())
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply snapshot db migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
