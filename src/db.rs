use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(
    data_dir: P,
    database_file: &str,
    busy_timeout: Duration,
) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    apply_pragmas(&connection, busy_timeout)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "place store ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

fn apply_pragmas(connection: &Connection, busy_timeout: Duration) -> AppResult<()> {
    connection.busy_timeout(busy_timeout)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS places (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            created_at TEXT,
            last_seen_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_places_name ON places(name);
        "#,
    )?;

    // Columns added after the first schema; older stores gain them on open.
    ensure_column(connection, "places", "confirmations INTEGER")?;
    ensure_column(connection, "places", "bearing REAL")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fixed-width UTC timestamp, so stored values compare correctly as text.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
