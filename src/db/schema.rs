// src/db/schema.rs

//! Database schema definitions and migrations for pndstore
//!
//! The store holds one package table per repository source, one package
//! table for locally installed packages, and an index table tracking the
//! sync state of every source. Package tables are named after their source,
//! so their names are runtime values; [`TableName`] is the only way such a
//! name reaches an SQL string.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use std::fmt;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Table holding locally installed packages
pub const LOCAL_TABLE: &str = "local";

/// Table holding per-repository sync state
pub const REPO_INDEX_TABLE: &str = "repo_index";

const SCHEMA_VERSION_TABLE: &str = "schema_version";

/// A validated package-table identifier
///
/// Accepts printable ASCII without quote characters, and refuses every name
/// used internally (compared case-insensitively, as SQLite does).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    /// Validate a remote source identifier as a table name
    pub fn remote(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::ConfigError("Table name must not be empty".to_string()));
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_graphic() || matches!(c, '"' | '`' | '\'' | '[' | ']'))
        {
            return Err(Error::ConfigError(format!(
                "Cannot use {:?} as a table name: character {:?} is not allowed",
                name, c
            )));
        }

        let lower = name.to_ascii_lowercase();
        if lower == LOCAL_TABLE
            || lower == REPO_INDEX_TABLE
            || lower == SCHEMA_VERSION_TABLE
            || lower.starts_with("sqlite_")
        {
            return Err(Error::ConfigError(format!(
                "Cannot handle a repository named {:?}; name is reserved for internal use",
                name
            )));
        }

        Ok(Self(name.to_string()))
    }

    /// The table of locally installed packages
    pub fn local() -> Self {
        Self(LOCAL_TABLE.to_string())
    }

    pub fn is_local(&self) -> bool {
        self.0 == LOCAL_TABLE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted form for interpolation into SQL
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        debug!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!("Schema migration complete. Now at version {}", SCHEMA_VERSION);
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::InitError(format!("Unknown migration version: {}", version))),
    }
}

/// Initial schema - Version 1
///
/// - repo_index: sync state per repository source
/// - local: packages found on the search path
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS repo_index (
            url TEXT PRIMARY KEY,
            name TEXT,
            etag TEXT,
            last_modified TEXT,
            updates_url TEXT,
            last_update INTEGER NOT NULL DEFAULT 0,
            last_full_update INTEGER NOT NULL DEFAULT 0
        );
        ",
    )?;
    create_package_table(conn, &TableName::local())?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Create a package table if it does not exist yet
pub fn create_package_table(conn: &Connection, table: &TableName) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id TEXT PRIMARY KEY,
            uri TEXT NOT NULL,
            version TEXT NOT NULL,
            title TEXT,
            description TEXT,
            info TEXT,
            size INTEGER,
            checksum TEXT,
            modified_time INTEGER,
            rating INTEGER,
            author_name TEXT,
            author_website TEXT,
            author_email TEXT,
            vendor TEXT,
            icon TEXT,
            previewpics TEXT,
            licenses TEXT,
            sources TEXT,
            categories TEXT,
            applications TEXT,
            appdatas TEXT
        )",
        table.quoted()
    ))?;
    Ok(())
}

/// Drop a package table if it exists
pub fn drop_package_table(conn: &Connection, table: &TableName) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", table.quoted()))?;
    Ok(())
}

/// Check whether a package table exists
///
/// Matches the way SQLite resolves identifiers, ignoring ASCII case.
pub fn table_exists(conn: &Connection, table: &TableName) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        [table.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
