// src/db/models.rs

//! Data models for pndstore database entities
//!
//! This module defines Rust structs that correspond to database rows
//! and provides methods for creating, reading, updating, and deleting them.

use crate::db::schema::{self, TableName};
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Separator joining list-valued fields into a single column
pub const LIST_SEPARATOR: char = ';';

/// Marker replaced by the last sync time in incremental update URLs
pub const TIME_MARKER: &str = "%time%";

/// Join a list for storage; an empty list is stored as NULL
pub fn encode_list(items: &[String]) -> Option<String> {
    let items: Vec<&str> = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    if items.is_empty() {
        None
    } else {
        Some(items.join(&LIST_SEPARATOR.to_string()))
    }
}

/// Split a stored list column back into its tokens
pub fn decode_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(LIST_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// List-valued columns of a package table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListColumn {
    PreviewPics,
    Licenses,
    Sources,
    Categories,
    Applications,
    AppDatas,
}

impl ListColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListColumn::PreviewPics => "previewpics",
            ListColumn::Licenses => "licenses",
            ListColumn::Sources => "sources",
            ListColumn::Categories => "categories",
            ListColumn::Applications => "applications",
            ListColumn::AppDatas => "appdatas",
        }
    }
}

impl std::str::FromStr for ListColumn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "previewpics" => Ok(ListColumn::PreviewPics),
            "licenses" => Ok(ListColumn::Licenses),
            "sources" => Ok(ListColumn::Sources),
            "categories" => Ok(ListColumn::Categories),
            "applications" => Ok(ListColumn::Applications),
            "appdatas" => Ok(ListColumn::AppDatas),
            _ => Err(Error::ConfigError(format!("Not a list column: {}", s))),
        }
    }
}

/// Sync state of one remote repository (a row of `repo_index`)
#[derive(Debug, Clone, PartialEq)]
pub struct RepositorySource {
    pub url: String,
    pub name: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub updates_url: Option<String>,
    /// Unix time of the last sync of any kind
    pub last_update: i64,
    /// Unix time of the last full sync
    pub last_full_update: i64,
}

const SOURCE_COLUMNS: &str =
    "url, name, etag, last_modified, updates_url, last_update, last_full_update";

impl RepositorySource {
    /// Create a never-synced source
    pub fn new(url: String) -> Self {
        Self {
            url,
            name: None,
            etag: None,
            last_modified: None,
            updates_url: None,
            last_update: 0,
            last_full_update: 0,
        }
    }

    /// The package table backing this source
    pub fn table(&self) -> Result<TableName> {
        TableName::remote(&self.url)
    }

    /// Incremental update URL, if one is known and carries the time marker
    pub fn updates_url(&self) -> Option<&str> {
        self.updates_url
            .as_deref()
            .filter(|url| url.contains(TIME_MARKER))
    }

    /// Find a source by URL
    pub fn find_by_url(conn: &Connection, url: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repo_index WHERE url = ?1",
            SOURCE_COLUMNS
        ))?;

        let source = stmt.query_row([url], Self::from_row).optional()?;
        Ok(source)
    }

    /// Return the index row for `url`, creating it and its table on first sight
    ///
    /// SQLite folds the case of table names, so a new URL equal to a known one
    /// up to ASCII case would share its table; such a URL is refused.
    pub fn ensure(conn: &Connection, url: &str) -> Result<Self> {
        let table = TableName::remote(url)?;

        if let Some(source) = Self::find_by_url(conn, url)? {
            return Ok(source);
        }

        let clash: Option<String> = conn
            .query_row(
                "SELECT url FROM repo_index WHERE url = ?1 COLLATE NOCASE",
                [url],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = clash {
            return Err(Error::ConfigError(format!(
                "Repository {} differs from {} only in letter case; both would share one table",
                url, existing
            )));
        }

        conn.execute(
            "INSERT INTO repo_index (url, last_update, last_full_update) VALUES (?1, 0, 0)",
            [url],
        )?;
        schema::create_package_table(conn, &table)?;

        Ok(Self::new(url.to_string()))
    }

    /// List all sources in registration order
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repo_index ORDER BY rowid",
            SOURCE_COLUMNS
        ))?;

        let sources = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sources)
    }

    /// Persist the state after a full sync
    pub fn record_full_sync(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE repo_index
             SET name = ?1, etag = ?2, last_modified = ?3, updates_url = ?4,
                 last_update = ?5, last_full_update = ?6
             WHERE url = ?7",
            params![
                &self.name,
                &self.etag,
                &self.last_modified,
                &self.updates_url,
                &self.last_update,
                &self.last_full_update,
                &self.url,
            ],
        )?;
        Ok(())
    }

    /// Persist the state after an incremental sync
    ///
    /// Leaves the cache validators and the full-sync time untouched.
    pub fn record_incremental_sync(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE repo_index SET name = ?1, updates_url = ?2, last_update = ?3 WHERE url = ?4",
            params![&self.name, &self.updates_url, &self.last_update, &self.url],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            url: row.get(0)?,
            name: row.get(1)?,
            etag: row.get(2)?,
            last_modified: row.get(3)?,
            updates_url: row.get(4)?,
            last_update: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
            last_full_update: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        })
    }
}

/// One package as described by a single source (a row of a package table)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageRecord {
    pub id: String,
    pub uri: String,
    pub version: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub info: Option<String>,
    pub size: Option<i64>,
    /// Hex digest; MD5 or SHA-256 depending on length
    pub checksum: Option<String>,
    pub modified_time: Option<i64>,
    pub rating: Option<i64>,
    pub author_name: Option<String>,
    pub author_website: Option<String>,
    pub author_email: Option<String>,
    pub vendor: Option<String>,
    pub icon: Option<String>,
    pub previewpics: Vec<String>,
    pub licenses: Vec<String>,
    pub sources: Vec<String>,
    pub categories: Vec<String>,
    pub applications: Vec<String>,
    pub appdatas: Vec<String>,
}

const RECORD_COLUMNS: &str = "id, uri, version, title, description, info, size, checksum, \
    modified_time, rating, author_name, author_website, author_email, vendor, icon, \
    previewpics, licenses, sources, categories, applications, appdatas";

impl PackageRecord {
    /// Create a record with only the mandatory fields set
    pub fn new(id: String, uri: String, version: String) -> Self {
        Self {
            id,
            uri,
            version,
            ..Default::default()
        }
    }

    /// Reject records lacking an id or URI
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::FieldError("Package has no id".to_string()));
        }
        if self.uri.trim().is_empty() {
            return Err(Error::FieldError(format!("Package {} has no URI", self.id)));
        }
        Ok(())
    }

    /// Insert or replace this record in `table`
    pub fn upsert(&self, conn: &Connection, table: &TableName) -> Result<()> {
        self.validate()?;

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                table.quoted(),
                RECORD_COLUMNS
            ),
            params![
                &self.id,
                &self.uri,
                &self.version,
                &self.title,
                &self.description,
                &self.info,
                &self.size,
                &self.checksum,
                &self.modified_time,
                &self.rating,
                &self.author_name,
                &self.author_website,
                &self.author_email,
                &self.vendor,
                &self.icon,
                encode_list(&self.previewpics),
                encode_list(&self.licenses),
                encode_list(&self.sources),
                encode_list(&self.categories),
                encode_list(&self.applications),
                encode_list(&self.appdatas),
            ],
        )?;
        Ok(())
    }

    /// Find a record by package id; a missing table reads as no record
    pub fn find_by_id(conn: &Connection, table: &TableName, id: &str) -> Result<Option<Self>> {
        if !schema::table_exists(conn, table)? {
            return Ok(None);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE id = ?1",
            RECORD_COLUMNS,
            table.quoted()
        ))?;

        let record = stmt.query_row([id], Self::from_row).optional()?;
        Ok(record)
    }

    /// List every record of a table, ordered by id
    pub fn list(conn: &Connection, table: &TableName) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY id",
            RECORD_COLUMNS,
            table.quoted()
        ))?;

        let records = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// List package ids present in any of `tables`, without duplicates
    pub fn list_ids(conn: &Connection, tables: &[TableName]) -> Result<Vec<String>> {
        let mut selects = Vec::new();
        for table in tables {
            if schema::table_exists(conn, table)? {
                selects.push(format!("SELECT id FROM {}", table.quoted()));
            }
        }

        if selects.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!("{} ORDER BY id", selects.join(" UNION "));
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(ids)
    }

    /// Find records whose list column holds `value` as one exact token
    pub fn find_by_list_member(
        conn: &Connection,
        table: &TableName,
        column: ListColumn,
        value: &str,
    ) -> Result<Vec<Self>> {
        // Wrapping both sides in separators turns token membership into a
        // plain substring test with no LIKE wildcards involved.
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM {table}
             WHERE instr(?2 || {col} || ?2, ?2 || ?1 || ?2) > 0
             ORDER BY id",
            cols = RECORD_COLUMNS,
            table = table.quoted(),
            col = column.as_str(),
        ))?;

        let records = stmt
            .query_map(params![value, LIST_SEPARATOR.to_string()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Delete a record by package id
    pub fn delete(conn: &Connection, table: &TableName, id: &str) -> Result<()> {
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", table.quoted()),
            [id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uri: row.get(1)?,
            version: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            info: row.get(5)?,
            size: row.get(6)?,
            checksum: row.get(7)?,
            modified_time: row.get(8)?,
            rating: row.get(9)?,
            author_name: row.get(10)?,
            author_website: row.get(11)?,
            author_email: row.get(12)?,
            vendor: row.get(13)?,
            icon: row.get(14)?,
            previewpics: decode_list(row.get::<_, Option<String>>(15)?.as_deref()),
            licenses: decode_list(row.get::<_, Option<String>>(16)?.as_deref()),
            sources: decode_list(row.get::<_, Option<String>>(17)?.as_deref()),
            categories: decode_list(row.get::<_, Option<String>>(18)?.as_deref()),
            applications: decode_list(row.get::<_, Option<String>>(19)?.as_deref()),
            appdatas: decode_list(row.get::<_, Option<String>>(20)?.as_deref()),
        })
    }
}
