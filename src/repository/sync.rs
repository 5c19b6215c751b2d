// src/repository/sync.rs

//! Repository synchronization
//!
//! Each configured repository owns one package table plus a row in the
//! repository index. A full sync replaces the table wholesale inside one
//! transaction, so readers see either the old or the new catalog. An
//! incremental sync upserts only the packages changed since the last sync.

use super::catalog::{self, Catalog};
use super::{FetchOutcome, Transport, Validators, current_timestamp};
use crate::config::Config;
use crate::db::{self, models::RepositorySource, schema};
use crate::db::models::TIME_MARKER;
use crate::error::{Error, Result};
use rayon::prelude::*;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Maximum age of a full sync before Auto forces another (about 35 days)
///
/// Periodic full syncs flush packages removed upstream, which incremental
/// feeds never report.
pub const FULL_SYNC_INTERVAL: i64 = 3_000_000;

/// How to synchronize a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Conditional fetch of the complete catalog
    Full,
    /// Fetch only changes since the last sync
    Incremental,
    /// Incremental when possible, full when stale or no update URL is known
    Auto,
}

impl SyncMode {
    /// Decide the concrete mode for `source` at time `now`
    ///
    /// Never returns `Auto`. `Incremental` without a usable update URL
    /// degrades to `Full`.
    pub fn resolve(self, source: &RepositorySource, now: i64) -> SyncMode {
        match self {
            SyncMode::Full => SyncMode::Full,
            SyncMode::Incremental if source.updates_url().is_some() => SyncMode::Incremental,
            SyncMode::Incremental => SyncMode::Full,
            SyncMode::Auto => {
                if now - source.last_full_update > FULL_SYNC_INTERVAL {
                    SyncMode::Full
                } else if source.updates_url().is_some() {
                    SyncMode::Incremental
                } else {
                    SyncMode::Full
                }
            }
        }
    }
}

/// What a sync actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Upstream unchanged; nothing written
    NotModified,
    /// Table replaced from the complete catalog
    Full,
    /// Changed packages upserted
    Incremental,
}

/// Summary of one repository sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub url: String,
    pub outcome: SyncOutcome,
    /// Packages written to the table
    pub written: usize,
    /// Packages rejected and skipped
    pub skipped: usize,
}

/// Synchronize one repository
pub fn sync_repository(
    conn: &mut Connection,
    transport: &dyn Transport,
    url: &str,
    mode: SyncMode,
    locales: &[String],
) -> Result<SyncReport> {
    sync_repository_at(conn, transport, url, mode, locales, current_timestamp())
}

/// Synchronize one repository as of time `now` (Unix seconds)
pub fn sync_repository_at(
    conn: &mut Connection,
    transport: &dyn Transport,
    url: &str,
    mode: SyncMode,
    locales: &[String],
    now: i64,
) -> Result<SyncReport> {
    let source = RepositorySource::ensure(conn, url)?;
    let mode = mode.resolve(&source, now);
    info!("Synchronizing repository {} ({:?})", url, mode);

    let report = match mode {
        SyncMode::Incremental => sync_incremental(conn, transport, source, locales, now)?,
        _ => sync_full(conn, transport, source, locales, now)?,
    };

    info!(
        "Repository {}: {:?}, {} packages written, {} skipped",
        url, report.outcome, report.written, report.skipped
    );
    Ok(report)
}

fn sync_full(
    conn: &mut Connection,
    transport: &dyn Transport,
    mut source: RepositorySource,
    locales: &[String],
    now: i64,
) -> Result<SyncReport> {
    let validators = Validators {
        etag: source.etag.clone(),
        last_modified: source.last_modified.clone(),
    };

    let (body, etag, last_modified) = match transport.fetch(&source.url, Some(&validators))? {
        FetchOutcome::NotModified => {
            return Ok(SyncReport {
                url: source.url,
                outcome: SyncOutcome::NotModified,
                written: 0,
                skipped: 0,
            });
        }
        FetchOutcome::Fetched {
            body,
            etag,
            last_modified,
        } => (body, etag, last_modified),
    };

    // Validate everything document-level before touching the store.
    let catalog = Catalog::parse(&body)?;
    let packages = catalog.packages.ok_or_else(|| {
        Error::FormatError(format!("Catalog from {} has no package list", source.url))
    })?;
    let table = source.table()?;

    source.name = catalog.name;
    source.etag = etag;
    source.last_modified = last_modified;
    source.updates_url = catalog.updates_url;
    source.last_update = now;
    source.last_full_update = now;

    let (written, skipped) = db::transaction(conn, |tx| {
        schema::drop_package_table(tx, &table)?;
        schema::create_package_table(tx, &table)?;
        let counts = apply_packages(tx, &table, &packages, locales)?;
        source.record_full_sync(tx)?;
        Ok(counts)
    })?;

    Ok(SyncReport {
        url: source.url,
        outcome: SyncOutcome::Full,
        written,
        skipped,
    })
}

fn sync_incremental(
    conn: &mut Connection,
    transport: &dyn Transport,
    mut source: RepositorySource,
    locales: &[String],
    now: i64,
) -> Result<SyncReport> {
    let template = source.updates_url().ok_or_else(|| {
        Error::StateError(format!("Repository {} has no update URL", source.url))
    })?;
    let updates_url = template.replace(TIME_MARKER, &source.last_update.to_string());
    debug!("Incremental update URL: {}", updates_url);

    let body = match transport.fetch(&updates_url, None)? {
        FetchOutcome::NotModified => {
            return Ok(SyncReport {
                url: source.url,
                outcome: SyncOutcome::NotModified,
                written: 0,
                skipped: 0,
            });
        }
        FetchOutcome::Fetched { body, .. } => body,
    };

    let catalog = Catalog::parse_update(&body)?;
    let packages = catalog.packages.unwrap_or_default();
    let table = source.table()?;

    if catalog.name.is_some() {
        source.name = catalog.name;
    }
    if catalog.updates_url.is_some() {
        source.updates_url = catalog.updates_url;
    }
    source.last_update = now;

    let (written, skipped) = db::transaction(conn, |tx| {
        schema::create_package_table(tx, &table)?;
        let counts = apply_packages(tx, &table, &packages, locales)?;
        source.record_incremental_sync(tx)?;
        Ok(counts)
    })?;

    Ok(SyncReport {
        url: source.url,
        outcome: SyncOutcome::Incremental,
        written,
        skipped,
    })
}

/// Upsert every decodable package, skipping the rest with a warning
fn apply_packages(
    conn: &Connection,
    table: &schema::TableName,
    packages: &[Value],
    locales: &[String],
) -> Result<(usize, usize)> {
    let mut written = 0;
    let mut skipped = 0;

    for entry in packages {
        match catalog::decode_package(entry, locales) {
            Ok(record) => {
                record.upsert(conn, table)?;
                written += 1;
            }
            Err(e) => {
                warn!("Could not process package from {}: {}", table, e);
                skipped += 1;
            }
        }
    }

    Ok((written, skipped))
}

/// Synchronize every configured repository
///
/// Sources are registered one after another in configuration order, which
/// fixes their tie-break rank, and then fetched in parallel, each on its own
/// connection. A failing source is logged and reported in its slot; it never
/// affects the others. Results are returned in configuration order.
pub fn sync_all(
    config: &Config,
    transport: &dyn Transport,
    mode: SyncMode,
) -> Vec<(String, Result<SyncReport>)> {
    let registered: Vec<Result<()>> = match db::open(&config.database) {
        Ok(conn) => config
            .repositories
            .iter()
            .map(|url| RepositorySource::ensure(&conn, url).map(|_| ()))
            .collect(),
        Err(e) => {
            // Each source reopens the store below and reports the failure
            warn!("Could not register repositories: {}", e);
            config.repositories.iter().map(|_| Ok(())).collect()
        }
    };

    config
        .repositories
        .par_iter()
        .zip(registered.into_par_iter())
        .map(|(url, registered)| {
            let result = registered.and_then(|()| {
                let mut conn = db::open(&config.database)?;
                sync_repository(&mut conn, transport, url, mode, &config.locales)
            });
            if let Err(e) = &result {
                warn!("Could not synchronize {}: {}", url, e);
            }
            (url.clone(), result)
        })
        .collect()
}
