// src/packages/scanner.rs

//! Local inventory scanner
//!
//! Rebuilds the `local` table from the archives found on the search path.
//! Metadata is extracted before the store is touched; the table is then
//! replaced inside one transaction.

use super::traits::MetadataExtractor;
use crate::config::expand_search_paths;
use crate::db::models::{ListColumn, PackageRecord};
use crate::db::schema::{self, TableName};
use crate::db;
use crate::error::Result;
use crate::hash::{self, ChecksumType};
use rayon::prelude::*;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Summary of one rescan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Archives written to the local table
    pub indexed: usize,
    /// Archives skipped because extraction failed
    pub failed: usize,
}

/// Build the local-table record for one archive
///
/// `checksum` is stored as given; when absent the archive is hashed with MD5.
pub fn index_archive(
    path: &Path,
    extractor: &dyn MetadataExtractor,
    locales: &[String],
    checksum: Option<String>,
) -> Result<PackageRecord> {
    let mut record = extractor.extract(path)?.into_record(path, locales)?;

    let metadata = std::fs::metadata(path)?;
    record.size = Some(metadata.len() as i64);
    record.modified_time = metadata
        .modified()
        .ok()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp());
    record.checksum = match checksum {
        Some(checksum) => Some(checksum),
        None => Some(hash::file_checksum(path, ChecksumType::Md5)?),
    };

    Ok(record)
}

/// Rebuild the local table from every archive on the search path
///
/// An archive that fails to extract is logged and skipped.
pub fn rescan(
    conn: &mut Connection,
    search_paths: &[String],
    extractor: &dyn MetadataExtractor,
    locales: &[String],
) -> Result<ScanReport> {
    let locations = expand_search_paths(search_paths);
    info!("Scanning {} search locations", locations.len());

    let archives = discover_archives(&locations, extractor);
    debug!("Discovered {} archives", archives.len());

    let results: Vec<(PathBuf, Result<PackageRecord>)> = archives
        .par_iter()
        .map(|path| (path.clone(), index_archive(path, extractor, locales, None)))
        .collect();

    let mut records = Vec::with_capacity(results.len());
    let mut failed = 0;
    for (path, result) in results {
        match result {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("Skipping archive {}: {}", path.display(), e);
                failed += 1;
            }
        }
    }

    let table = TableName::local();
    db::transaction(conn, |tx| {
        schema::drop_package_table(tx, &table)?;
        schema::create_package_table(tx, &table)?;
        for record in &records {
            record.upsert(tx, &table)?;
        }
        Ok(())
    })?;

    let report = ScanReport {
        indexed: records.len(),
        failed,
    };
    info!(
        "Scan complete: {} archives indexed, {} skipped",
        report.indexed, report.failed
    );
    Ok(report)
}

/// Collect archives from all locations, each canonical path once
fn discover_archives(locations: &[PathBuf], extractor: &dyn MetadataExtractor) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut archives = Vec::new();

    for location in locations {
        let found = match extractor.discover(location) {
            Ok(found) => found,
            Err(e) => {
                warn!("Could not list {}: {}", location.display(), e);
                continue;
            }
        };

        for path in found {
            let path = path.canonicalize().unwrap_or(path);
            if seen.insert(path.clone()) {
                archives.push(path);
            } else {
                debug!("Already seen {}", path.display());
            }
        }
    }

    archives
}

/// Installed packages whose list `column` holds `value` as an exact token
pub fn search_local(
    conn: &Connection,
    column: ListColumn,
    value: &str,
) -> Result<Vec<PackageRecord>> {
    PackageRecord::find_by_list_member(conn, &TableName::local(), column, value)
}
