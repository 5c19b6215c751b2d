// src/packages/traits.rs

//! Metadata extractor interface
//!
//! The store never parses archives itself; it hands a path to a
//! [`MetadataExtractor`] and gets back an [`ExtractedPackage`].

use crate::db::models::PackageRecord;
use crate::error::{Error, Result};
use crate::version;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Structured version fields as declared by an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionFields {
    pub major: Option<String>,
    pub minor: Option<String>,
    pub release: Option<String>,
    pub build: Option<String>,
    /// Release type (`release`, `beta`, ...)
    pub kind: Option<String>,
}

impl VersionFields {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Dotted version string
    pub fn to_version_string(&self) -> String {
        version::synthesize(
            self.major.as_deref(),
            self.minor.as_deref(),
            self.release.as_deref(),
            self.build.as_deref(),
            self.kind.as_deref(),
        )
    }
}

/// One application contained in an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedApplication {
    pub id: String,
    pub categories: Vec<String>,
    pub previewpics: Vec<String>,
}

/// Metadata read from an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedPackage {
    pub id: String,
    pub version: VersionFields,
    /// Titles keyed by locale
    pub titles: BTreeMap<String, String>,
    /// Descriptions keyed by locale
    pub descriptions: BTreeMap<String, String>,
    pub author_name: Option<String>,
    pub author_website: Option<String>,
    pub author_email: Option<String>,
    pub icon: Option<String>,
    pub applications: Vec<ExtractedApplication>,
}

impl ExtractedPackage {
    /// Convert into a local-table record for the archive at `path`
    ///
    /// Categories and preview pictures are the ordered union over all
    /// contained applications.
    pub fn into_record(self, path: &Path, locales: &[String]) -> Result<PackageRecord> {
        if self.id.trim().is_empty() {
            return Err(Error::FieldError(format!(
                "Archive {} declares no package id",
                path.display()
            )));
        }

        let mut record = PackageRecord::new(
            self.id,
            path.display().to_string(),
            self.version.to_version_string(),
        );
        record.title = localized(&self.titles, locales);
        record.description = localized(&self.descriptions, locales);
        record.author_name = self.author_name;
        record.author_website = self.author_website;
        record.author_email = self.author_email;
        record.icon = self.icon;

        for app in self.applications {
            union_into(&mut record.categories, app.categories);
            union_into(&mut record.previewpics, app.previewpics);
            record.applications.push(app.id);
        }

        Ok(record)
    }
}

/// Pick the text for the most preferred locale, else any available one
fn localized(texts: &BTreeMap<String, String>, locales: &[String]) -> Option<String> {
    locales
        .iter()
        .find_map(|lang| texts.get(lang))
        .or_else(|| texts.values().next())
        .cloned()
}

fn union_into(target: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

/// Reads package metadata out of installable archives
pub trait MetadataExtractor: Send + Sync {
    /// Extract metadata from the archive at `path`
    fn extract(&self, path: &Path) -> Result<ExtractedPackage>;

    /// List archives in one search location
    ///
    /// The default lists `*.pnd` files (any case), sorted. Implementations
    /// may report an archive more than once; callers deduplicate.
    fn discover(&self, location: &Path) -> Result<Vec<PathBuf>> {
        let mut archives = Vec::new();
        for entry in std::fs::read_dir(location)? {
            let path = entry?.path();
            let is_pnd = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("pnd"))
                .unwrap_or(false);
            if is_pnd && path.is_file() {
                archives.push(path);
            }
        }
        archives.sort();
        Ok(archives)
    }
}
