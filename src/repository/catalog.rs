// src/repository/catalog.rs

//! Repository catalog decoding
//!
//! A catalog is a JSON document with a `repository` descriptor and a list of
//! `packages`. The descriptor of a full catalog is validated up front, while
//! incremental payloads may omit it. Packages are decoded one at a time so a
//! single malformed entry only costs that entry.

use crate::db::models::PackageRecord;
use crate::error::{Error, Result};
use crate::version;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Repository specification versions this crate understands
pub const ACCEPTED_SPEC_VERSIONS: &[f64] = &[2.0, 3.0];

#[derive(Debug, Deserialize)]
struct RawCatalog {
    repository: Option<RawDescriptor>,
    #[serde(default)]
    packages: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDescriptor {
    name: Option<String>,
    version: Option<Value>,
    updates: Option<String>,
}

/// A validated catalog document
#[derive(Debug)]
pub struct Catalog {
    pub name: Option<String>,
    /// Declared specification version; always present in a full catalog
    pub spec_version: Option<f64>,
    /// Incremental update URL template, as published
    pub updates_url: Option<String>,
    /// Undecoded package entries; `None` when the document carries none
    pub packages: Option<Vec<Value>>,
}

impl Catalog {
    /// Parse and validate a complete catalog document
    pub fn parse(body: &[u8]) -> Result<Self> {
        let raw = Self::decode(body)?;
        let descriptor = raw.repository.ok_or_else(|| {
            Error::FormatError("Document has no repository descriptor".to_string())
        })?;

        let version = descriptor.version.as_ref().ok_or_else(|| {
            Error::FormatError("Repository descriptor has no specification version".to_string())
        })?;
        let spec_version = check_spec_version(version)?;

        Ok(Self {
            name: descriptor.name,
            spec_version: Some(spec_version),
            updates_url: descriptor.updates,
            packages: raw.packages,
        })
    }

    /// Parse an incremental update payload
    ///
    /// Only well-formed JSON is required. The descriptor is optional here;
    /// a specification version it does declare must still be supported.
    pub fn parse_update(body: &[u8]) -> Result<Self> {
        let raw = Self::decode(body)?;
        let descriptor = raw.repository.unwrap_or_default();
        let spec_version = descriptor
            .version
            .as_ref()
            .map(check_spec_version)
            .transpose()?;

        Ok(Self {
            name: descriptor.name,
            spec_version,
            updates_url: descriptor.updates,
            packages: raw.packages,
        })
    }

    fn decode(body: &[u8]) -> Result<RawCatalog> {
        serde_json::from_slice(body)
            .map_err(|e| Error::FormatError(format!("Malformed repository document: {}", e)))
    }
}

fn check_spec_version(value: &Value) -> Result<f64> {
    let spec_version = as_f64(value).ok_or_else(|| {
        Error::FormatError(format!("Unreadable repository specification version {}", value))
    })?;

    if ACCEPTED_SPEC_VERSIONS
        .iter()
        .any(|v| (v - spec_version).abs() < f64::EPSILON)
    {
        Ok(spec_version)
    } else {
        Err(Error::FormatError(format!(
            "Unsupported repository specification version {}",
            spec_version
        )))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireVersion {
    major: Option<Value>,
    minor: Option<Value>,
    release: Option<Value>,
    build: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireLocalization {
    title: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireAuthor {
    name: Option<String>,
    website: Option<String>,
    email: Option<String>,
}

/// Package entry as published; every field optional so presence is explicit
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePackage {
    id: Option<String>,
    uri: Option<String>,
    version: Option<WireVersion>,
    localizations: Option<HashMap<String, WireLocalization>>,
    info: Option<String>,
    size: Option<Value>,
    md5: Option<String>,
    #[serde(rename = "modified-time")]
    modified_time: Option<Value>,
    rating: Option<Value>,
    author: Option<WireAuthor>,
    vendor: Option<String>,
    icon: Option<String>,
    previewpics: Option<Vec<String>>,
    licenses: Option<Vec<String>>,
    source: Option<Vec<String>>,
    categories: Option<Vec<String>>,
}

/// Decode one package entry into a record
///
/// Title and description come from the first locale in `locales` that the
/// package is localized into; a package matching none of them is rejected.
pub fn decode_package(value: &Value, locales: &[String]) -> Result<PackageRecord> {
    let pkg = WirePackage::deserialize(value)
        .map_err(|e| Error::FieldError(format!("Undecodable package entry: {}", e)))?;

    let id = pkg
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::FieldError("Package entry has no id".to_string()))?;
    let uri = pkg
        .uri
        .filter(|uri| !uri.trim().is_empty())
        .ok_or_else(|| Error::FieldError(format!("Package {} has no URI", id)))?;

    let localizations = pkg.localizations.unwrap_or_default();
    let localization = locales
        .iter()
        .find_map(|lang| localizations.get(lang))
        .ok_or_else(|| {
            Error::FieldError(format!(
                "Package {} has no localization for any of {:?}",
                id, locales
            ))
        })?;

    let v = pkg.version.unwrap_or_default();
    let [major, minor, release, build, kind] =
        [&v.major, &v.minor, &v.release, &v.build, &v.kind].map(|c| c.as_ref().and_then(as_string));
    let version = version::synthesize(
        major.as_deref(),
        minor.as_deref(),
        release.as_deref(),
        build.as_deref(),
        kind.as_deref(),
    );

    let author = pkg.author.unwrap_or_default();

    Ok(PackageRecord {
        id,
        uri,
        version,
        title: localization.title.clone(),
        description: localization.description.clone(),
        info: pkg.info,
        size: pkg.size.as_ref().and_then(as_i64),
        checksum: pkg.md5.filter(|m| !m.trim().is_empty()),
        modified_time: pkg.modified_time.as_ref().and_then(as_i64),
        rating: pkg.rating.as_ref().and_then(as_i64),
        author_name: author.name,
        author_website: author.website,
        author_email: author.email,
        vendor: pkg.vendor,
        icon: pkg.icon,
        previewpics: pkg.previewpics.unwrap_or_default(),
        licenses: pkg.licenses.unwrap_or_default(),
        sources: pkg.source.unwrap_or_default(),
        categories: pkg.categories.unwrap_or_default(),
        applications: Vec::new(),
        appdatas: Vec::new(),
    })
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
