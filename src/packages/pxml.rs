// src/packages/pxml.rs

//! PXML metadata extractor
//!
//! A PND archive is a filesystem image with a PXML document appended,
//! optionally followed by an icon. The PXML holds a `<package>` element
//! describing the archive as a whole and one `<application>` element per
//! contained program. Package-level data wins; the first application is the
//! fallback for anything the package element leaves out.

use super::traits::{ExtractedApplication, ExtractedPackage, MetadataExtractor, VersionFields};
use crate::error::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

const PXML_OPEN: &[u8] = b"<PXML";
const PXML_CLOSE: &[u8] = b"</PXML>";

/// How far from the end of the archive to look for the PXML block
const SEARCH_WINDOW: u64 = 4 * 1024 * 1024;

/// Locale assumed for titles and descriptions without a `lang` attribute
const DEFAULT_LANG: &str = "en_US";

/// Extracts metadata from the PXML block of PND archives
#[derive(Debug, Default, Clone, Copy)]
pub struct PxmlExtractor;

impl PxmlExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Locate and return the PXML document appended to an archive
    fn read_pxml(path: &Path) -> Result<String> {
        let mut file = File::open(path)
            .map_err(|e| Error::ExtractError(format!("Failed to open {}: {}", path.display(), e)))?;

        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(SEARCH_WINDOW)))?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail)?;

        let close = rfind(&tail, PXML_CLOSE).ok_or_else(|| {
            Error::ExtractError(format!("{} has no ending PXML tag", path.display()))
        })?;
        let open = rfind(&tail[..close], PXML_OPEN).ok_or_else(|| {
            Error::ExtractError(format!("{} has no starting PXML tag", path.display()))
        })?;

        Ok(String::from_utf8_lossy(&tail[open..close + PXML_CLOSE.len()]).into_owned())
    }
}

impl MetadataExtractor for PxmlExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedPackage> {
        debug!("Reading PXML from {}", path.display());
        let xml = Self::read_pxml(path)?;
        parse_pxml(&xml)
            .map_err(|e| match e {
                Error::ExtractError(msg) => {
                    Error::ExtractError(format!("{}: {}", path.display(), msg))
                }
                other => other,
            })
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Builder collecting one `<package>` or `<application>` element
#[derive(Debug, Default)]
struct ElementBuilder {
    id: Option<String>,
    version: VersionFields,
    titles: BTreeMap<String, String>,
    descriptions: BTreeMap<String, String>,
    author_name: Option<String>,
    author_website: Option<String>,
    author_email: Option<String>,
    icon: Option<String>,
    categories: Vec<String>,
    previewpics: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Outside,
    Package,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Title,
    Description,
}

fn attribute(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.local_name().as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).trim().to_string())
        .filter(|v| !v.is_empty())
}

fn current<'a>(
    scope: Scope,
    package: &'a mut ElementBuilder,
    apps: &'a mut [ElementBuilder],
) -> Option<&'a mut ElementBuilder> {
    match scope {
        Scope::Package => Some(package),
        Scope::Application => apps.last_mut(),
        Scope::Outside => None,
    }
}

/// Parse a PXML document
pub fn parse_pxml(xml: &str) -> Result<ExtractedPackage> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut package = ElementBuilder::default();
    let mut apps: Vec<ElementBuilder> = Vec::new();
    let mut scope = Scope::Outside;
    let mut text: Option<(TextKind, String)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"package" => {
                        package.id = attribute(&e, b"id");
                        scope = Scope::Package;
                    }
                    b"application" => {
                        apps.push(ElementBuilder {
                            id: attribute(&e, b"id"),
                            ..Default::default()
                        });
                        scope = Scope::Application;
                    }
                    b"title" | b"description" => {
                        let kind = if name.as_ref() == b"title" {
                            TextKind::Title
                        } else {
                            TextKind::Description
                        };
                        let lang = attribute(&e, b"lang").unwrap_or_else(|| DEFAULT_LANG.to_string());
                        text = Some((kind, lang));
                    }
                    _ => {
                        if let Some(target) = current(scope, &mut package, &mut apps) {
                            apply_attributes(target, &e);
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"package" => package.id = attribute(&e, b"id"),
                b"application" => apps.push(ElementBuilder {
                    id: attribute(&e, b"id"),
                    ..Default::default()
                }),
                _ => {
                    if let Some(target) = current(scope, &mut package, &mut apps) {
                        apply_attributes(target, &e);
                    }
                }
            },
            Ok(Event::Text(e)) => {
                if let (Some((kind, lang)), Some(target)) =
                    (&text, current(scope, &mut package, &mut apps))
                {
                    let value = e.unescape().unwrap_or_default().trim().to_string();
                    let map = match kind {
                        TextKind::Title => &mut target.titles,
                        TextKind::Description => &mut target.descriptions,
                    };
                    map.entry(lang.clone()).or_insert(value);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"package" | b"application" => scope = Scope::Outside,
                b"title" | b"description" => text = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::ExtractError(format!("Failed to parse PXML: {}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    build(package, apps)
}

/// Record attribute-only elements (`version`, `author`, `icon`, ...)
fn apply_attributes(target: &mut ElementBuilder, e: &BytesStart) {
    match e.local_name().as_ref() {
        b"version" => {
            target.version = VersionFields {
                major: attribute(e, b"major"),
                minor: attribute(e, b"minor"),
                release: attribute(e, b"release"),
                build: attribute(e, b"build"),
                kind: attribute(e, b"type"),
            };
        }
        b"author" => {
            target.author_name = attribute(e, b"name");
            target.author_website = attribute(e, b"website");
            target.author_email = attribute(e, b"email");
        }
        b"icon" => target.icon = attribute(e, b"src"),
        b"pic" => {
            if let Some(src) = attribute(e, b"src") {
                target.previewpics.push(src);
            }
        }
        b"category" | b"subcategory" => {
            if let Some(name) = attribute(e, b"name") {
                target.categories.push(name);
            }
        }
        _ => {}
    }
}

fn build(package: ElementBuilder, apps: Vec<ElementBuilder>) -> Result<ExtractedPackage> {
    let first = apps.first();

    let id = package
        .id
        .clone()
        .or_else(|| first.and_then(|a| a.id.clone()))
        .ok_or_else(|| Error::FieldError("PXML declares neither package nor application id".to_string()))?;

    let pick_map = |own: &BTreeMap<String, String>, fallback: Option<&BTreeMap<String, String>>| {
        if own.is_empty() {
            fallback.cloned().unwrap_or_default()
        } else {
            own.clone()
        }
    };

    let version = if package.version.is_empty() {
        first.map(|a| a.version.clone()).unwrap_or_default()
    } else {
        package.version.clone()
    };
    let titles = pick_map(&package.titles, first.map(|a| &a.titles));
    let descriptions = pick_map(&package.descriptions, first.map(|a| &a.descriptions));

    let (author_name, author_website, author_email) = if package.author_name.is_some() {
        (package.author_name, package.author_website, package.author_email)
    } else {
        (
            first.and_then(|a| a.author_name.clone()),
            first.and_then(|a| a.author_website.clone()),
            first.and_then(|a| a.author_email.clone()),
        )
    };
    let icon = package.icon.or_else(|| first.and_then(|a| a.icon.clone()));

    let applications = apps
        .iter()
        .filter_map(|a| {
            let id = a.id.clone();
            if id.is_none() {
                debug!("Skipping application without id in package {}", package.id.as_deref().unwrap_or("?"));
            }
            id.map(|id| ExtractedApplication {
                id,
                categories: a.categories.clone(),
                previewpics: a.previewpics.clone(),
            })
        })
        .collect();

    Ok(ExtractedPackage {
        id,
        version,
        titles,
        descriptions,
        author_name,
        author_website,
        author_email,
        icon,
        applications,
    })
}
