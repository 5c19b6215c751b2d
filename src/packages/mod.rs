// src/packages/mod.rs

//! Installed package archives
//!
//! This module provides the metadata extractor interface, the PXML
//! extractor for PND archives and the local inventory scanner.

pub mod pxml;
pub mod scanner;
pub mod traits;

pub use pxml::PxmlExtractor;
pub use scanner::{ScanReport, index_archive, rescan, search_local};
pub use traits::{ExtractedApplication, ExtractedPackage, MetadataExtractor, VersionFields};
