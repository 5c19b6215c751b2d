// src/lib.rs

//! pndstore
//!
//! Backend of a package manager for PND archives: repository catalogs are
//! synchronized into a local SQLite store, reconciled against the archives
//! installed on the search path, and packages are installed, upgraded and
//! removed transactionally.
//!
//! # Architecture
//!
//! - Store-first: every catalog, the local inventory and per-repository sync
//!   state live in SQLite; each operation opens its own connection
//! - One table per repository plus the `local` table, all with one schema
//! - Packages: one shared [`registry::Package`] per id merges the installed
//!   instance with every remote instance
//! - Transactions: staged downloads, checksum verification, atomic rename,
//!   rollback of upgrades

pub mod config;
pub mod db;
mod error;
pub mod hash;
pub mod packages;
pub mod registry;
pub mod repository;
pub mod transaction;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use registry::{Package, PackageInstance, Registry};
pub use transaction::{TransactionManager, TransactionState};
pub use version::Version;
