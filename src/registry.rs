// src/registry.rs

//! Package registry
//!
//! A [`Package`] merges everything known about one package id: the locally
//! installed instance, if any, and one instance per repository carrying it.
//! The [`Registry`] hands out one shared `Package` per id for as long as any
//! caller holds it, so state refreshed by a transaction is visible to every
//! holder.

use crate::db::{
    self,
    models::{ListColumn, PackageRecord, RepositorySource},
    schema::TableName,
};
use crate::error::Result;
use crate::packages::scanner;
use crate::version::Version;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::debug;

/// One package as described by a single table
#[derive(Debug, Clone)]
pub struct PackageInstance {
    source: TableName,
    record: PackageRecord,
    version: Version,
}

impl PackageInstance {
    pub fn new(source: TableName, record: PackageRecord) -> Self {
        let version = Version::parse(&record.version);
        Self {
            source,
            record,
            version,
        }
    }

    /// Load the instance of `id` from `table`, if the table has one
    pub fn load(conn: &Connection, table: &TableName, id: &str) -> Result<Option<Self>> {
        Ok(PackageRecord::find_by_id(conn, table, id)?
            .map(|record| Self::new(table.clone(), record)))
    }

    /// Table this instance was read from
    pub fn source(&self) -> &TableName {
        &self.source
    }

    pub fn record(&self) -> &PackageRecord {
        &self.record
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn is_local(&self) -> bool {
        self.source.is_local()
    }
}

fn version_or_absent(instance: Option<&PackageInstance>) -> Version {
    instance.map_or_else(Version::absent, |i| i.version().clone())
}

#[derive(Debug, Default)]
struct PackageState {
    local: Option<PackageInstance>,
    /// In source registration order
    remote: Vec<PackageInstance>,
}

/// Everything known about one package id
#[derive(Debug)]
pub struct Package {
    id: String,
    db_path: PathBuf,
    state: RwLock<PackageState>,
}

impl Package {
    fn load(conn: &Connection, db_path: &Path, id: &str) -> Result<Self> {
        let package = Self {
            id: id.to_string(),
            db_path: db_path.to_path_buf(),
            state: RwLock::new(PackageState::default()),
        };
        package.reload(conn)?;
        Ok(package)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The installed instance
    pub fn local(&self) -> Option<PackageInstance> {
        self.read().local.clone()
    }

    /// Remote instances, first-registered repository first
    pub fn remote(&self) -> Vec<PackageInstance> {
        self.read().remote.clone()
    }

    pub fn is_installed(&self) -> bool {
        self.read().local.is_some()
    }

    /// The remote instance with the highest version
    ///
    /// Among equal versions the earliest registered repository wins.
    pub fn latest_remote(&self) -> Option<PackageInstance> {
        let state = self.read();
        let mut best: Option<&PackageInstance> = None;
        for instance in &state.remote {
            if best.is_none_or(|b| instance.version() > b.version()) {
                best = Some(instance);
            }
        }
        best.cloned()
    }

    /// Version of the installed instance, or the absent sentinel
    pub fn installed_version(&self) -> Version {
        version_or_absent(self.read().local.as_ref())
    }

    /// The best instance overall; the installed one wins ties
    pub fn latest(&self) -> Option<PackageInstance> {
        let local = self.local();
        let installed = version_or_absent(local.as_ref());
        match self.latest_remote() {
            Some(remote) if remote.version() > &installed => Some(remote),
            _ => local,
        }
    }

    /// Whether a repository offers a strictly newer version than installed
    pub fn has_update(&self) -> bool {
        let installed = self.installed_version();
        !installed.is_absent()
            && self
                .latest_remote()
                .is_some_and(|remote| remote.version() > &installed)
    }

    /// Re-read the installed instance from the store
    pub fn refresh_local(&self) -> Result<()> {
        let conn = db::open(&self.db_path)?;
        let local = PackageInstance::load(&conn, &TableName::local(), &self.id)?;
        debug!(
            "Refreshed local instance of {}: {}",
            self.id,
            local.as_ref().map(|l| l.record().version.as_str()).unwrap_or("absent")
        );
        self.write().local = local;
        Ok(())
    }

    /// Re-read every instance from the store
    pub fn refresh(&self) -> Result<()> {
        let conn = db::open(&self.db_path)?;
        self.reload(&conn)
    }

    fn reload(&self, conn: &Connection) -> Result<()> {
        let local = PackageInstance::load(conn, &TableName::local(), &self.id)?;

        let mut remote = Vec::new();
        for source in RepositorySource::list_all(conn)? {
            if let Some(instance) = PackageInstance::load(conn, &source.table()?, &self.id)? {
                remote.push(instance);
            }
        }

        let mut state = self.write();
        state.local = local;
        state.remote = remote;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PackageState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PackageState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide identity map from package id to [`Package`]
///
/// Entries are weak: a package nobody holds any more is rebuilt from the
/// store on the next lookup.
#[derive(Debug)]
pub struct Registry {
    db_path: PathBuf,
    packages: Mutex<HashMap<String, Weak<Package>>>,
}

impl Registry {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            packages: Mutex::new(HashMap::new()),
        }
    }

    /// The shared package for `id`, built on first request
    pub fn get(&self, id: &str) -> Result<Arc<Package>> {
        let conn = db::open(&self.db_path)?;
        self.get_with(&conn, id)
    }

    /// Every package known locally or to any repository, ordered by id
    pub fn all(&self) -> Result<Vec<Arc<Package>>> {
        let conn = db::open(&self.db_path)?;

        let mut tables = RepositorySource::list_all(&conn)?
            .iter()
            .map(RepositorySource::table)
            .collect::<Result<Vec<_>>>()?;
        tables.push(TableName::local());

        PackageRecord::list_ids(&conn, &tables)?
            .iter()
            .map(|id| self.get_with(&conn, id))
            .collect()
    }

    /// Installed packages, ordered by id
    pub fn installed(&self) -> Result<Vec<Arc<Package>>> {
        let conn = db::open(&self.db_path)?;
        PackageRecord::list_ids(&conn, &[TableName::local()])?
            .iter()
            .map(|id| self.get_with(&conn, id))
            .collect()
    }

    /// Installed packages with a strictly newer remote version
    pub fn updates_available(&self) -> Result<Vec<Arc<Package>>> {
        Ok(self
            .installed()?
            .into_iter()
            .filter(|pkg| pkg.has_update())
            .collect())
    }

    /// Installed packages whose list `column` holds `value` as an exact token
    pub fn search(&self, column: ListColumn, value: &str) -> Result<Vec<Arc<Package>>> {
        let conn = db::open(&self.db_path)?;
        scanner::search_local(&conn, column, value)?
            .iter()
            .map(|record| self.get_with(&conn, &record.id))
            .collect()
    }

    fn get_with(&self, conn: &Connection, id: &str) -> Result<Arc<Package>> {
        let mut packages = self
            .packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(package) = packages.get(id).and_then(Weak::upgrade) {
            return Ok(package);
        }

        debug!("Loading package {}", id);
        let package = Arc::new(Package::load(conn, &self.db_path, id)?);
        packages.retain(|_, weak| weak.strong_count() > 0);
        packages.insert(id.to_string(), Arc::downgrade(&package));
        Ok(package)
    }
}
