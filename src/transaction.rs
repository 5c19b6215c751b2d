// src/transaction.rs

//! Install, upgrade and remove transactions
//!
//! Every operation either completes or leaves the filesystem and the local
//! table as they were. Downloads are staged in a temporary file inside the
//! target directory, verified, indexed and only then renamed into place.
//! Upgrades first move the installed archive aside and move it back if
//! anything fails.

use crate::config::{Config, expand_search_paths};
use crate::db::{self, models::PackageRecord, schema::TableName};
use crate::error::{Error, Result};
use crate::hash::{ChecksumType, HashingWriter, digests_match};
use crate::packages::{MetadataExtractor, index_archive};
use crate::registry::{Package, PackageInstance};
use crate::repository::Transport;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Suffix appended to an installed archive while an upgrade is in flight
pub const BACKUP_SUFFIX: &str = ".temp";

/// Progress of one install, upgrade or remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    /// Downloading into a temporary file
    Staging,
    /// Comparing the checksum and reading metadata
    Verifying,
    /// Moving the archive into place and recording it
    Committing,
    Done,
    /// Failed, previous installation restored
    RolledBack,
    Failed,
}

/// Runs package transactions against one store
pub struct TransactionManager<'a> {
    db_path: PathBuf,
    transport: &'a dyn Transport,
    extractor: &'a dyn MetadataExtractor,
    searchpath: Vec<String>,
    locales: Vec<String>,
    state: Mutex<TransactionState>,
}

impl<'a> TransactionManager<'a> {
    pub fn new(
        db_path: impl Into<PathBuf>,
        transport: &'a dyn Transport,
        extractor: &'a dyn MetadataExtractor,
        searchpath: Vec<String>,
        locales: Vec<String>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            transport,
            extractor,
            searchpath,
            locales,
            state: Mutex::new(TransactionState::Idle),
        }
    }

    pub fn from_config(
        config: &Config,
        transport: &'a dyn Transport,
        extractor: &'a dyn MetadataExtractor,
    ) -> Self {
        Self::new(
            config.database.clone(),
            transport,
            extractor,
            config.searchpath.clone(),
            config.locales.clone(),
        )
    }

    /// State reached by the most recent operation
    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, id: &str, state: TransactionState) {
        debug!("Transaction for {}: {:?}", id, state);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Install the newest remote version of `pkg` into `target_dir`
    ///
    /// Returns the path of the installed archive.
    pub fn install(&self, pkg: &Package, target_dir: &Path) -> Result<PathBuf> {
        self.set_state(pkg.id(), TransactionState::Idle);

        if pkg.is_installed() {
            return Err(Error::StateError(format!(
                "Package {} is already installed; upgrade it instead",
                pkg.id()
            )));
        }
        if !target_dir.is_dir() {
            return Err(Error::ConfigError(format!(
                "Install target {} is not a directory",
                target_dir.display()
            )));
        }
        let target_dir = target_dir.canonicalize()?;
        if !expand_search_paths(&self.searchpath).contains(&target_dir) {
            return Err(Error::ConfigError(format!(
                "Install target {} is not on the search path",
                target_dir.display()
            )));
        }
        let remote = pkg.latest_remote().ok_or_else(|| {
            Error::StateError(format!("No repository offers package {}", pkg.id()))
        })?;

        info!(
            "Installing {} {} into {}",
            pkg.id(),
            remote.record().version,
            target_dir.display()
        );

        match self.install_body(&remote, &target_dir) {
            Ok(dest) => {
                pkg.refresh_local()?;
                self.set_state(pkg.id(), TransactionState::Done);
                info!("Installed {} at {}", pkg.id(), dest.display());
                Ok(dest)
            }
            Err(e) => {
                self.set_state(pkg.id(), TransactionState::Failed);
                Err(e)
            }
        }
    }

    /// Replace the installed archive of `pkg` with the newest remote version
    ///
    /// On failure the previous archive is restored before the error returns.
    pub fn upgrade(&self, pkg: &Package) -> Result<PathBuf> {
        self.set_state(pkg.id(), TransactionState::Idle);

        let local = pkg.local().ok_or_else(|| {
            Error::StateError(format!("Package {} is not installed", pkg.id()))
        })?;
        let remote = pkg.latest_remote().ok_or_else(|| {
            Error::StateError(format!("No repository offers package {}", pkg.id()))
        })?;

        let original = PathBuf::from(&local.record().uri);
        if !original.is_file() {
            return Err(Error::StateError(format!(
                "Installed archive {} is missing; rescan first",
                original.display()
            )));
        }
        let dir = original
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                Error::StateError(format!("{} has no parent directory", original.display()))
            })?;

        if remote.version() <= local.version() {
            info!(
                "Reinstalling {}: installed {} is not older than {}",
                pkg.id(),
                local.record().version,
                remote.record().version
            );
        }

        let backup = backup_path(&original);
        debug!("Moving {} aside to {}", original.display(), backup.display());
        fs::rename(&original, &backup)?;

        match self.install_body(&remote, &dir) {
            Ok(dest) => {
                if let Err(e) = fs::remove_file(&backup) {
                    warn!("Could not remove backup {}: {}", backup.display(), e);
                }
                pkg.refresh_local()?;
                self.set_state(pkg.id(), TransactionState::Done);
                info!(
                    "Upgraded {} from {} to {}",
                    pkg.id(),
                    local.record().version,
                    remote.record().version
                );
                Ok(dest)
            }
            Err(e) => {
                warn!("Upgrade of {} failed, restoring {}: {}", pkg.id(), original.display(), e);
                match fs::rename(&backup, &original) {
                    Ok(()) => self.set_state(pkg.id(), TransactionState::RolledBack),
                    Err(restore) => {
                        error!(
                            "Could not restore {} from {}: {}",
                            original.display(),
                            backup.display(),
                            restore
                        );
                        self.set_state(pkg.id(), TransactionState::Failed);
                    }
                }
                Err(e)
            }
        }
    }

    /// Delete the installed archive of `pkg` and its local row
    pub fn remove(&self, pkg: &Package) -> Result<()> {
        self.set_state(pkg.id(), TransactionState::Idle);

        let local = pkg.local().ok_or_else(|| {
            Error::StateError(format!("Package {} is not installed", pkg.id()))
        })?;
        let path = PathBuf::from(&local.record().uri);
        info!("Removing {} ({})", pkg.id(), path.display());

        self.set_state(pkg.id(), TransactionState::Committing);
        let mut conn = db::open(&self.db_path)?;
        let result = db::transaction(&mut conn, |tx| {
            PackageRecord::delete(tx, &TableName::local(), pkg.id())?;
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Archive {} was already gone", path.display());
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        });

        if let Err(e) = result {
            self.set_state(pkg.id(), TransactionState::Failed);
            return Err(e);
        }

        pkg.refresh_local()?;
        self.set_state(pkg.id(), TransactionState::Done);
        Ok(())
    }

    /// Download, verify, index and place one archive in `dir`
    fn install_body(&self, remote: &PackageInstance, dir: &Path) -> Result<PathBuf> {
        let record = remote.record();
        let id = record.id.as_str();

        self.set_state(id, TransactionState::Staging);
        let mut download = self.transport.download(&record.uri)?;
        let dest = dir.join(download.filename(&format!("{}.pnd", id)));
        if dest.exists() {
            return Err(Error::StateError(format!(
                "{} already exists; refusing to overwrite",
                dest.display()
            )));
        }

        let kind = record
            .checksum
            .as_deref()
            .and_then(ChecksumType::detect)
            .unwrap_or(ChecksumType::Md5);

        // Dropping the staged file on any early return deletes it.
        let staged = tempfile::Builder::new()
            .prefix(".pndstore-")
            .suffix(".part")
            .tempfile_in(dir)?;
        let mut writer = HashingWriter::new(staged, kind);
        io::copy(&mut download.reader, &mut writer).map_err(|e| {
            Error::NetworkError(format!("Failed to download {}: {}", record.uri, e))
        })?;
        writer.flush()?;
        let (staged, actual, written) = writer.finish();
        debug!("Staged {} bytes for {} at {}", written, id, staged.path().display());

        self.set_state(id, TransactionState::Verifying);
        if let Some(expected) = &record.checksum {
            if !digests_match(expected, &actual) {
                warn!("Checksum mismatch for {}: expected {}, got {}", id, expected, actual);
                return Err(Error::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let mut local = index_archive(staged.path(), self.extractor, &self.locales, Some(actual))?;
        if local.id != id {
            return Err(Error::FieldError(format!(
                "Archive for {} declares package id {}",
                id, local.id
            )));
        }
        local.uri = dest.display().to_string();

        self.set_state(id, TransactionState::Committing);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))?;
        }
        staged.persist(&dest).map_err(|e| Error::Io(e.error))?;

        let stored = db::open(&self.db_path)
            .and_then(|conn| local.upsert(&conn, &TableName::local()));
        if let Err(e) = stored {
            if let Err(cleanup) = fs::remove_file(&dest) {
                error!("Could not remove {} after failed commit: {}", dest.display(), cleanup);
            }
            return Err(e);
        }

        Ok(dest)
    }
}

/// First free `<path>.temp`, `<path>.temp.temp`, ... name
fn backup_path(original: &Path) -> PathBuf {
    let mut candidate = original.as_os_str().to_owned();
    loop {
        candidate.push(BACKUP_SUFFIX);
        let path = PathBuf::from(&candidate);
        if !path.exists() {
            return path;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::{ExtractedPackage, VersionFields};
    use crate::registry::Registry;
    use crate::repository::{Download, FetchOutcome, Validators};
    use std::collections::{HashMap, HashSet};
    use std::io::Read;

    /// Serves archive bodies from memory
    #[derive(Default)]
    struct MemoryTransport {
        files: Mutex<HashMap<String, Vec<u8>>>,
        /// URLs whose stream breaks after the first bytes
        severed: Mutex<HashSet<String>>,
    }

    impl MemoryTransport {
        fn serve(&self, url: &str, body: &str) {
            self.files
                .lock()
                .unwrap()
                .insert(url.to_string(), body.as_bytes().to_vec());
        }

        fn sever(&self, url: &str) {
            self.severed.lock().unwrap().insert(url.to_string());
        }
    }

    /// Fails every read, like a dropped connection
    struct BrokenStream;

    impl Read for BrokenStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
        }
    }

    impl Transport for MemoryTransport {
        fn fetch(&self, url: &str, _validators: Option<&Validators>) -> Result<FetchOutcome> {
            Err(Error::NetworkError(format!("no catalogs here: {}", url)))
        }

        fn download(&self, url: &str) -> Result<Download> {
            let body = self
                .files
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| Error::NetworkError(format!("404: {}", url)))?;
            let reader: Box<dyn Read + Send> = if self.severed.lock().unwrap().contains(url) {
                let half = body.len() / 2;
                Box::new(io::Cursor::new(body[..half].to_vec()).chain(BrokenStream))
            } else {
                Box::new(io::Cursor::new(body))
            };
            Ok(Download {
                filename_hint: None,
                final_url: url.to_string(),
                reader,
            })
        }
    }

    /// Archives hold `<id> <major>`
    struct PlainExtractor;

    impl MetadataExtractor for PlainExtractor {
        fn extract(&self, path: &Path) -> Result<ExtractedPackage> {
            let content = fs::read_to_string(path)?;
            let mut words = content.split_whitespace();
            Ok(ExtractedPackage {
                id: words.next().unwrap_or_default().to_string(),
                version: VersionFields {
                    major: words.next().map(str::to_string),
                    ..Default::default()
                },
                ..Default::default()
            })
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        db_path: PathBuf,
        apps: PathBuf,
        transport: MemoryTransport,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let db_path = root.path().join("store.db");
            let apps = root.path().join("apps");
            fs::create_dir(&apps).unwrap();
            db::init(db_path.to_str().unwrap()).unwrap();
            Self {
                db_path,
                apps: apps.canonicalize().unwrap(),
                _root: root,
                transport: MemoryTransport::default(),
            }
        }

        fn publish(&self, id: &str, major: u32, checksum: Option<&str>) {
            let conn = db::open(&self.db_path).unwrap();
            let table = crate::db::models::RepositorySource::ensure(&conn, "http://repo.example.com")
                .unwrap()
                .table()
                .unwrap();
            let url = format!("http://repo.example.com/{}.pnd", id);
            let mut record = PackageRecord::new(id.to_string(), url.clone(), format!("{}.0.0.0", major));
            record.checksum = checksum.map(str::to_string);
            record.upsert(&conn, &table).unwrap();
            self.transport.serve(&url, &format!("{} {}", id, major));
        }

        fn local_rows(&self) -> Vec<(String, String)> {
            let conn = db::open(&self.db_path).unwrap();
            PackageRecord::list(&conn, &TableName::local())
                .unwrap()
                .into_iter()
                .map(|r| (r.id, r.uri))
                .collect()
        }

        fn manager<'a>(&'a self, extractor: &'a dyn MetadataExtractor) -> TransactionManager<'a> {
            TransactionManager::new(
                &self.db_path,
                &self.transport,
                extractor,
                vec![self.apps.display().to_string()],
                vec!["en_US".to_string()],
            )
        }
    }

    #[test]
    fn test_install_places_archive_and_records_it() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        let registry = Registry::new(&fixture.db_path);
        let game = registry.get("game").unwrap();

        let manager = fixture.manager(&PlainExtractor);
        let dest = manager.install(&game, &fixture.apps).unwrap();

        assert_eq!(dest, fixture.apps.join("game.pnd"));
        assert_eq!(fs::read_to_string(&dest).unwrap(), "game 1");
        assert_eq!(manager.state(), TransactionState::Done);

        let local = game.local().unwrap();
        assert_eq!(local.record().uri, dest.display().to_string());
        assert_eq!(local.record().checksum.as_ref().map(String::len), Some(32));

        // No staging leftovers
        assert_eq!(fs::read_dir(&fixture.apps).unwrap().count(), 1);
    }

    #[test]
    fn test_install_rejections() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        let registry = Registry::new(&fixture.db_path);
        let manager = fixture.manager(&PlainExtractor);

        let elsewhere = tempfile::tempdir().unwrap();
        let game = registry.get("game").unwrap();
        assert!(matches!(
            manager.install(&game, elsewhere.path()),
            Err(Error::ConfigError(_))
        ));
        assert!(matches!(
            manager.install(&game, &fixture.apps.join("missing")),
            Err(Error::ConfigError(_))
        ));

        let ghost = registry.get("ghost").unwrap();
        assert!(matches!(
            manager.install(&ghost, &fixture.apps),
            Err(Error::StateError(_))
        ));

        manager.install(&game, &fixture.apps).unwrap();
        assert!(matches!(
            manager.install(&game, &fixture.apps),
            Err(Error::StateError(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch_leaves_nothing() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, Some("00000000000000000000000000000000"));
        let registry = Registry::new(&fixture.db_path);
        let game = registry.get("game").unwrap();

        let manager = fixture.manager(&PlainExtractor);
        let result = manager.install(&game, &fixture.apps);

        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
        assert_eq!(manager.state(), TransactionState::Failed);
        assert_eq!(fs::read_dir(&fixture.apps).unwrap().count(), 0);
        assert!(!game.is_installed());
    }

    #[test]
    fn test_upgrade_replaces_archive() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        let registry = Registry::new(&fixture.db_path);
        let game = registry.get("game").unwrap();
        let manager = fixture.manager(&PlainExtractor);
        manager.install(&game, &fixture.apps).unwrap();

        fixture.publish("game", 2, None);
        game.refresh().unwrap();
        assert!(game.has_update());

        let dest = manager.upgrade(&game).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "game 2");
        assert_eq!(game.local().unwrap().record().version, "2.0.0.0");
        assert!(!game.has_update());
        assert_eq!(fs::read_dir(&fixture.apps).unwrap().count(), 1);
    }

    #[test]
    fn test_install_rejects_archive_declaring_other_id() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        fixture
            .transport
            .serve("http://repo.example.com/game.pnd", "renamed 1");
        let registry = Registry::new(&fixture.db_path);
        let game = registry.get("game").unwrap();

        let manager = fixture.manager(&PlainExtractor);
        assert!(matches!(
            manager.install(&game, &fixture.apps),
            Err(Error::FieldError(_))
        ));
        assert_eq!(manager.state(), TransactionState::Failed);
        assert_eq!(fs::read_dir(&fixture.apps).unwrap().count(), 0);
        assert!(fixture.local_rows().is_empty());
    }

    #[test]
    fn test_upgrade_rolls_back_archive_declaring_other_id() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        let registry = Registry::new(&fixture.db_path);
        let game = registry.get("game").unwrap();
        let manager = fixture.manager(&PlainExtractor);
        let original = manager.install(&game, &fixture.apps).unwrap();
        let rows_before = fixture.local_rows();

        fixture.publish("game", 2, None);
        fixture
            .transport
            .serve("http://repo.example.com/game.pnd", "renamed 2");
        game.refresh().unwrap();

        assert!(matches!(manager.upgrade(&game), Err(Error::FieldError(_))));
        assert_eq!(manager.state(), TransactionState::RolledBack);
        assert_eq!(fs::read_to_string(&original).unwrap(), "game 1");
        assert_eq!(fs::read_dir(&fixture.apps).unwrap().count(), 1);
        assert_eq!(fixture.local_rows(), rows_before);
        assert_eq!(game.local().unwrap().record().version, "1.0.0.0");
    }

    #[test]
    fn test_broken_download_leaves_nothing() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        fixture.transport.sever("http://repo.example.com/game.pnd");
        let registry = Registry::new(&fixture.db_path);
        let game = registry.get("game").unwrap();

        let manager = fixture.manager(&PlainExtractor);
        assert!(matches!(
            manager.install(&game, &fixture.apps),
            Err(Error::NetworkError(_))
        ));
        assert_eq!(manager.state(), TransactionState::Failed);
        assert_eq!(fs::read_dir(&fixture.apps).unwrap().count(), 0);
        assert!(fixture.local_rows().is_empty());
        assert!(!game.is_installed());
    }

    #[test]
    fn test_broken_download_during_upgrade_restores_original() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        let registry = Registry::new(&fixture.db_path);
        let game = registry.get("game").unwrap();
        let manager = fixture.manager(&PlainExtractor);
        let original = manager.install(&game, &fixture.apps).unwrap();
        let rows_before = fixture.local_rows();

        fixture.publish("game", 2, None);
        fixture.transport.sever("http://repo.example.com/game.pnd");
        game.refresh().unwrap();

        assert!(matches!(manager.upgrade(&game), Err(Error::NetworkError(_))));
        assert_eq!(manager.state(), TransactionState::RolledBack);
        assert_eq!(fs::read_to_string(&original).unwrap(), "game 1");
        assert_eq!(fs::read_dir(&fixture.apps).unwrap().count(), 1);
        assert_eq!(fixture.local_rows(), rows_before);
    }

    #[test]
    fn test_upgrade_requires_installation() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        let registry = Registry::new(&fixture.db_path);
        let manager = fixture.manager(&PlainExtractor);

        let game = registry.get("game").unwrap();
        assert!(matches!(manager.upgrade(&game), Err(Error::StateError(_))));
    }

    #[test]
    fn test_remove_tolerates_missing_file() {
        let fixture = Fixture::new();
        fixture.publish("game", 1, None);
        let registry = Registry::new(&fixture.db_path);
        let game = registry.get("game").unwrap();
        let manager = fixture.manager(&PlainExtractor);

        let dest = manager.install(&game, &fixture.apps).unwrap();
        fs::remove_file(&dest).unwrap();

        manager.remove(&game).unwrap();
        assert!(!game.is_installed());
        assert!(matches!(manager.remove(&game), Err(Error::StateError(_))));
    }

    #[test]
    fn test_backup_path_probes_for_free_name() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("game.pnd");
        assert_eq!(backup_path(&original), dir.path().join("game.pnd.temp"));

        fs::write(dir.path().join("game.pnd.temp"), b"taken").unwrap();
        assert_eq!(backup_path(&original), dir.path().join("game.pnd.temp.temp"));
    }
}
