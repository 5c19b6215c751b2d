// tests/integration_test.rs

//! Integration tests for pndstore
//!
//! These tests verify end-to-end functionality across modules: catalogs are
//! synchronized from an in-memory transport, archives are plain key=value
//! files read by a test extractor.

use pndstore::db::{self, models::PackageRecord, schema::TableName};
use pndstore::hash::{ChecksumType, Hasher};
use pndstore::packages::{
    ExtractedApplication, ExtractedPackage, MetadataExtractor, VersionFields, rescan,
};
use pndstore::repository::{
    Download, FetchOutcome, SyncMode, Transport, Validators, sync_repository,
};
use pndstore::{Config, Error, Registry, TransactionManager, TransactionState};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::{NamedTempFile, TempDir};

const REPO: &str = "http://repo.example.com/catalog.json";

/// Serves one catalog and any number of archives from memory
#[derive(Default)]
struct MockTransport {
    catalog: Mutex<Option<(String, String)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl Transport for MockTransport {
    fn fetch(&self, url: &str, validators: Option<&Validators>) -> pndstore::Result<FetchOutcome> {
        let catalog = self.catalog.lock().unwrap();
        let (body, etag) = catalog
            .as_ref()
            .filter(|_| url == REPO)
            .ok_or_else(|| Error::NetworkError(format!("unreachable: {}", url)))?;

        if validators.and_then(|v| v.etag.as_deref()) == Some(etag.as_str()) {
            return Ok(FetchOutcome::NotModified);
        }
        Ok(FetchOutcome::Fetched {
            body: body.clone().into_bytes(),
            etag: Some(etag.clone()),
            last_modified: None,
        })
    }

    fn download(&self, url: &str) -> pndstore::Result<Download> {
        let body = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::NetworkError(format!("404: {}", url)))?;
        Ok(Download {
            filename_hint: None,
            final_url: url.to_string(),
            reader: Box::new(std::io::Cursor::new(body)),
        })
    }
}

/// Reads `key=value` archives; can be told to fail
#[derive(Default)]
struct TestExtractor {
    fail: AtomicBool,
}

impl MetadataExtractor for TestExtractor {
    fn extract(&self, path: &Path) -> pndstore::Result<ExtractedPackage> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ExtractError(format!("injected failure: {}", path.display())));
        }

        let mut package = ExtractedPackage::default();
        for line in fs::read_to_string(path)?.lines() {
            match line.split_once('=') {
                Some(("id", value)) => package.id = value.to_string(),
                Some(("version", value)) => {
                    let mut parts = value.split('.').map(str::to_string);
                    package.version = VersionFields {
                        major: parts.next(),
                        minor: parts.next(),
                        release: parts.next(),
                        build: parts.next(),
                        kind: None,
                    };
                }
                Some(("title", value)) => {
                    package.titles.insert("en_US".to_string(), value.to_string());
                }
                Some(("app", value)) => {
                    let (id, categories) = value.split_once(':').unwrap_or((value, ""));
                    package.applications.push(ExtractedApplication {
                        id: id.to_string(),
                        categories: categories
                            .split(',')
                            .filter(|c| !c.is_empty())
                            .map(str::to_string)
                            .collect(),
                        previewpics: Vec::new(),
                    });
                }
                _ => {}
            }
        }
        Ok(package)
    }

    /// Reports each archive once per contained application
    fn discover(&self, location: &Path) -> pndstore::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(location)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pnd") {
                continue;
            }
            let apps = fs::read_to_string(&path)?
                .lines()
                .filter(|l| l.starts_with("app="))
                .count()
                .max(1);
            found.extend(std::iter::repeat_n(path, apps));
        }
        found.sort();
        Ok(found)
    }
}

struct Env {
    _root: TempDir,
    config: Config,
    apps: PathBuf,
    transport: MockTransport,
    extractor: TestExtractor,
}

impl Env {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let apps = root.path().join("sd1/pandora/apps");
        fs::create_dir_all(&apps).unwrap();
        let apps = apps.canonicalize().unwrap();

        let database = root.path().join("appdata/pndstore.db");
        db::init(database.to_str().unwrap()).unwrap();

        let config = Config {
            database,
            repositories: vec![REPO.to_string()],
            locales: vec!["en_US".to_string()],
            searchpath: vec![format!("{}/*/pandora/apps", root.path().display())],
            ..Config::default()
        };

        Self {
            _root: root,
            config,
            apps,
            transport: MockTransport::default(),
            extractor: TestExtractor::default(),
        }
    }

    /// Publish a catalog offering `id` at `major`; returns the archive body
    fn offer(&self, etag: &str, id: &str, major: u32, checksum: Option<String>) -> String {
        let body = archive(id, major, &[&format!("{}-app:Game", id)]);
        let url = format!("http://repo.example.com/files/{}-{}.pnd", id, major);
        let checksum = checksum.unwrap_or_else(|| md5(&body));

        let catalog = json!({
            "repository": {"name": "Test", "version": 3.0},
            "packages": [{
                "id": id,
                "uri": url,
                "version": {"major": major, "minor": 0, "release": 0, "build": 0},
                "localizations": {"en_US": {"title": id, "description": "test package"}},
                "md5": checksum
            }]
        });

        *self.transport.catalog.lock().unwrap() = Some((catalog.to_string(), etag.to_string()));
        self.transport
            .files
            .lock()
            .unwrap()
            .insert(url, body.clone().into_bytes());
        body
    }

    fn sync(&self) {
        let mut conn = db::open(&self.config.database).unwrap();
        sync_repository(&mut conn, &self.transport, REPO, SyncMode::Full, &self.config.locales)
            .unwrap();
    }

    fn manager(&self) -> TransactionManager<'_> {
        TransactionManager::from_config(&self.config, &self.transport, &self.extractor)
    }

    fn local_rows(&self) -> Vec<PackageRecord> {
        let conn = db::open(&self.config.database).unwrap();
        PackageRecord::list(&conn, &TableName::local()).unwrap()
    }

    fn app_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.apps)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

fn archive(id: &str, major: u32, apps: &[&str]) -> String {
    let mut body = format!("id={}\nversion={}.0.0.0\ntitle={}\n", id, major, id);
    for app in apps {
        body.push_str(&format!("app={}\n", app));
    }
    body
}

fn md5(data: &str) -> String {
    let mut hasher = Hasher::new(ChecksumType::Md5);
    hasher.update(data.as_bytes());
    hasher.finalize()
}

#[test]
fn test_database_lifecycle() {
    // Create a temporary database
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();

    // Remove the temp file so init can create it
    drop(temp_file);

    let init_result = db::init(&db_path);
    assert!(init_result.is_ok(), "Database initialization should succeed");
    assert!(
        Path::new(&db_path).exists(),
        "Database file should exist after initialization"
    );

    let conn = db::open(&db_path).expect("Opening database should succeed");
    let local_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'local'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(local_exists, "Local table should exist after initialization");
}

#[test]
fn test_database_init_creates_parent_directories() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir
        .path()
        .join("nested/path/to/pndstore.db")
        .to_str()
        .unwrap()
        .to_string();

    let result = db::init(&db_path);
    assert!(result.is_ok(), "Should create parent directories");
    assert!(
        Path::new(&db_path).exists(),
        "Database should exist in nested path"
    );
}

#[test]
fn test_database_pragmas_are_set() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    drop(temp_file);

    db::init(&db_path).unwrap();
    let conn = db::open(&db_path).unwrap();

    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal_mode.to_lowercase(), "wal", "Should use WAL journal mode");
}

#[test]
fn test_install_and_remove_round_trip() {
    let env = Env::new();
    let body = env.offer("\"v1\"", "game", 1, None);
    env.sync();

    let before = env.local_rows();
    assert!(before.is_empty());

    let registry = Registry::new(&env.config.database);
    let game = registry.get("game").unwrap();
    let manager = env.manager();

    let dest = manager.install(&game, &env.apps).unwrap();
    assert_eq!(fs::read_to_string(&dest).unwrap(), body);
    assert_eq!(env.app_files(), vec!["game-1.pnd"]);

    let rows = env.local_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, "1.0.0.0");
    assert_eq!(rows[0].checksum.as_deref(), Some(md5(&body).as_str()));
    assert_eq!(rows[0].applications, vec!["game-app"]);
    assert!(game.is_installed());

    manager.remove(&game).unwrap();
    assert_eq!(manager.state(), TransactionState::Done);
    assert_eq!(env.local_rows(), before);
    assert!(env.app_files().is_empty());
    assert!(!game.is_installed());
}

#[test]
fn test_checksum_mismatch_leaves_target_untouched() {
    let env = Env::new();
    env.offer("\"v1\"", "game", 1, Some("0123456789abcdef0123456789abcdef".to_string()));
    env.sync();

    let registry = Registry::new(&env.config.database);
    let game = registry.get("game").unwrap();
    let result = env.manager().install(&game, &env.apps);

    assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    assert!(env.app_files().is_empty());
    assert!(env.local_rows().is_empty());
}

#[test]
fn test_failed_upgrade_restores_original() {
    let env = Env::new();
    let original_body = env.offer("\"v1\"", "game", 1, None);
    env.sync();

    let registry = Registry::new(&env.config.database);
    let game = registry.get("game").unwrap();
    let manager = env.manager();
    let original = manager.install(&game, &env.apps).unwrap();
    let rows_before = env.local_rows();

    env.offer("\"v2\"", "game", 2, None);
    env.sync();
    game.refresh().unwrap();
    assert!(game.has_update());

    // Fails after the download is staged, before anything is committed
    env.extractor.fail.store(true, Ordering::SeqCst);
    let result = manager.upgrade(&game);

    assert!(matches!(result, Err(Error::ExtractError(_))));
    assert_eq!(manager.state(), TransactionState::RolledBack);
    assert_eq!(fs::read_to_string(&original).unwrap(), original_body);
    assert_eq!(env.app_files(), vec!["game-1.pnd"]);
    assert_eq!(env.local_rows(), rows_before);
    assert_eq!(game.local().unwrap().record().version, "1.0.0.0");
}

#[test]
fn test_scan_indexes_multi_application_archive_once() {
    let env = Env::new();
    fs::write(
        env.apps.join("suite.pnd"),
        archive("suite", 3, &["snake:Game,ArcadeGame", "tetris:Game,BlocksGame"]),
    )
    .unwrap();

    let mut conn = db::open(&env.config.database).unwrap();
    let report = rescan(
        &mut conn,
        &env.config.searchpath,
        &env.extractor,
        &env.config.locales,
    )
    .unwrap();
    assert_eq!(report.indexed, 1);

    let rows = env.local_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].applications, vec!["snake", "tetris"]);
    assert_eq!(rows[0].categories, vec!["Game", "ArcadeGame", "BlocksGame"]);

    let registry = Registry::new(&env.config.database);
    let found = registry
        .search("applications".parse().unwrap(), "tetris")
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), "suite");
}

#[test]
fn test_updates_available_then_upgrade() {
    let env = Env::new();
    fs::write(env.apps.join("game.pnd"), archive("game", 1, &["game-app:Game"])).unwrap();

    let mut conn = db::open(&env.config.database).unwrap();
    rescan(&mut conn, &env.config.searchpath, &env.extractor, &env.config.locales).unwrap();

    env.offer("\"v2\"", "game", 2, None);
    env.sync();

    let registry = Registry::new(&env.config.database);
    let updates = registry.updates_available().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id(), "game");

    let dest = env.manager().upgrade(&updates[0]).unwrap();
    assert_eq!(dest, env.apps.join("game-2.pnd"));
    assert_eq!(env.app_files(), vec!["game-2.pnd"]);
    assert!(registry.updates_available().unwrap().is_empty());

    let rows = env.local_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uri, dest.display().to_string());
}

#[test]
fn test_unchanged_catalog_keeps_store_untouched() {
    let env = Env::new();
    env.offer("\"v1\"", "game", 1, None);
    env.sync();

    let conn = db::open(&env.config.database).unwrap();
    let table = TableName::remote(REPO).unwrap();
    let before = PackageRecord::list(&conn, &table).unwrap();

    let mut conn = db::open(&env.config.database).unwrap();
    let report =
        sync_repository(&mut conn, &env.transport, REPO, SyncMode::Full, &env.config.locales)
            .unwrap();
    assert_eq!(report.outcome, pndstore::repository::SyncOutcome::NotModified);
    assert_eq!(PackageRecord::list(&conn, &table).unwrap(), before);
}
