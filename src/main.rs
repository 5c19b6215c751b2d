// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pndstore::db::models::ListColumn;
use pndstore::packages::{PxmlExtractor, rescan};
use pndstore::repository::{RepositoryClient, SyncMode, SyncOutcome, sync_all};
use pndstore::{Config, Package, Registry, TransactionManager};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "pndstore")]
#[command(author, version, about = "Repository sync and transactional installs for PND packages", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "pndstore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the metadata store
    Init,
    /// Synchronize every configured repository
    Sync {
        /// Always fetch complete catalogs
        #[arg(long, conflicts_with = "incremental")]
        full: bool,
        /// Fetch only changes where the repository supports it
        #[arg(long)]
        incremental: bool,
    },
    /// Rebuild the inventory of installed archives
    Scan,
    /// List known packages
    List {
        /// Only installed packages
        #[arg(long, conflicts_with = "updates")]
        installed: bool,
        /// Only installed packages with a newer version available
        #[arg(long)]
        updates: bool,
    },
    /// Show everything known about one package
    Show {
        /// Package id
        id: String,
    },
    /// Find installed packages by category, application, license...
    Search {
        /// List field to search (categories, applications, licenses,
        /// previewpics, sources, appdatas)
        column: String,
        /// Exact value to match
        value: String,
    },
    /// Install a package into a directory on the search path
    Install {
        /// Package id
        id: String,
        /// Target directory
        target_dir: PathBuf,
    },
    /// Upgrade an installed package to the newest available version
    Upgrade {
        /// Package id
        id: String,
    },
    /// Remove an installed package
    Remove {
        /// Package id
        id: String,
    },
}

fn version_of(instance: Option<pndstore::PackageInstance>) -> String {
    instance
        .map(|i| i.record().version.clone())
        .unwrap_or_else(|| "-".to_string())
}

fn print_summary(pkg: &Package) {
    let title = pkg
        .latest()
        .and_then(|i| i.record().title.clone())
        .unwrap_or_default();
    let marker = if pkg.has_update() {
        "U"
    } else if pkg.is_installed() {
        "I"
    } else {
        " "
    };
    println!(
        "{} {:<32} {:<14} {:<14} {}",
        marker,
        pkg.id(),
        version_of(pkg.local()),
        version_of(pkg.latest_remote()),
        title
    );
}

fn print_details(pkg: &Package) {
    println!("Package: {}", pkg.id());
    println!("  Installed: {}", version_of(pkg.local()));
    if let Some(local) = pkg.local() {
        println!("  Location: {}", local.record().uri);
    }
    for remote in pkg.remote() {
        println!("  Available: {} from {}", remote.record().version, remote.source());
    }

    if let Some(latest) = pkg.latest() {
        let record = latest.record();
        if let Some(title) = &record.title {
            println!("  Title: {}", title);
        }
        if let Some(description) = &record.description {
            println!("  Description: {}", description);
        }
        if let Some(author) = &record.author_name {
            println!("  Author: {}", author);
        }
        if let Some(size) = record.size {
            println!("  Size: {} bytes", size);
        }
        if !record.categories.is_empty() {
            println!("  Categories: {}", record.categories.join(", "));
        }
        if !record.applications.is_empty() {
            println!("  Applications: {}", record.applications.join(", "));
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Some(Commands::Init) => {
            let db_path = config.database_str()?;
            info!("Initializing pndstore database at: {}", db_path);
            pndstore::db::init(db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::Sync { full, incremental }) => {
            let mode = if full {
                SyncMode::Full
            } else if incremental {
                SyncMode::Incremental
            } else {
                SyncMode::Auto
            };

            let client = RepositoryClient::new(config.timeout())?;
            let results = sync_all(&config, &client, mode);

            let mut failures = 0;
            for (url, result) in &results {
                match result {
                    Ok(report) if report.outcome == SyncOutcome::NotModified => {
                        println!("{}: up to date", url);
                    }
                    Ok(report) => println!(
                        "{}: {:?} sync, {} packages written, {} skipped",
                        url, report.outcome, report.written, report.skipped
                    ),
                    Err(e) => {
                        failures += 1;
                        println!("{}: failed: {}", url, e);
                    }
                }
            }

            if failures > 0 && failures == results.len() {
                return Err(anyhow::anyhow!("No repository could be synchronized"));
            }
            Ok(())
        }
        Some(Commands::Scan) => {
            let mut conn = pndstore::db::open(&config.database)?;
            let report = rescan(
                &mut conn,
                &config.searchpath,
                &PxmlExtractor::new(),
                &config.locales,
            )?;
            println!(
                "Indexed {} archive(s), skipped {}",
                report.indexed, report.failed
            );
            Ok(())
        }
        Some(Commands::List { installed, updates }) => {
            let registry = Registry::new(&config.database);
            let packages = if updates {
                registry.updates_available()?
            } else if installed {
                registry.installed()?
            } else {
                registry.all()?
            };

            if packages.is_empty() {
                println!("No packages found.");
            } else {
                for pkg in &packages {
                    print_summary(pkg);
                }
                println!("\nTotal: {} package(s)", packages.len());
            }
            Ok(())
        }
        Some(Commands::Show { id }) => {
            let registry = Registry::new(&config.database);
            let pkg = registry.get(&id)?;
            if pkg.local().is_none() && pkg.remote().is_empty() {
                return Err(anyhow::anyhow!("Package '{}' is unknown", id));
            }
            print_details(&pkg);
            Ok(())
        }
        Some(Commands::Search { column, value }) => {
            let column: ListColumn = column.parse()?;
            let registry = Registry::new(&config.database);
            let packages = registry.search(column, &value)?;

            if packages.is_empty() {
                println!("No installed package has {} '{}'.", column.as_str(), value);
            } else {
                for pkg in &packages {
                    print_summary(pkg);
                }
            }
            Ok(())
        }
        Some(Commands::Install { id, target_dir }) => {
            let registry = Registry::new(&config.database);
            let pkg = registry.get(&id)?;
            let client = RepositoryClient::new(config.timeout())?;
            let extractor = PxmlExtractor::new();
            let manager = TransactionManager::from_config(&config, &client, &extractor);

            let dest = manager
                .install(&pkg, &target_dir)
                .with_context(|| format!("Failed to install {}", id))?;
            println!("Installed {} {} at {}", id, version_of(pkg.local()), dest.display());
            Ok(())
        }
        Some(Commands::Upgrade { id }) => {
            let registry = Registry::new(&config.database);
            let pkg = registry.get(&id)?;
            let previous = version_of(pkg.local());
            let client = RepositoryClient::new(config.timeout())?;
            let extractor = PxmlExtractor::new();
            let manager = TransactionManager::from_config(&config, &client, &extractor);

            manager
                .upgrade(&pkg)
                .with_context(|| format!("Failed to upgrade {}", id))?;
            println!("Upgraded {} from {} to {}", id, previous, version_of(pkg.local()));
            Ok(())
        }
        Some(Commands::Remove { id }) => {
            let registry = Registry::new(&config.database);
            let pkg = registry.get(&id)?;
            let previous = version_of(pkg.local());
            let client = RepositoryClient::new(config.timeout())?;
            let extractor = PxmlExtractor::new();
            let manager = TransactionManager::from_config(&config, &client, &extractor);

            manager
                .remove(&pkg)
                .with_context(|| format!("Failed to remove {}", id))?;
            println!("Removed package: {} version {}", id, previous);
            Ok(())
        }
        None => {
            println!("pndstore: run with --help for usage");
            Ok(())
        }
    }
}
