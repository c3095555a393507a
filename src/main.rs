//! # Novel Catalog CLI (`novels`)
//!
//! ## Usage
//!
//! ```bash
//! novels --config ./config/novels.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `novels init` | Create the SQLite database and run schema migrations |
//! | `novels scan` | Reconcile the catalog with the library once |
//! | `novels watch` | Reconcile, then follow filesystem changes until Ctrl-C |
//! | `novels serve` | Watch the library and serve the HTTP API until Ctrl-C |
//! | `novels search [query]` | List novels by title or author |
//! | `novels chapters <id>` | Show a novel's table of contents |
//! | `novels read <id>` | Print one chapter's text |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use novel_catalog::catalog::{Catalog, ChapterFetch};
use novel_catalog::config::{self, Config};
use novel_catalog::reconcile::{LibraryFilter, Reconciler, ScanReport};
use novel_catalog::sqlite_store::SqliteStore;
use novel_catalog::store::CatalogStore;
use novel_catalog::watcher::LibraryWatcher;
use novel_catalog::{db, migrate, server};

/// Novel catalog: segments a library of plain-text and EPUB novels into
/// chapters and serves chapter text on demand.
#[derive(Parser)]
#[command(name = "novels", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/novels.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Reconcile the catalog with the library once and exit.
    ///
    /// Purges entries whose files are gone, segments new and changed files,
    /// and prints a summary.
    Scan,

    /// Reconcile, then keep the catalog in sync with filesystem changes.
    Watch,

    /// Watch the library and serve the HTTP API.
    Serve,

    /// List novels whose title or author contains the query.
    Search {
        /// Case-insensitive substring. Omit to list everything.
        query: Option<String>,

        /// Only novels stored under a directory with this name.
        #[arg(long)]
        folder: Option<String>,
    },

    /// Show the chapters of a novel.
    Chapters {
        /// Novel id.
        id: String,
    },

    /// Print the text of one chapter.
    Read {
        /// Chapter id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Scan => {
            let reconciler = reconciler(&cfg).await?;
            let report = reconciler.startup().await?;
            print_report(&report);
        }
        Commands::Watch => {
            let reconciler = Arc::new(reconciler(&cfg).await?);
            let (watcher, report) = LibraryWatcher::start(reconciler, debounce(&cfg)).await?;
            print_report(&report);

            tokio::signal::ctrl_c().await?;
            watcher.shutdown().await;
        }
        Commands::Serve => {
            let reconciler = Arc::new(reconciler(&cfg).await?);
            let catalog = Catalog::new(reconciler.store().clone());
            let (watcher, report) = LibraryWatcher::start(reconciler, debounce(&cfg)).await?;
            print_report(&report);

            let shutdown = CancellationToken::new();
            let bind = cfg.server.bind.clone();
            let token = shutdown.clone();
            let mut server =
                tokio::spawn(async move { server::run_server(&bind, catalog, token).await });

            let finished = tokio::select! {
                res = tokio::signal::ctrl_c() => { res?; None }
                res = &mut server => Some(res),
            };
            shutdown.cancel();
            watcher.shutdown().await;
            match finished {
                Some(res) => res??,
                None => server.await??,
            }
        }
        Commands::Search { query, folder } => {
            let catalog = Catalog::new(open_store(&cfg).await?);
            let novels = match folder {
                Some(folder) => catalog.search_folder(&folder).await?,
                None => catalog.search(query.as_deref()).await?,
            };
            if novels.is_empty() {
                println!("No novels.");
            }
            for (i, novel) in novels.iter().enumerate() {
                match &novel.author {
                    Some(author) => println!("{}. {} by {}", i + 1, novel.title, author),
                    None => println!("{}. {}", i + 1, novel.title),
                }
                println!(
                    "    {} chapters, {}",
                    novel.chapter_count,
                    novel.format.as_str()
                );
                println!("    path: {}", novel.file_path);
                println!("    id: {}", novel.id);
            }
        }
        Commands::Chapters { id } => {
            let catalog = Catalog::new(open_store(&cfg).await?);
            let (Some(chapters), Some(novel)) =
                (catalog.chapters(&id).await?, catalog.novel(&id).await?)
            else {
                bail!("novel not found: {}", id);
            };
            println!("{} ({} chapters)", novel.title, novel.chapter_count);
            for chapter in chapters {
                println!("{}\t{}\t{}", chapter.index, chapter.id, chapter.title);
            }
        }
        Commands::Read { id } => {
            let catalog = Catalog::new(open_store(&cfg).await?);
            match catalog.fetch_chapter(&id).await? {
                ChapterFetch::Content(chapter) => {
                    println!("{}", chapter.title);
                    println!();
                    println!("{}", chapter.content);
                }
                ChapterFetch::UnknownChapter => bail!("chapter not found: {}", id),
                ChapterFetch::Stale(reason) => bail!("chapter {} is stale: {}", id, reason),
            }
        }
    }

    Ok(())
}

/// Logs go to stderr under `RUST_LOG` (default `info`); stdout carries
/// command output only.
fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("novel_catalog=info,novels=info"))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| anyhow!("cannot install log subscriber: {e}"))
}

async fn open_store(cfg: &Config) -> Result<Arc<dyn CatalogStore>> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

async fn reconciler(cfg: &Config) -> Result<Reconciler> {
    let store = open_store(cfg).await?;
    let library = LibraryFilter::from_config(&cfg.library)?;
    Ok(Reconciler::new(store, library))
}

fn debounce(cfg: &Config) -> Duration {
    Duration::from_millis(cfg.library.debounce_ms)
}

fn print_report(report: &ScanReport) {
    println!("Scan complete:");
    println!("  orphans removed: {}", report.orphans_removed);
    println!("  created: {}", report.created);
    println!("  updated: {}", report.updated);
    println!("  unchanged: {}", report.unchanged);
    println!("  removed: {}", report.removed);
    println!("  skipped: {}", report.skipped);
}
