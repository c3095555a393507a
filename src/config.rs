use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/novels.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LibraryConfig {
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_text_extensions")]
    pub text_extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            text_extensions: default_text_extensions(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("./docs")]
}
fn default_text_extensions() -> Vec<String> {
    vec!["txt".to_string()]
}
fn default_debounce_ms() -> u64 {
    500
}

/// Upper bound for `library.debounce_ms`.
pub const MAX_DEBOUNCE_MS: u64 = 60_000;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5001".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate library
    if config.library.roots.is_empty() {
        anyhow::bail!("library.roots must list at least one directory");
    }

    if config.library.debounce_ms > MAX_DEBOUNCE_MS {
        anyhow::bail!("library.debounce_ms must be <= {}", MAX_DEBOUNCE_MS);
    }

    if config
        .library
        .text_extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case("epub"))
    {
        anyhow::bail!("library.text_extensions must not contain 'epub'; EPUB is always parsed as a container");
    }

    // Validate server
    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    Ok(())
}
