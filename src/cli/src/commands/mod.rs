//! CLI command definitions and dispatch.

pub mod restore;
pub mod save;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use dlc_core::{CacheConfig, Result};
use dlc_runtime::{CacheStore, DockerCli, ImageTool, LocalCacheStore};

pub use restore::RestoreArgs;
pub use save::SaveArgs;

/// DLC - cache docker images layer by layer between CI runs.
#[derive(Parser)]
#[command(name = "dlc", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Restore cached images and record what was already present
    Restore(RestoreArgs),
    /// Save images built since restore
    Save(SaveArgs),
}

/// Configuration overrides shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Working directory for exported images
    #[arg(long, global = true)]
    pub images_dir: Option<PathBuf>,

    /// Local cache store directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum concurrent layer operations
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Run state file shared by restore and save
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    /// Extra `docker image ls` filter
    #[arg(long, global = true)]
    pub filter: Option<String>,

    /// Cache the export as a single unit instead of per layer
    #[arg(long, global = true)]
    pub no_parallel: bool,
}

impl ConfigArgs {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn resolve(&self) -> Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_file(path)?,
            None => CacheConfig::default(),
        };
        if let Some(dir) = &self.images_dir {
            config.images_dir = dir.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(path) = &self.state_file {
            config.state_file = path.clone();
        }
        if let Some(filter) = &self.filter {
            config.filter = Some(filter.clone());
        }
        if self.no_parallel {
            config.parallel = false;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Cache store and image tool a command runs against.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn CacheStore>,
    pub tool: Arc<dyn ImageTool>,
}

impl Services {
    /// Local cache store under `config.cache_dir` and the docker CLI.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        Ok(Self {
            store: Arc::new(LocalCacheStore::new(&config.cache_dir)?),
            tool: Arc::new(DockerCli::default()),
        })
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = cli.config.resolve()?;
    let services = Services::open(&config)?;
    tracing::debug!(?config, "Resolved configuration");

    match cli.command {
        Command::Restore(args) => restore::execute(args, &config, &services).await,
        Command::Save(args) => save::execute(args, &config, &services).await,
    }
}
