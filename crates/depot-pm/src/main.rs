//! Depot Package Manager (depot)

use anyhow::Context;
use clap::{Parser, Subcommand};
use depot_pm::commands::{fetch_project, install_packages, install_project};
use depot_pm::repository::parse_endpoint;
use depot_pm::{Cache, Config, InstallOptions, Installer, RepositoryClient, TerminalPrompt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Depot package manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default ~/.depot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Install directory
    #[arg(long)]
    target: Option<PathBuf>,

    /// Repository endpoint, highest priority first (repeatable)
    #[arg(long = "repository", short = 'r')]
    repositories: Vec<String>,

    /// Maximum number of concurrent downloads
    #[arg(long)]
    concurrency: Option<usize>,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the project's dependencies, or the given packages
    Install {
        /// Packages: name, name@range, name@tag, a directory or a .tar.gz
        packages: Vec<String>,

        /// Replace installed packages that conflict
        #[arg(long, short)]
        force: bool,

        /// Record the packages in depot.json
        #[arg(long, overrides_with = "no_save")]
        save: bool,

        /// Do not record the packages in depot.json
        #[arg(long)]
        no_save: bool,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Download the project's dependencies into the cache
    Fetch {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Inspect or clear the package cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Remove one version, every version of a package, or everything
    Clear {
        name: Option<String>,
        version: Option<String>,
    },
    /// List cached packages
    Ls,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Install {
            packages,
            force,
            save,
            no_save,
            run,
        } => {
            let (installer, mut options, project_dir) = setup(&config, &run)?;
            options.force = force;

            let report = if packages.is_empty() {
                install_project(&project_dir, &installer, &options).await?
            } else {
                install_packages(&project_dir, &packages, save && !no_save, &installer, &options)
                    .await?
            };

            for (name, version) in &report.installed {
                println!("+ {}@{}", name, version);
            }
            println!(
                "Installed {} packages ({} from cache, {} already installed)",
                report.installed.len(),
                report.from_cache,
                report.skipped
            );
        }
        Commands::Fetch { run } => {
            let (installer, options, project_dir) = setup(&config, &run)?;
            let report = fetch_project(&project_dir, &installer, &options).await?;
            println!(
                "Fetched {} packages ({} already cached)",
                report.fetched.len(),
                report.from_cache
            );
        }
        Commands::Cache { command } => {
            let cache = open_cache(&config)?;
            match command {
                CacheCommands::Clear { name, version } => {
                    cache.clear(name.as_deref(), version.as_deref())?;
                    println!("Cache cleared");
                }
                CacheCommands::Ls => {
                    for entry in cache.list()? {
                        println!("{}@{}  sha256:{}", entry.name, entry.version, entry.checksum);
                    }
                }
            }
        }
    }

    Ok(())
}

fn open_cache(config: &Config) -> anyhow::Result<Cache> {
    let cache = match &config.cache_dir {
        Some(dir) => Cache::new(dir.clone())?,
        None => Cache::init()?,
    };
    Ok(cache)
}

/// Build the installer and options from config plus command-line overrides
fn setup(config: &Config, args: &RunArgs) -> anyhow::Result<(Installer, InstallOptions, PathBuf)> {
    let repositories = if args.repositories.is_empty() {
        &config.repositories
    } else {
        &args.repositories
    };
    let endpoints = repositories
        .iter()
        .map(|r| parse_endpoint(r))
        .collect::<Result<Vec<_>, _>>()?;

    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timeout());
    let client = RepositoryClient::with_timeout(open_cache(config)?, timeout)?;
    let installer = Installer::new(Arc::new(client), endpoints, Arc::new(TerminalPrompt));

    let project_dir = std::env::current_dir().context("Could not determine current directory")?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let options = InstallOptions {
        target_dir: project_dir.join(args.target.as_ref().unwrap_or(&config.target_dir)),
        concurrency: args.concurrency.unwrap_or(config.concurrency).max(1),
        force: false,
        cancel,
    };

    Ok((installer, options, project_dir))
}
