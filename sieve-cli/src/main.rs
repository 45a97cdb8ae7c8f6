//! proxy-sieve CLI
//!
//! Crawls proxy lists, scans address ranges and keeps a validated proxy pool.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use sieve_agents::{load_toml, MergeOutcome};
use sieve_core::{CrawlTemplate, ResultKind};
use sieve_runtime::{Loops, Settings, Supervisor};

const DEFAULT_CONFIG: &str = "proxy-sieve.toml";

#[derive(Parser)]
#[command(name = "proxy-sieve")]
#[command(author, version, about = "proxy-sieve: proxy discovery and validation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1")]
    verbose: u8,

    /// Settings file (defaults apply when the default file is absent)
    #[arg(short, long, env = "PROXY_SIEVE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the selected loops until Ctrl-C (all when none selected)
    Run {
        /// Crawl the seed list on an interval
        #[arg(long)]
        crawl: bool,

        /// Scan backlog ranges
        #[arg(long)]
        scan: bool,

        /// Check queued candidates for anonymity
        #[arg(long)]
        check_anony: bool,

        /// Re-validate the history pool
        #[arg(long)]
        check_history: bool,
    },

    /// Crawl the seed list once
    Crawl,

    /// Run one template against a saved page
    Extract {
        /// Template file
        #[arg(short, long)]
        template: PathBuf,

        /// HTML file
        #[arg(short, long)]
        page: PathBuf,
    },

    /// Force a scan backlog re-merge
    Merge,

    /// Show queue, pool and counter sizes
    Status,

    /// Register a helper host heartbeat
    Heartbeat {
        #[arg(long)]
        name: String,

        #[arg(long)]
        ip: Ipv4Addr,

        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = cli.config;

    match cli.command {
        Commands::Run {
            crawl,
            scan,
            check_anony,
            check_history,
        } => {
            let mut loops = Loops {
                crawl,
                scan,
                anonymity: check_anony,
                history: check_history,
            };
            if loops.is_empty() {
                loops = Loops::all();
            }

            let supervisor = connect(config.as_deref()).await?;
            let cancel = supervisor.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, stopping loops");
                }
                cancel.cancel();
            });

            supervisor.run(loops).await?;
        }
        Commands::Crawl => {
            let report = connect(config.as_deref()).await?.crawl_once().await?;
            println!(
                "Crawled {} pages ({} failed): {} proxies, {} ranges",
                report.pages, report.failures, report.proxies, report.ranges
            );
        }
        Commands::Extract { template, page } => {
            extract(&template, &page)?;
        }
        Commands::Merge => match connect(config.as_deref()).await?.merger().force_merge().await? {
            MergeOutcome::Merged { before, after } => {
                println!("Backlog merged: {} -> {} ranges", before, after)
            }
            MergeOutcome::Skipped { pending } => {
                println!("Backlog left as is ({} ranges)", pending)
            }
        },
        Commands::Status => {
            println!("{}", connect(config.as_deref()).await?.status().await?);
        }
        Commands::Heartbeat { name, ip, port } => {
            let record = connect(config.as_deref()).await?.vps().register(&name, ip, port).await?;
            println!("{} at {} ({}s left)", name, record.endpoint(), record.left_secs);
        }
    }

    Ok(())
}

async fn connect(config: Option<&Path>) -> Result<Supervisor> {
    Supervisor::connect(load_settings(config)?).await
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Ok(Settings::load(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(Settings::load(DEFAULT_CONFIG)?),
        None => {
            info!("No {} found, using defaults", DEFAULT_CONFIG);
            Ok(Settings::default())
        }
    }
}

fn extract(template: &Path, page: &Path) -> Result<()> {
    let template: CrawlTemplate = load_toml(template)?;
    let html = std::fs::read_to_string(page)
        .with_context(|| format!("Cannot read {}", page.display()))?;

    for result in template.extract(&html)? {
        match result.kind {
            ResultKind::Empty => println!("{} (empty)", result.name),
            ResultKind::Content | ResultKind::Url => {
                println!("{} ({:?}):", result.name, result.kind);
                for value in result.values() {
                    println!("  {}", value);
                }
            }
        }
    }

    Ok(())
}
