mod config;
mod loader;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "channel-ingest", about = "YouTube channel metadata ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape the channel and store any videos not seen before
    Ingest {
        /// Channel URL (overrides scraper.channel_url)
        #[arg(short, long, env = "CHANNEL_URL")]
        url: Option<String>,

        /// Stop after this many playlist items
        #[arg(long)]
        max_items: Option<u64>,

        /// Only videos uploaded after this date (YYYYMMDD); disables the automatic cutoff
        #[arg(long)]
        date_after: Option<String>,

        /// Print the run statistics as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Show database statistics
    Stats,

    /// Apply schema migrations without ingesting
    Migrate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "channel_ingest=info,warn",
        1 => "channel_ingest=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load()?;

    match cli.command {
        Command::Ingest { url, max_items, date_after, json } => {
            let config = config.with_overrides(url, max_items, date_after);
            let stats = Pipeline::new(config).run().await?;
            if json {
                println!("{}", serde_json::to_string(&stats)?);
            }
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path)?;
            repo.run_migrations()?;
            let channels = repo.channel_count()?;
            let videos = repo.video_count()?;
            let (min, max) = repo.upload_date_range().unwrap_or((None, None));
            let last = repo.last_run()?;
            println!("─────────────────────────────────");
            println!("  Channel ingest — Database Stats");
            println!("─────────────────────────────────");
            println!("  Channels : {}", utils::fmt_number(channels));
            println!("  Videos   : {}", utils::fmt_number(videos));
            println!("  From     : {}", min.unwrap_or("—".into()));
            println!("  To       : {}", max.unwrap_or("—".into()));
            match last {
                Some(run) => {
                    println!("  Last run : #{} {} ({})", run.id, run.status, run.channel_url);
                    println!("  Started  : {}", run.started_at);
                    if let Some(finished) = run.finished_at {
                        println!("  Finished : {}", finished);
                    }
                    println!(
                        "  Counts   : {} parsed, {} inserted, {} skipped, {} invalid",
                        run.stats.parsed, run.stats.inserted, run.stats.skipped_existing, run.stats.invalid
                    );
                    if let Some(msg) = run.error_msg {
                        println!("  Error    : {}", msg);
                    }
                }
                None => println!("  Last run : —"),
            }
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
