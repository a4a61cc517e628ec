use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ladder_adapters::extractor_for_source;
use ladder_core::UserProfile;
use ladder_mentor::{GeminiClient, Mentor};
use ladder_sync::{NotAuthorized, ScrapeConfig, SummaryReport};
use tracing::error;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "ladder-cli")]
#[command(about = "Opportunity Ladder ingestion job")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape pass over every enabled source (the default).
    Scrape,
    /// Run a scrape on behalf of an admin.
    Trigger {
        email: String,
        /// Scrape only this page instead of the registry.
        #[arg(long)]
        url: Option<String>,
    },
    /// List the source registry.
    Sources {
        #[arg(long, env = "LADDER_SOURCES", default_value = "sources.yaml")]
        path: PathBuf,
    },
    /// Ask the mentor a question.
    Advise {
        message: String,
        #[arg(long)]
        major: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| "info,html5ever=error,selectors=error".into()),
        )
        .init();
}

fn print_summary(report: &SummaryReport) {
    println!(
        "scrape complete: run_id={} sites={} found={} saved={} failed={}",
        report.run_id,
        report.sites.len(),
        report.total_extracted(),
        report.total_written(),
        report.failed().count()
    );
}

fn load_config() -> Option<ScrapeConfig> {
    match ScrapeConfig::from_env() {
        Ok(config) => Some(config),
        Err(err) => {
            eprintln!("configuration error: {err}");
            None
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Scrape => {
            let Some(config) = load_config() else {
                return Ok(ExitCode::FAILURE);
            };
            print_summary(&ladder_sync::run_scrape(&config).await?);
        }
        Commands::Trigger { email, url } => {
            let Some(config) = load_config() else {
                return Ok(ExitCode::FAILURE);
            };
            match ladder_sync::trigger_scrape(&config, &email, url.as_deref()).await {
                Ok(report) => print_summary(&report),
                Err(err) if err.downcast_ref::<NotAuthorized>().is_some() => {
                    eprintln!("{err}");
                    return Ok(ExitCode::FAILURE);
                }
                Err(err) => return Err(err),
            }
        }
        Commands::Sources { path } => {
            let registry = ladder_sync::load_source_registry(&path).await?;
            for source in &registry.sources {
                let state = match (source.enabled, extractor_for_source(&source.source_id).is_some()) {
                    (true, true) => "enabled",
                    (false, _) => "disabled",
                    (true, false) => "no extractor",
                };
                println!(
                    "{:<10} {:<12} {:<13} {}",
                    source.source_id, source.display_name, state, source.listing_url
                );
            }
        }
        Commands::Advise { message, major } => {
            let client = match GeminiClient::from_env() {
                Ok(client) => client,
                Err(err) => {
                    eprintln!("mentor unavailable: {err}");
                    return Ok(ExitCode::FAILURE);
                }
            };
            let mut profile = UserProfile::guest();
            if major.is_some() {
                profile.major = major;
            }
            println!("{}", Mentor::new(client).academic_advice(&profile, &message).await);
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli.command.unwrap_or(Commands::Scrape)).await {
        Ok(code) => code,
        Err(err) => {
            error!("ladder-cli failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
