use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use grantscout_core::{news, RunConfig, RunProfile, RunStatus, Source};
use grantscout_workflow::Services;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "grantscout")]
#[command(about = "Funding opportunity discovery workflow")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API.
    Serve,
    /// Run one discovery workflow in the foreground and print the final run.
    Run(RunArgs),
    /// Inspect the keyword store.
    #[command(subcommand)]
    Keywords(KeywordCommands),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// grants (government funding APIs) or news (critical minerals coverage).
    #[arg(long, default_value = "grants")]
    profile: RunProfile,
    /// Comma-separated sources; the profile's full set when omitted.
    #[arg(long, value_delimiter = ',')]
    sources: Vec<Source>,
    /// Free-text search passed to every source.
    #[arg(long, conflicts_with_all = ["preset", "minerals"])]
    query: Option<String>,
    /// Named news query preset, e.g. lithium or geopolitics.
    #[arg(long, conflicts_with = "minerals")]
    preset: Option<String>,
    /// Comma-separated minerals to build the search query from.
    #[arg(long, value_delimiter = ',')]
    minerals: Vec<String>,
    #[arg(long)]
    days_back: Option<u32>,
    /// Comma-separated keyword domains; all domains when omitted.
    #[arg(long, value_delimiter = ',')]
    domains: Vec<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    per_source_limit: Option<usize>,
    #[arg(long)]
    no_report: bool,
    #[arg(long)]
    no_db: bool,
    #[arg(long)]
    no_convert: bool,
}

#[derive(Debug, Subcommand)]
enum KeywordCommands {
    /// Print every domain with its keywords.
    List,
    Search {
        query: String,
        #[arg(long)]
        domain: Option<String>,
    },
    Negative,
}

impl RunArgs {
    fn search_query(&self) -> Result<Option<String>> {
        if let Some(query) = &self.query {
            return Ok(Some(query.clone()));
        }
        if let Some(name) = &self.preset {
            let Some(preset) = news::preset(name) else {
                bail!("unknown preset `{name}`");
            };
            return Ok(Some(preset.query.to_string()));
        }
        Ok((!self.minerals.is_empty()).then(|| news::minerals_query(&self.minerals)))
    }

    fn into_run_config(self, default_days_back: u32) -> Result<RunConfig> {
        let query = self.search_query()?;
        let sources = if self.sources.is_empty() {
            self.profile.default_sources()
        } else {
            self.sources
        };
        Ok(RunConfig {
            sources,
            days_back: self.days_back.unwrap_or(default_days_back),
            domains: (!self.domains.is_empty()).then_some(self.domains),
            generate_report: !self.no_report,
            save_to_db: !self.no_db,
            convert_report: !self.no_convert,
            batch_size: self.batch_size,
            per_source_limit: self.per_source_limit,
            profile: self.profile,
            query,
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("GRANTSCOUT_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let services = Services::from_env().await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => grantscout_web::serve(services).await?,
        Commands::Run(args) => {
            let config = args.into_run_config(services.config.default_days_back)?;
            let run = services.workflows.start(config)?;
            info!(run_id = %run.id, "workflow started");
            let Some(finished) = services.workflows.wait_for(&run.id, POLL_INTERVAL).await else {
                bail!("workflow {} disappeared from the registry", run.id);
            };
            println!("{}", serde_json::to_string_pretty(&finished)?);
            if finished.status != RunStatus::Completed {
                bail!(
                    "workflow {} ended {}: {}",
                    finished.id,
                    finished.status,
                    finished.error.as_deref().unwrap_or("no error recorded")
                );
            }
        }
        Commands::Keywords(KeywordCommands::List) => {
            println!("{}", serde_json::to_string_pretty(&services.keywords.overview().await?)?);
        }
        Commands::Keywords(KeywordCommands::Search { query, domain }) => {
            let hits = services.keywords.search(&query, domain.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        Commands::Keywords(KeywordCommands::Negative) => {
            println!("{}", serde_json::to_string_pretty(&services.keywords.get_negative().await?)?);
        }
    }

    Ok(())
}
