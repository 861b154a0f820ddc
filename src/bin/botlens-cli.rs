use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use botlens::analysis::{open_log_file, CostOptions, NetlifyPlan};
use botlens::config::{AnalysisSettings, Config};
use botlens::orchestrator::{AnalyzeOptions, AnalyzeRequest, DataReference, Orchestrator, WindowQuery};
use botlens::storage::{self, MemoryClassificationCache, StorageHandles};

const INGEST_CHUNK: usize = 1000;

#[derive(Parser)]
#[command(name = "botlens-cli")]
#[command(about = "Bot traffic and bandwidth cost analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze traffic for a site and print the report as JSON
    Analyze {
        /// Site identifier
        site_id: String,
        /// Hosting provider (vercel, aws, netlify, cloudflare, ...)
        #[arg(long)]
        provider: String,
        /// Precomputed aggregates file
        #[arg(long)]
        aggregates: Option<PathBuf>,
        /// Normalized log file (JSON Lines or JSON array)
        #[arg(long)]
        log: Option<PathBuf>,
        /// Start of a stored-entry window (RFC 3339)
        #[arg(long, requires = "to")]
        from: Option<DateTime<Utc>>,
        /// End of a stored-entry window (RFC 3339)
        #[arg(long, requires = "from")]
        to: Option<DateTime<Utc>>,
        /// Billing window length in days
        #[arg(long)]
        window_days: Option<f64>,
        #[arg(long)]
        aws_region: Option<String>,
        /// Ignore the AWS free tier
        #[arg(long)]
        no_aws_free_tier: bool,
        /// Netlify plan (personal, pro, legacy)
        #[arg(long)]
        netlify_plan: Option<String>,
        #[arg(long)]
        cloudflare_argo: bool,
        /// Skip the external bulk classifier
        #[arg(long)]
        offline: bool,
        /// Skip disambiguation of unresolved agents
        #[arg(long)]
        no_disambiguate: bool,
        /// Let the verdict model call tools
        #[arg(long)]
        tools: bool,
        /// Analyze without a database (no window queries, nothing persisted)
        #[arg(long)]
        no_store: bool,
    },
    /// Load a normalized log file into the entry store
    Ingest {
        site_id: String,
        file: PathBuf,
    },
    /// Stored reports
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// Classification cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Print a report by id
    Show { report_id: String },
    /// Print the most recent report for a site
    Latest { site_id: String },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Most recently updated classifications
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Analyze {
            site_id,
            provider,
            aggregates,
            log,
            from,
            to,
            window_days,
            aws_region,
            no_aws_free_tier,
            netlify_plan,
            cloudflare_argo,
            offline,
            no_disambiguate,
            tools,
            no_store,
        } => {
            let query = match (from, to) {
                (Some(start), Some(end)) if start <= end => Some(WindowQuery { start, end }),
                (Some(_), Some(_)) => bail!("--from must not be after --to"),
                _ => None,
            };
            if aggregates.is_none() && log.is_none() && query.is_none() {
                bail!("one of --aggregates, --log or --from/--to is required");
            }

            let netlify_plan = netlify_plan
                .map(|plan| parse_netlify_plan(&plan))
                .transpose()?;

            let settings =
                AnalysisSettings::load(config.analysis_config.as_deref().map(Path::new))?;

            let orchestrator = if no_store {
                Orchestrator::from_settings(&settings, Some(Arc::new(MemoryClassificationCache::new())))
                    .await?
            } else {
                let handles = storage::connect(&config).await?;
                Orchestrator::from_settings(&settings, Some(Arc::clone(&handles.cache)))
                    .await?
                    .with_entry_store(handles.entries)
                    .with_report_sink(handles.reports)
            };

            let request = AnalyzeRequest {
                site_id,
                provider,
                data: DataReference {
                    aggregates_path: aggregates,
                    query,
                    log_path: log,
                },
                window_days,
                options: AnalyzeOptions {
                    cost: CostOptions {
                        aws_region,
                        aws_free_tier: !no_aws_free_tier,
                        netlify_plan,
                        cloudflare_argo,
                    },
                    use_external_classifier: !offline,
                    disambiguate: !no_disambiguate,
                    use_tools: tools.then_some(true),
                },
            };

            let report = orchestrator.analyze(&request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.is_degraded() {
                eprintln!("⚠ Report is degraded:");
                for note in &report.notes {
                    eprintln!("  - {}", note);
                }
            }
        }
        Commands::Ingest { site_id, file } => {
            let handles = storage::connect(&config).await?;
            let inserted = ingest(&handles, &site_id, &file).await?;
            println!("✓ Ingested {} entries for site '{}'", inserted.0, site_id);
            if inserted.1 > 0 {
                println!("⚠ Skipped {} malformed lines", inserted.1);
            }
        }
        Commands::Report { command } => {
            let handles = storage::connect(&config).await?;
            let report = match &command {
                ReportCommands::Show { report_id } => handles.reports.get_report(report_id).await?,
                ReportCommands::Latest { site_id } => handles.reports.latest_report(site_id).await?,
            };
            match report {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => match command {
                    ReportCommands::Show { report_id } => println!("No report with id '{}'", report_id),
                    ReportCommands::Latest { site_id } => println!("No reports for site '{}'", site_id),
                },
            }
        }
        Commands::Cache {
            command: CacheCommands::List { limit },
        } => {
            let handles = storage::connect(&config).await?;
            let entries = handles.cache.list_recent(limit).await?;
            if entries.is_empty() {
                println!("Classification cache is empty.");
            } else {
                println!("{:<6} {:<16} {:<24} {:<6} {:<16} {}", "Bot", "Type", "Name", "Conf", "Source", "User agent");
                println!("{}", "-".repeat(100));
                for (user_agent, cached) in entries {
                    let verdict = &cached.verdict;
                    println!(
                        "{:<6} {:<16} {:<24} {:<6.2} {:<16} {}",
                        if verdict.is_bot { "yes" } else { "no" },
                        verdict.bot_type.as_deref().unwrap_or("-"),
                        verdict.bot_name.as_deref().unwrap_or("-"),
                        verdict.confidence,
                        cached.source.as_str(),
                        user_agent
                    );
                }
            }
        }
    }

    Ok(())
}

fn parse_netlify_plan(plan: &str) -> Result<NetlifyPlan> {
    serde_json::from_value(serde_json::Value::String(plan.to_lowercase()))
        .with_context(|| format!("unknown Netlify plan '{}'", plan))
}

/// Stream a log file into the entry store in chunks; returns (inserted, skipped)
async fn ingest(handles: &StorageHandles, site_id: &str, file: &Path) -> Result<(u64, u64)> {
    let log = open_log_file(file).await?;
    let skipped = Arc::clone(&log.skipped);
    let mut entries = log.entries;
    let mut chunk = Vec::with_capacity(INGEST_CHUNK);
    let mut inserted = 0;

    while let Some(entry) = entries.next().await {
        chunk.push(entry?);
        if chunk.len() == INGEST_CHUNK {
            inserted += handles.entries.insert_entries(site_id, &chunk).await?;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        inserted += handles.entries.insert_entries(site_id, &chunk).await?;
    }

    Ok((inserted, skipped.load(std::sync::atomic::Ordering::Relaxed)))
}
