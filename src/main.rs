use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod coach;
mod db;
mod journal;
mod models;
mod poller;
mod report;
mod risk;
mod source;
mod synthetic;
#[cfg(test)]
mod test_support;

use crate::coach::{ChatMessage, CoachBridge, UserProfile};
use crate::journal::{FileStore, KvStore, SymptomJournal};
use crate::models::{DataOrigin, MetricsSnapshot, NewSymptom, Severity};
use crate::poller::{PollState, PollingController};
use crate::risk::{Aggregator, ScoringConfig};
use crate::source::{FallbackPolicy, MetricsSource, RemoteSource, SourceConfig};
use crate::synthetic::SyntheticSource;

#[derive(Parser)]
#[command(name = "ecobreath")]
#[command(about = "Environmental health monitor with risk scoring and a symptom journal", long_about = None)]
struct Cli {
    /// Base URL of the metrics backend
    #[arg(long, env = "ECOBREATH_API_URL", default_value = source::DEFAULT_BASE_URL, global = true)]
    api_url: String,
    /// Directory holding the local symptom journal
    #[arg(long, env = "ECOBREATH_JOURNAL_DIR", default_value = ".ecobreath", global = true)]
    journal_dir: PathBuf,
    /// Store the journal in Postgres instead of the journal directory
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,
    /// Report backend failures instead of substituting synthetic data
    #[arg(long, global = true)]
    strict: bool,
    /// Skip the backend entirely and serve synthetic data
    #[arg(long, global = true, conflicts_with = "strict")]
    demo: bool,
    /// Seed for synthetic readings
    #[arg(long, global = true)]
    seed: Option<u64>,
    #[command(flatten)]
    scoring: ScoringArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Risk thresholds applied to locally scored readings
#[derive(Args)]
struct ScoringArgs {
    /// Temperature (°C) at which heat risk becomes moderate
    #[arg(long, env = "ECOBREATH_HEAT_MEDIUM", global = true)]
    heat_medium: Option<f64>,
    /// Temperature (°C) at which heat risk becomes high
    #[arg(long, env = "ECOBREATH_HEAT_HIGH", global = true)]
    heat_high: Option<f64>,
    /// AQI at which air risk becomes moderate
    #[arg(long, env = "ECOBREATH_AIR_MEDIUM", global = true)]
    air_medium: Option<f64>,
    /// AQI at which air risk becomes high
    #[arg(long, env = "ECOBREATH_AIR_HIGH", global = true)]
    air_high: Option<f64>,
}

impl ScoringArgs {
    fn config(&self) -> anyhow::Result<ScoringConfig> {
        let defaults = ScoringConfig::default();
        let config = ScoringConfig {
            heat_medium: self.heat_medium.unwrap_or(defaults.heat_medium),
            heat_high: self.heat_high.unwrap_or(defaults.heat_high),
            air_medium: self.air_medium.unwrap_or(defaults.air_medium),
            air_high: self.air_high.unwrap_or(defaults.air_high),
            ..defaults
        };

        anyhow::ensure!(
            config.heat_medium <= config.heat_high,
            "--heat-medium ({}) must not exceed --heat-high ({})",
            config.heat_medium,
            config.heat_high
        );
        anyhow::ensure!(
            config.air_medium <= config.air_high,
            "--air-medium ({}) must not exceed --air-high ({})",
            config.air_medium,
            config.air_high
        );
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the Postgres journal schema
    InitDb,
    /// Fetch the latest metrics snapshot
    Latest,
    /// Fetch recent history, oldest first
    History {
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Poll metrics on an interval and print every update; press Enter to refresh now
    Watch {
        #[arg(long, default_value_t = poller::DEFAULT_POLL_INTERVAL.as_millis() as u64)]
        interval_ms: u64,
        /// Stop after this many updates
        #[arg(long)]
        ticks: Option<usize>,
    },
    /// Record a symptom locally and mirror it to the backend diary
    LogSymptom {
        #[arg(long)]
        symptom: String,
        #[arg(long, value_enum, default_value_t = Severity::Mild)]
        severity: Severity,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List logged symptoms, newest first
    Symptoms {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete every logged symptom
    ClearSymptoms,
    /// Chat with the AI health coach
    Coach {
        /// Ask a single question instead of starting an interactive session
        #[arg(long)]
        message: Option<String>,
        #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        #[arg(long, env = "GEMINI_BASE_URL", default_value = coach::GEMINI_ENDPOINT)]
        gemini_url: String,
        #[arg(long, env = "ECOBREATH_USER_NAME", default_value = "User")]
        user_name: String,
        #[arg(long, env = "ECOBREATH_FOCUS", default_value = "respiratory health")]
        focus: String,
    },
    /// Generate a markdown dashboard report
    Report {
        #[arg(long, default_value = "dashboard.md")]
        out: PathBuf,
    },
}

struct Services {
    remote: Option<RemoteSource>,
    synthetic: SyntheticSource,
}

impl Services {
    fn build(cli: &Cli) -> anyhow::Result<Self> {
        let aggregator = Aggregator::new(cli.scoring.config()?);
        let config = SourceConfig {
            base_url: cli.api_url.clone(),
            policy: if cli.strict {
                FallbackPolicy::Surface
            } else {
                FallbackPolicy::Synthetic
            },
            ..SourceConfig::default()
        };

        let remote = if cli.demo {
            None
        } else {
            Some(
                RemoteSource::new(&config, synthetic_source(cli, &aggregator, Duration::ZERO))
                    .context("failed to build metrics client")?,
            )
        };

        Ok(Self {
            remote,
            synthetic: synthetic_source(cli, &aggregator, config.synthetic_delay),
        })
    }

    fn metrics(self) -> Arc<dyn MetricsSource> {
        match self.remote {
            Some(remote) => Arc::new(remote),
            None => Arc::new(self.synthetic),
        }
    }

    fn metrics_ref(&self) -> &dyn MetricsSource {
        match &self.remote {
            Some(remote) => remote,
            None => &self.synthetic,
        }
    }
}

fn synthetic_source(cli: &Cli, aggregator: &Aggregator, delay: Duration) -> SyntheticSource {
    match cli.seed {
        Some(seed) => SyntheticSource::seeded(aggregator.clone(), delay, seed),
        None => SyntheticSource::new(aggregator.clone(), delay),
    }
}

async fn open_journal(cli: &Cli) -> anyhow::Result<SymptomJournal> {
    let store: Arc<dyn KvStore> = match cli.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            Arc::new(db::PgStore::new(pool))
        }
        None => Arc::new(FileStore::new(cli.journal_dir.clone())),
    };
    Ok(SymptomJournal::new(store))
}

fn origin_tag(origin: DataOrigin) -> &'static str {
    match origin {
        DataOrigin::Live => "",
        DataOrigin::Synthetic => " [demo data]",
    }
}

fn print_snapshot(snapshot: &MetricsSnapshot) {
    println!(
        "{} | {:.1}°C {:.0}% AQI {:.0} | heat {} air {} overall {} | score {}{}",
        snapshot.timestamp.format("%H:%M:%S"),
        snapshot.temperature,
        snapshot.humidity,
        snapshot.air_quality,
        snapshot.heat_risk,
        snapshot.air_risk,
        snapshot.overall_risk,
        snapshot.health_score,
        origin_tag(snapshot.origin)
    );
    println!("  {}", snapshot.recommendation);
}

fn print_poll_state(state: &PollState) {
    if let Some(snapshot) = &state.snapshot {
        print_snapshot(snapshot);
    }
    if let Some(error) = &state.error {
        println!("  last fetch failed: {error}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::InitDb => {
            let url = cli
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to initialise the journal schema")?;
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Latest => {
            let services = Services::build(&cli)?;
            let snapshot = services.metrics_ref().fetch_latest().await?;
            print_snapshot(&snapshot);
        }
        Commands::History { csv } => {
            let services = Services::build(&cli)?;
            let history = services.metrics_ref().fetch_history().await?;

            if history.points.is_empty() {
                println!("No history available.");
            } else {
                println!("History{}:", origin_tag(history.origin));
                for point in history.points.iter() {
                    println!(
                        "- {} {:.1}°C {:.0}% AQI {:.0}",
                        point.timestamp, point.temperature, point.humidity, point.air_quality
                    );
                }
            }

            if let Some(path) = csv {
                report::write_history_csv(path, &history.points)?;
                println!("History written to {}.", path.display());
            }
        }
        Commands::Watch { interval_ms, ticks } => {
            let source = Services::build(&cli)?.metrics();
            let controller = PollingController::spawn(source, Duration::from_millis(*interval_ms));
            let mut updates = controller.subscribe();
            let mut input = BufReader::new(tokio::io::stdin()).lines();
            let mut input_open = true;
            let mut seen = 0usize;

            while !ticks.is_some_and(|limit| seen >= limit) {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    line = input.next_line(), if input_open => {
                        match line {
                            Ok(Some(_)) => controller.refetch().await,
                            Ok(None) => input_open = false,
                            Err(err) => {
                                tracing::warn!(error = %err, "stdin closed, refresh on Enter disabled");
                                input_open = false;
                            }
                        }
                        continue;
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }

                print_poll_state(&updates.borrow_and_update());
                seen += 1;
            }

            controller.stop();
        }
        Commands::LogSymptom {
            symptom,
            severity,
            notes,
        } => {
            let symptom = symptom.trim();
            anyhow::ensure!(!symptom.is_empty(), "symptom must not be empty");
            let notes = notes
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty());

            let services = Services::build(&cli)?;
            let posted = match &services.remote {
                Some(remote) => remote.post_log(symptom, *severity, notes).await,
                None => false,
            };

            let journal = open_journal(&cli).await?;
            let log = journal
                .add_log(NewSymptom {
                    symptom: symptom.to_string(),
                    severity: *severity,
                    notes: notes.map(str::to_string),
                })
                .await?;

            println!("Logged {} ({}) as {}.", log.symptom, log.severity, log.id);
            if !posted {
                println!("Backend diary not updated; the entry is kept locally.");
            }
        }
        Commands::Symptoms { limit } => {
            let journal = open_journal(&cli).await?;
            let logs = journal.recent(*limit).await;

            if logs.is_empty() {
                println!("No symptoms logged yet.");
                return Ok(());
            }

            for log in logs.iter() {
                print!(
                    "- {} {} ({})",
                    log.timestamp.format("%Y-%m-%d %H:%M"),
                    log.symptom,
                    log.severity
                );
                match &log.notes {
                    Some(notes) => println!(": {notes}"),
                    None => println!(),
                }
            }
        }
        Commands::ClearSymptoms => {
            open_journal(&cli).await?.clear_logs().await?;
            println!("Symptom journal cleared.");
        }
        Commands::Coach {
            message,
            api_key,
            gemini_url,
            user_name,
            focus,
        } => {
            let profile = UserProfile {
                name: user_name.clone(),
                focus: focus.clone(),
            };
            let bridge = CoachBridge::from_api_key(api_key.as_deref(), gemini_url, profile)
                .context("failed to build coach client")?;
            let services = Services::build(&cli)?;
            let journal = open_journal(&cli).await?;

            if let Some(message) = message {
                let metrics = services.metrics_ref().fetch_latest().await.ok();
                let symptoms = journal.recent(3).await;
                let reply = bridge.respond(message, &[], metrics.as_ref(), &symptoms).await;
                println!("{reply}");
                return Ok(());
            }

            if !bridge.has_generator() {
                tracing::warn!("GEMINI_API_KEY is not set; the coach cannot answer");
            }
            println!("Coach ready. Type a message, or an empty line to quit.");
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut history: Vec<ChatMessage> = Vec::new();

            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    break;
                }

                let metrics = services.metrics_ref().fetch_latest().await.ok();
                let symptoms = journal.recent(3).await;
                let reply = bridge.respond(line, &history, metrics.as_ref(), &symptoms).await;
                println!("{reply}\n");

                history.push(ChatMessage::user(line));
                history.push(ChatMessage::model(reply));
            }
        }
        Commands::Report { out } => {
            let services = Services::build(&cli)?;
            let snapshot = services.metrics_ref().fetch_latest().await?;
            let history = services.metrics_ref().fetch_history().await?;
            let symptoms = open_journal(&cli).await?.get_logs().await;

            let report = report::build_report(&snapshot, &history, &symptoms);
            std::fs::write(out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
