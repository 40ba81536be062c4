use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod badges;
mod calendar;
mod config;
mod db;
mod engine;
mod error;
mod focus;
mod leveling;
#[cfg(test)]
mod memory;
mod missions;
mod models;
mod ranking;
mod report;
mod store;
mod streak;

use crate::db::PgStore;
use crate::engine::{Collaborators, ProgressionEngine};
use crate::missions::{MissionEvent, MissionEventData};
use crate::models::{MissionProgress, RankPeriod};
use crate::store::SystemClock;

#[derive(Parser)]
#[command(name = "progression-engine")]
#[command(about = "XP, levels, badges, streaks and missions for Group Scholar classes", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults to ./progression.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load students, a class, and the badge and mission catalogs
    Seed,
    /// Import historical XP grants from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Grant XP to a user
    Award {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        xp: i64,
        #[arg(long)]
        source: String,
        /// JSON object stored with the ledger entry
        #[arg(long)]
        meta: Option<String>,
    },
    /// Show a user's progression profile
    Profile {
        #[arg(long)]
        user: Uuid,
    },
    /// List a user's ledger entries
    History {
        #[arg(long)]
        user: Uuid,
    },
    /// Rebuild a cached profile from the ledger
    Reconcile {
        #[arg(long)]
        user: Uuid,
    },
    /// Record today's activity for the daily streak
    Streak {
        #[arg(long)]
        user: Uuid,
    },
    /// Feed an event into the user's missions
    Track {
        #[arg(long)]
        user: Uuid,
        #[arg(long, value_parser = parse_event)]
        event: MissionEvent,
        /// JSON event context, e.g. {"minutes": 25}
        #[arg(long)]
        data: Option<String>,
    },
    /// Merge an explicit progress patch into a mission
    Progress {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        mission: String,
        /// JSON progress patch, e.g. {"submissions": 2}
        #[arg(long)]
        patch: String,
    },
    /// List the user's current missions
    Missions {
        #[arg(long)]
        user: Uuid,
    },
    /// Start a focus session
    FocusStart {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value = "pomodoro25")]
        technique: String,
    },
    /// End a focus session and collect its XP
    FocusEnd {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        session: Uuid,
    },
    /// Discard an unfinished focus session
    FocusCancel {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        session: Uuid,
    },
    /// Focus totals and today's remaining focus XP
    FocusStats {
        #[arg(long)]
        user: Uuid,
    },
    /// Class ranking for the current day or week
    Ranking {
        #[arg(long)]
        class: Uuid,
        #[arg(long, default_value = "weekly", value_parser = parse_period)]
        period: RankPeriod,
    },
    /// Write a markdown ranking report
    Report {
        #[arg(long)]
        class: Uuid,
        #[arg(long, default_value = "weekly", value_parser = parse_period)]
        period: RankPeriod,
        #[arg(long)]
        label: Option<String>,
        #[arg(long, default_value_t = 10)]
        top: usize,
        #[arg(long, default_value = "ranking.md")]
        out: PathBuf,
    },
}

fn parse_event(value: &str) -> Result<MissionEvent, String> {
    MissionEvent::parse(value).ok_or_else(|| format!("unknown mission event '{value}'"))
}

fn parse_period(value: &str) -> Result<RankPeriod, String> {
    RankPeriod::parse(value).ok_or_else(|| format!("period must be daily or weekly, got '{value}'"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let deps = Collaborators::from_store(store, Arc::new(SystemClock));
    let engine = ProgressionEngine::new(config, deps);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted (class {}).", db::SEED_CLASS_ID);
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&engine, &csv).await?;
            println!("Inserted {inserted} ledger entries from {}.", csv.display());
        }
        Commands::Award {
            user,
            xp,
            source,
            meta,
        } => {
            let meta = meta
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--meta must be valid JSON")?;
            let outcome = engine.award_xp(user, xp, &source, meta).await?;
            print_json(&outcome)?;
        }
        Commands::Profile { user } => {
            print_json(&engine.get_profile(user).await?)?;
        }
        Commands::History { user } => {
            let entries = engine.xp_history(user).await?;
            if entries.is_empty() {
                println!("No XP recorded for {user}.");
                return Ok(());
            }
            for entry in &entries {
                println!(
                    "- {} {:>5} XP  {}",
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.xp,
                    entry.source
                );
            }
        }
        Commands::Reconcile { user } => {
            print_json(&engine.reconcile(user).await?)?;
        }
        Commands::Streak { user } => {
            print_json(&engine.update_streak(user).await?)?;
        }
        Commands::Track { user, event, data } => {
            let data: MissionEventData = match data {
                Some(raw) => serde_json::from_str(&raw).context("--data must be valid JSON")?,
                None => MissionEventData::default(),
            };
            let outcomes = engine.track_mission_event(user, event, &data).await?;
            if outcomes.is_empty() {
                println!("No active missions track '{event}'.");
                return Ok(());
            }
            print_json(&outcomes)?;
        }
        Commands::Progress {
            user,
            mission,
            patch,
        } => {
            let patch: MissionProgress =
                serde_json::from_str(&patch).context("--patch must be valid JSON")?;
            print_json(&engine.update_mission_progress(user, &mission, &patch).await?)?;
        }
        Commands::Missions { user } => {
            print_json(&engine.list_missions(user).await?)?;
        }
        Commands::FocusStart { user, technique } => {
            if let Some(active) = engine.active_focus_session(user).await? {
                println!(
                    "Session {} ({}) is still running since {}.",
                    active.id, active.technique, active.started_at
                );
            }
            print_json(&engine.start_focus_session(user, &technique).await?)?;
        }
        Commands::FocusEnd { user, session } => {
            print_json(&engine.end_focus_session(session, user).await?)?;
        }
        Commands::FocusCancel { user, session } => {
            if engine.cancel_focus_session(session, user).await? {
                println!("Session {session} cancelled.");
            } else {
                println!("No unfinished session {session} for this user.");
            }
        }
        Commands::FocusStats { user } => {
            print_json(&engine.focus_stats(user).await?)?;
        }
        Commands::Ranking { class, period } => {
            print_json(&engine.class_ranking(class, period).await?)?;
        }
        Commands::Report {
            class,
            period,
            label,
            top,
            out,
        } => {
            let snapshot = engine.class_ranking(class, period).await?;
            let label = label.unwrap_or_else(|| class.to_string());
            let report = report::build_report(&label, &snapshot, top);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
