//! quotagate: operator CLI for the quota gate.
//!
//! Reads DATABASE_URL and the RATE_LIMIT_* / QUOTA_* settings from the environment
//! (or a .env file). Every command prints JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use quotagate_cli::{init_tracing, parse_date};
use quotagate_core::{DatabaseConfig, QuotaConfig};
use quotagate_db::{connect, run_migrations, CounterStore, PgCounterStore};
use quotagate_services::QuotaGate;
use serde::Serialize;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quotagate", about = "Quota and concurrency admission control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Show a user's remaining daily quota
    Status {
        /// User identifier
        user: String,
        /// Caller has its own LLM key
        #[arg(long)]
        premium: bool,
    },
    /// Evaluate quota and concurrency for a user without recording anything
    Check {
        /// User identifier
        user: String,
        /// Task tree consumes LLM resources
        #[arg(long)]
        llm: bool,
        /// Caller has its own LLM key
        #[arg(long)]
        premium: bool,
    },
    /// Show global concurrency and the configured limits
    SystemStats,
    /// Check the daily request limits for a user and/or client IP
    Requests {
        /// User identifier
        #[arg(long)]
        user: Option<String>,
        /// Client IP address
        #[arg(long)]
        ip: Option<String>,
    },
    /// Atomically check the limits and start a task tree
    Admit {
        /// User identifier
        user: String,
        /// Task tree identifier (generated when omitted)
        tree: Option<String>,
        /// Task tree consumes LLM resources
        #[arg(long)]
        llm: bool,
        /// Caller has its own LLM key
        #[arg(long)]
        premium: bool,
    },
    /// Record the start of a task tree without checking limits
    Start {
        /// User identifier
        user: String,
        /// Task tree identifier
        tree: String,
        /// Task tree consumes LLM resources
        #[arg(long)]
        llm: bool,
    },
    /// Mark a task tree completed and release its concurrency slots
    Complete {
        /// Task tree identifier
        tree: String,
    },
    /// List active task trees
    Active {
        /// Only trees of this user
        #[arg(long)]
        user: Option<String>,
    },
    /// Daily usage statistics
    Stats {
        /// Day as YYYY-MM-DD (today when omitted)
        #[arg(long)]
        date: Option<String>,
        /// Include this user's count
        #[arg(long)]
        user: Option<String>,
    },
    /// Delete expired quota data
    Cleanup {
        /// Days to keep (QUOTA_RETENTION_DAYS when omitted)
        #[arg(long)]
        days: Option<i64>,
    },
    /// Rebuild concurrency counters from active task trees
    Reconcile,
    /// Run the periodic retention task until interrupted
    RunMaintenance,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize response")?;
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let db_config = DatabaseConfig::from_env().context("Failed to load database configuration")?;
    db_config.validate()?;
    let pool = connect(&db_config)
        .await
        .context("Failed to connect to database")?;

    if let Commands::Migrate = cli.command {
        run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
        return print_json(&serde_json::json!({ "migrated": true }));
    }

    let config = QuotaConfig::from_env().context("Failed to load quota configuration")?;
    config.validate()?;
    let retention_days = config.retention_days;

    let store: Arc<dyn CounterStore> = Arc::new(PgCounterStore::new(pool));
    let gate = QuotaGate::new(store.clone(), config);

    match cli.command {
        Commands::Migrate => {}
        Commands::Status { user, premium } => {
            print_json(&gate.get_status(&user, premium).await)?;
        }
        Commands::Check { user, llm, premium } => {
            print_json(&gate.evaluate(&user, llm, premium).await)?;
        }
        Commands::SystemStats => {
            print_json(&gate.system_stats().await)?;
        }
        Commands::Requests { user, ip } => {
            let result = gate
                .check_request_limit(user.as_deref(), ip.as_deref())
                .await;
            print_json(&result)?;
        }
        Commands::Admit {
            user,
            tree,
            llm,
            premium,
        } => {
            let tree = tree.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let outcome = gate.admit(&user, &tree, llm, premium).await?;
            print_json(&serde_json::json!({
                "task_tree_id": tree,
                "proceeds": outcome.proceeds(),
                "use_demo": outcome.use_demo(),
                "admission": outcome,
            }))?;
        }
        Commands::Start { user, tree, llm } => {
            gate.start(&user, &tree, llm).await?;
            print_json(&serde_json::json!({ "task_tree_id": tree, "started": true }))?;
        }
        Commands::Complete { tree } => {
            print_json(&gate.complete(&tree).await)?;
        }
        Commands::Active { user } => {
            let trees = store
                .list_active_task_trees(user.as_deref())
                .await
                .context("Failed to list active task trees")?;
            print_json(&trees)?;
        }
        Commands::Stats { date, user } => {
            let date = date.as_deref().map(parse_date).transpose()?;
            print_json(&gate.get_usage_stats(date, user.as_deref()).await)?;
        }
        Commands::Cleanup { days } => {
            let report = gate
                .retention()
                .run_with(days.unwrap_or(retention_days))
                .await
                .context("Retention pass failed")?;
            print_json(&report)?;
        }
        Commands::Reconcile => {
            let drifts = gate
                .retention()
                .reconcile()
                .await
                .context("Failed to reconcile concurrency counters")?;
            print_json(&drifts)?;
        }
        Commands::RunMaintenance => {
            tracing::info!(
                interval_secs = gate.config().cleanup_interval_secs,
                retention_days,
                "Starting retention task"
            );
            let handle = gate.retention().start();
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            handle.abort();
            tracing::info!("Retention task stopped");
        }
    }

    Ok(())
}
