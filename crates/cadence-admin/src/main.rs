//! cadence-admin - administrator CLI over the progress engine.
//!
//! Reads the same databases as the engine. Plans are supplied on the command
//! line because the subscription system lives outside the engine.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use cadence_core::entitlements::FeatureOverride;
use cadence_core::{
    Actor, BackgroundRuntime, EngineConfig, EvaluateOptions, Feature, Plan, ProgressEngine,
    StaticPlanProvider, TierContext,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence-admin")]
#[command(about = "Inspect and administer cadence learner progress")]
struct Cli {
    /// Engine configuration file (.toml, .json or .yaml)
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite file used as this tool's local tier; overrides the config
    #[arg(long)]
    local_db: Option<PathBuf>,

    /// Administrator identity recorded in the audit log
    #[arg(long, env = "CADENCE_ADMIN_ID", default_value = "admin")]
    admin: String,

    #[command(subcommand)]
    command: Command,
}

/// Whose account a command acts on.
#[derive(Args, Clone)]
struct UserArgs {
    /// User id
    #[arg(short, long)]
    user: String,

    /// The user's plan
    #[arg(short, long, default_value = "free")]
    plan: Plan,

    /// The user's UTC offset in seconds
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    utc_offset: i32,
}

impl UserArgs {
    fn context(&self) -> TierContext {
        TierContext::new(&self.user, self.plan, self.utc_offset)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate an entitlement as of another instant, without auditing it
    Simulate {
        #[command(flatten)]
        user: UserArgs,
        #[arg(short, long)]
        feature: Feature,
        /// RFC 3339 instant to evaluate at
        #[arg(long)]
        at: DateTime<Utc>,
    },
    /// Evaluate an entitlement now (audited)
    Evaluate {
        #[command(flatten)]
        user: UserArgs,
        #[arg(short, long)]
        feature: Feature,
    },
    /// Set or clear an entitlement override: grant, revoke, limit:<n> or clear
    Override {
        #[command(flatten)]
        user: UserArgs,
        #[arg(short, long)]
        feature: Feature,
        value: OverrideArg,
    },
    /// List every entitlement override set for a user
    Overrides {
        #[arg(short, long)]
        user: String,
    },
    /// Show the most recent audit entries for a user
    Audit {
        #[command(flatten)]
        user: UserArgs,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show streak state and risk, optionally recording activity first
    Streak {
        #[command(flatten)]
        user: UserArgs,
        /// Mark this date (YYYY-MM-DD) active before reporting
        #[arg(long)]
        record: Option<NaiveDate>,
    },
    /// Show due items
    Due {
        #[command(flatten)]
        user: UserArgs,
        #[arg(long, default_value_t = 7)]
        horizon_days: i64,
    },
    /// Show lifetime session statistics
    Stats {
        #[command(flatten)]
        user: UserArgs,
    },
    /// Copy a premium user's local history to the remote tier
    Migrate {
        #[command(flatten)]
        user: UserArgs,
    },
    /// Push every pending remote write once
    Reconcile,
    /// Run periodic reconciliation until interrupted
    Serve,
}

/// Override value as typed on the command line.
#[derive(Clone, Copy, Debug)]
struct OverrideArg(Option<FeatureOverride>);

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(Self(Some(FeatureOverride::Grant))),
            "revoke" => Ok(Self(Some(FeatureOverride::Revoke))),
            "clear" => Ok(Self(None)),
            other => match other.strip_prefix("limit:") {
                Some(n) => n
                    .parse()
                    .map(|n| Self(Some(FeatureOverride::Limit(n))))
                    .map_err(|e| format!("invalid limit '{}': {}", n, e)),
                None => Err(format!(
                    "expected grant, revoke, limit:<n> or clear, got '{}'",
                    other
                )),
            },
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(path) = &cli.local_db {
        config.local_db_path = Some(path.clone());
    }
    if config.local_db_path.is_none() {
        warn!("No local tier database configured, local progress is not shared with other runs");
    }
    let plans = Arc::new(StaticPlanProvider::new(0));
    let engine = Arc::new(ProgressEngine::builder(config, plans.clone()).build()?);
    let admin = Actor::Admin(cli.admin.clone());

    match cli.command {
        Command::Simulate { user, feature, at } => {
            plans.set(user.context())?;
            let mut opts = EvaluateOptions::simulation(&cli.admin, at);
            opts.actor = admin;
            let decision = engine.evaluate_entitlement(&user.user, feature, &opts).await?;
            print_json(&decision)?;
        }
        Command::Evaluate { user, feature } => {
            plans.set(user.context())?;
            let opts = EvaluateOptions {
                simulate_at: None,
                skip_logging: false,
                actor: admin,
            };
            let decision = engine.evaluate_entitlement(&user.user, feature, &opts).await?;
            print_json(&decision)?;
        }
        Command::Override { user, feature, value } => {
            engine
                .bridge()
                .set_override(&admin, &user.user, feature, value.0)?;
            print_json(&json!({
                "user_id": user.user,
                "feature": feature,
                "override": value.0,
            }))?;
        }
        Command::Overrides { user } => {
            let overrides: Vec<_> = engine
                .bridge()
                .overrides_for(&user)?
                .into_iter()
                .map(|(feature, value)| json!({ "feature": feature, "override": value }))
                .collect();
            print_json(&json!({ "user_id": user, "overrides": overrides }))?;
        }
        Command::Audit { user, limit } => {
            let entries = engine.bridge().audit_trail(&user.user, limit)?;
            print_json(&entries)?;
        }
        Command::Streak { user, record } => {
            plans.set(user.context())?;
            let state = match record {
                Some(date) => engine.record_activity(&user.user, Some(date)).await?,
                None => engine.get_streak(&user.user).await?,
            };
            let risk = engine.streak_risk(&user.user).await?;
            print_json(&json!({ "streak": state, "risk": risk }))?;
        }
        Command::Due { user, horizon_days } => {
            if horizon_days < 0 {
                bail!("horizon must not be negative");
            }
            plans.set(user.context())?;
            let due = engine
                .get_due_items(&user.user, Duration::days(horizon_days))
                .await?;
            print_json(&due)?;
        }
        Command::Stats { user } => {
            plans.set(user.context())?;
            let stats = engine.get_stats(&user.user).await?;
            print_json(&json!({
                "stats": stats,
                "accuracy": stats.accuracy(),
                "mean_response_ms": stats.mean_response_ms(),
            }))?;
        }
        Command::Migrate { user } => {
            if user.plan != Plan::Premium {
                bail!("migration is only available for premium users");
            }
            plans.set(user.context())?;
            let report = engine.migrate_on_upgrade(&user.user).await?;
            print_json(&report)?;
        }
        Command::Reconcile => {
            let report = engine.reconcile().await;
            print_json(&report)?;
        }
        Command::Serve => {
            let mut events = engine.subscribe();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    info!(user_id = %event.user_id(), event = event.event_type(), "Progress event");
                }
            });

            let mut runtime = BackgroundRuntime::new(engine.clone()).await?;
            runtime.start().await?;
            info!("Reconciliation running, press Ctrl+C to stop");
            signal::ctrl_c().await?;
            runtime.shutdown().await?;
        }
    }

    Ok(())
}
