use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use kpi_rollup::{
    config::KpiConfig,
    model::PeriodKind,
    query::KpiQuery,
    recompute::Recompute,
    runner::{run_periodically, Trigger},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "kpi-rollup", version, about = "Rebuild daily, weekly and monthly revenue KPIs")]
struct Cli {
    /// TOML settings file; built-in defaults are used without one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild all bucket tables once
    Recompute,
    /// Rebuild on a fixed schedule until interrupted
    Watch {
        /// seconds between runs, overriding schedule.interval_secs
        #[arg(long)]
        every: Option<u64>,
    },
    /// Print committed buckets as JSON
    Show {
        /// day, week or month
        kind: PeriodKind,
        /// first period start, YYYY-MM-DD
        start: NaiveDate,
        /// last period start, only `start` if omitted
        end: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // set up logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = KpiConfig::load(cli.config.as_deref())?;
    info!(zone = %config.time_zone, "configuration loaded");

    match cli.command {
        Command::Recompute => {
            let mut engine =
                Recompute::new(config.open_source()?, config.open_db()?, config.bucket_keys());
            let summary = engine.recompute()?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Command::Watch { every } => {
            let every = every
                .map(Duration::from_secs)
                .filter(|d| !d.is_zero())
                .unwrap_or_else(|| config.interval());
            let engine =
                Recompute::new(config.open_source()?, config.open_db()?, config.bucket_keys());
            let trigger = Arc::new(Trigger::new(engine));

            // the stores block, so runs go to the blocking pool of this runtime
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(2)
                .enable_all()
                .build()?;
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("cannot listen for ctrl-c: {}", e);
                    std::future::pending::<()>().await;
                }
                info!("interrupted");
            };
            runtime.block_on(run_periodically(trigger, every, shutdown))?;
        }
        Command::Show { kind, start, end } => {
            let mut query = KpiQuery::new(config.open_db()?);
            let points = query.get_range(kind, start, end.unwrap_or(start))?;
            println!("{}", serde_json::to_string_pretty(&points)?);
        }
    }
    Ok(())
}
