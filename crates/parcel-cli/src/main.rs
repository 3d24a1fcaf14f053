use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parcel_sync::ingest::alert_unhealthy;
use parcel_sync::{ParcelServices, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parcel-cli")]
#[command(about = "Parcel overlay and data freshness command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run ingestion for every enabled source, one source, only the due ones,
    /// or only those whose upstream changed since their last successful run.
    Ingest {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, conflicts_with_all = ["source", "changed"])]
        due: bool,
        #[arg(long, conflicts_with = "source")]
        changed: bool,
    },
    /// Print the catalog health summary.
    Health,
    /// Ask upstream when each source (or one) last changed.
    Freshness {
        #[arg(long)]
        source: Option<String>,
    },
    /// Print the overlay for one parcel.
    Overlay { parcel_id: String },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API, with the nightly scheduler when enabled.
    Serve,
    /// Run only the nightly scheduler.
    Schedule,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let default_command = Commands::Ingest {
        source: None,
        due: false,
        changed: false,
    };
    match cli.command.unwrap_or(default_command) {
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            let store = parcel_storage::PgStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Ingest { source, due, changed } => {
            let services = ParcelServices::from_config(config).await?;
            match (source, due, changed) {
                (Some(name), _, _) => {
                    let report = services.pipeline.run_source(&name).await?;
                    print_json(&report)?;
                }
                (None, true, _) => {
                    let batch = services.pipeline.run_due().await?;
                    print_json(&batch)?;
                }
                (None, false, true) => {
                    let batch = services.pipeline.run_changed().await?;
                    print_json(&batch)?;
                }
                (None, false, false) => {
                    let (batch, _health, dir) = services.pipeline.run_all_and_report().await?;
                    println!(
                        "ingest complete: batch_id={} runs={} errors={} reports={}",
                        batch.batch_id,
                        batch.runs.len(),
                        batch.errors.len(),
                        dir.display()
                    );
                }
            }
        }
        Commands::Health => {
            let services = ParcelServices::from_config(config).await?;
            let summary = services.catalog.get_health_summary().await?;
            alert_unhealthy(&summary);
            print_json(&summary)?;
        }
        Commands::Freshness { source } => {
            let services = ParcelServices::from_config(config).await?;
            match source {
                Some(name) => print_json(&services.pipeline.check_freshness(&name).await?)?,
                None => print_json(&services.pipeline.check_all_freshness().await?)?,
            }
        }
        Commands::Overlay { parcel_id } => {
            let services = ParcelServices::from_config(config).await?;
            let overlay = services.overlay.get_overlay(&parcel_id).await?;
            print_json(&overlay)?;
        }
        Commands::Serve => {
            let services = ParcelServices::from_config(config).await?;
            let scheduler = services.pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %services.config.ingest_cron, "nightly ingest scheduled");
            }
            parcel_web::serve(services).await?;
        }
        Commands::Schedule => {
            let services = ParcelServices::from_config(config).await?;
            let Some(sched) = services.pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("PARCEL_SCHEDULER_ENABLED is not set");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %services.config.ingest_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
