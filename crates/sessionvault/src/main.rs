// sessionvault/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use anyhow::Context;
    use clap::{Parser, Subcommand};
    use serde::Serialize;
    use std::path::PathBuf;
    use tracing::info;

    use sessionvault::index_engine::Query;
    use sessionvault::{metrics, migration, telemetry, StorageConfig, StorageEngine};

    #[derive(Parser)]
    #[command(name = "sessionvault", version, about = "Inspect and maintain a sessionvault store")]
    struct Cli {
        /// Store directory, overrides SESSIONVAULT_DATA_DIR.
        #[arg(long, global = true)]
        data_dir: Option<PathBuf>,

        /// auto, filesystem, sqlite or memory.
        #[arg(long, global = true)]
        backend: Option<String>,

        #[arg(short, long, action = clap::ArgAction::Count, global = true)]
        verbose: u8,

        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Record counts, queue, cache, attachment and disk statistics.
        Stats,
        /// Delete attachments no record references.
        Gc,
        /// Compare the indexes with the stored records.
        CheckIndex,
        /// Rebuild every index from the stored records.
        RebuildIndex,
        /// Import a legacy single-file session store.
        Migrate { path: PathBuf },
        /// Search sessions.
        Query {
            #[arg(long)]
            text: Option<String>,
            #[arg(long = "tag")]
            tags: Vec<String>,
            #[arg(long)]
            status: Option<String>,
            #[arg(long, default_value_t = 20)]
            limit: usize,
        },
        /// Print Prometheus metrics after opening the store.
        Metrics,
    }

    fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub async fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        telemetry::init_tracing(telemetry::filter_for_verbosity(cli.verbose));

        let mut config = StorageConfig::from_env()?;
        if let Some(dir) = cli.data_dir {
            config.data_dir = dir;
        }
        if let Some(raw) = cli.backend.as_deref() {
            config.backend = raw.parse().context("--backend is invalid")?;
        }
        config.print_config();

        let engine = StorageEngine::open(config).await.context("Failed to open store")?;
        let outcome = execute(&engine, cli.command).await;
        engine.shutdown().await.context("Failed to shut the store down cleanly")?;
        outcome
    }

    async fn execute(engine: &StorageEngine, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Stats => print_json(&engine.stats().await?),
            Command::Gc => {
                let report = engine.collect_garbage().await?;
                info!("Freed {} bytes", report.freed_bytes);
                print_json(&report)
            }
            Command::CheckIndex => {
                let report = engine.check_index().await?;
                print_json(&report)?;
                if !report.is_healthy() {
                    anyhow::bail!("index check found {} errors", report.errors.len());
                }
                Ok(())
            }
            Command::RebuildIndex => {
                engine.rebuild_indexes().await?;
                engine.flush().await;
                print_json(&engine.stats().await?)
            }
            Command::Migrate { path } => {
                let report = migration::import_legacy_file(engine, &path).await?;
                print_json(&report)
            }
            Command::Query {
                text,
                tags,
                status,
                limit,
            } => {
                let query = Query {
                    text,
                    tags,
                    status,
                    limit: Some(limit),
                    ..Query::default()
                };
                print_json(&engine.query(&query).await?)
            }
            Command::Metrics => {
                print!("{}", metrics::gather_metrics());
                Ok(())
            }
        }
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
