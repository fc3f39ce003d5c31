use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ofs_enrich::{BatchConfig, EnrichConfig, Enricher, OllamaBackend, SelectionPolicy};
use ofs_storage::{HttpClientConfig, HttpFetcher, PgStore};

#[derive(Debug, Parser)]
#[command(name = "ofs-cli")]
#[command(about = "Facility scoring and job enrichment pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one enrichment batch over the selected postings.
    Enrich {
        /// Posting selection: all, new-or-changed, or changed-only.
        #[arg(long, default_value = "new-or-changed")]
        policy: SelectionPolicy,
    },
    /// Recompute every facility's composite score.
    Score,
    /// Serve the read API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EnrichConfig::from_env();
    let store = PgStore::connect(&config.database_url).await?;

    match cli.command {
        Commands::Enrich { policy } => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..HttpClientConfig::default()
            })?;
            let backend = OllamaBackend::new(
                &config.backend_url,
                &config.backend_model,
                Duration::from_secs(config.backend_timeout_secs),
            )?;
            let enricher = Enricher::new(http, Arc::new(backend));
            let batch = BatchConfig {
                policy,
                inter_job_delay: Duration::from_millis(config.inter_job_delay_ms),
            };
            let run = ofs_enrich::run_batch(&store, &enricher, &batch).await?;
            println!(
                "enrichment complete: policy={} processed={} enriched={} expired={} failed={} status={} duration_ms={}",
                run.policy,
                run.processed,
                run.enriched,
                run.expired,
                run.failed,
                run.status.as_str(),
                run.duration_ms()
            );
        }
        Commands::Score => {
            let summary = ofs_scoring::run_scoring(&store, &store).await?;
            println!(
                "scoring complete: facilities={} scored={}",
                summary.facilities, summary.scored
            );
        }
        Commands::Serve { port } => {
            let store = Arc::new(store);
            let state = ofs_web::AppState::new(store.clone(), store);
            ofs_web::serve(state, port).await?;
        }
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
