use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use catalog_scraper::export;
use catalog_scraper::infra::http_client::ReqwestHttp;
use catalog_scraper::pipeline::orchestrator::{
    IngestionPipeline, PipelineOptions, PipelineResult, RunStatus,
};
use catalog_scraper::registry::source_loader::SourceRegistry;

#[derive(Parser)]
#[command(name = "catalog-scraper")]
#[command(about = "Product catalog scraper: paginated fetch, normalize, dedupe, export")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, validate and deduplicate one source; print the run summary
    Ingest {
        /// Source ID (a registry/sources/{id}.json spec must exist)
        #[arg(long)]
        source_id: String,
        /// Fetch even if the source was fetched within its cadence interval
        #[arg(long)]
        bypass_cadence: bool,
        /// Ignore the checkpointed cursor and start from the first page
        #[arg(long)]
        restart: bool,
        /// Stop after this many pages (checkpoint kept for resume)
        #[arg(long)]
        max_pages: Option<u64>,
    },
    /// Run the complete pipeline and export the clean dataset
    FullPipeline {
        /// Source ID to process
        #[arg(long)]
        source_id: String,
        /// Output directory for the exported files
        #[arg(long, default_value = "out")]
        out_dir: PathBuf,
        /// Export format: csv or jsonl
        #[arg(long, default_value = "csv")]
        format: String,
        /// Bypass cadence
        #[arg(long)]
        bypass_cadence: bool,
        /// Ignore the checkpointed cursor and start from the first page
        #[arg(long)]
        restart: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize logging
    catalog_scraper::observability::logging::init_logging();

    // A run-level cancellation signal: ctrl-c finishes the current wait and
    // returns partial results instead of tearing the process down.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 interrupt received; returning partial results");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Ingest { source_id, bypass_cadence, restart, max_pages } => {
            let options = PipelineOptions {
                bypass_cadence,
                restart,
                max_pages,
                data_root: Some(data_root()),
            };
            let result = run_pipeline(&source_id, options, cancel).await?;
            print_summary(&source_id, &result);
            finish(result)
        }
        Commands::FullPipeline { source_id, out_dir, format, bypass_cadence, restart } => {
            let options = PipelineOptions {
                bypass_cadence,
                restart,
                max_pages: None,
                data_root: Some(data_root()),
            };
            let result = run_pipeline(&source_id, options, cancel).await?;
            print_summary(&source_id, &result);

            if result.status != RunStatus::Skipped {
                let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
                let data_path = match format.as_str() {
                    "csv" => {
                        let path = out_dir.join(format!("products_{source_id}_{stamp}.csv"));
                        export::write_csv(&result.accepted, &path)?;
                        path
                    }
                    "jsonl" => {
                        let path = out_dir.join(format!("products_{source_id}_{stamp}.jsonl"));
                        export::write_jsonl(&result.accepted, &path)?;
                        path
                    }
                    other => anyhow::bail!("unsupported export format: {other}"),
                };
                let summary_path = out_dir.join(format!("summary_{source_id}_{stamp}.json"));
                export::write_summary_json(&result.summary, &summary_path)?;
                info!(
                    "💾 exported {} records to {} (summary: {})",
                    result.accepted.len(),
                    data_path.display(),
                    summary_path.display()
                );
            }
            finish(result)
        }
    }
}

async fn run_pipeline(
    source_id: &str,
    options: PipelineOptions,
    cancel: CancellationToken,
) -> anyhow::Result<PipelineResult> {
    let registry = SourceRegistry::from_env();
    let spec = registry.load(source_id)?;
    let pipeline = IngestionPipeline::new(spec, Arc::new(ReqwestHttp), options, cancel)?;
    Ok(pipeline.run().await)
}

fn data_root() -> PathBuf {
    std::env::var("CATALOG_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn print_summary(source_id: &str, result: &PipelineResult) {
    let summary = &result.summary;
    println!("📊 Run {} for {source_id}: {:?}", result.run_id, result.status);
    println!(
        "   pages: {}  records: {}  accepted: {}  duplicates: {}",
        summary.pages_fetched, summary.records_seen, summary.accepted, summary.duplicates
    );
    println!(
        "   rejected: {} (missing_field: {}, type_mismatch: {}, invalid_value: {}, malformed_encoding: {})",
        summary.rejects.total(),
        summary.rejects.missing_field,
        summary.rejects.type_mismatch,
        summary.rejects.invalid_value,
        summary.rejects.malformed_encoding
    );
    if let Some(error) = &result.error {
        println!("   error: {error}");
    }
}

fn finish(result: PipelineResult) -> anyhow::Result<()> {
    match result.status {
        RunStatus::Failed => match result.error {
            Some(error) => Err(error.into()),
            None => anyhow::bail!("run failed"),
        },
        _ => Ok(()),
    }
}
