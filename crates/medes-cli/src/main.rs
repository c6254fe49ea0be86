use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medes_llm::{ChatModel, LlmConfig, ServingEndpointClient};
use medes_pipeline::{run_batch, RunConfig};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "medes-cli")]
#[command(about = "Medical-desert facility enrichment command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one batch of raw facility rows through the enrichment pipeline.
    Enrich {
        /// JSON file containing an array of raw rows.
        #[arg(long)]
        input: PathBuf,
        /// Directory receiving one subdirectory per run.
        #[arg(long, default_value = "./runs")]
        out_dir: PathBuf,
        /// Optional YAML run configuration.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Rows in flight at once; overrides the config file value.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Probe the LLM serving endpoint with a tiny completion.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Enrich {
            input,
            out_dir,
            config,
            concurrency,
        } => {
            let mut run_config = RunConfig::load(config.as_deref())?;
            if let Some(concurrency) = concurrency {
                run_config.concurrency = concurrency;
            }

            let mut llm_config = LlmConfig::from_env();
            if let Some(model) = &run_config.model_name {
                llm_config.model = model.clone();
            }
            let client = ServingEndpointClient::new(llm_config)?;

            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let rows: Vec<Value> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {} as a JSON array of rows", input.display()))?;

            let summary = run_batch(Arc::new(client), rows, &run_config, &out_dir).await?;
            println!(
                "enrich complete: run_id={} input={} enriched={} skipped={} output={}",
                summary.run_id,
                summary.input_rows,
                summary.enriched_rows,
                summary.skipped_rows,
                summary.output_dir
            );
        }
        Commands::Check => {
            let client = ServingEndpointClient::new(LlmConfig::from_env())?;
            let model = client.model().to_string();
            match client.generate("ping", "You are a helpful assistant", 5).await {
                Ok(_) => println!("check passed: endpoint for model {model} is live"),
                Err(err) => {
                    eprintln!("check failed: {err}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
