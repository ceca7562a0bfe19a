use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fieldmap_adapters::Entity;
use fieldmap_sync::{run_sync_once_from_env, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "fieldmap-cli")]
#[command(about = "CRM custom field mapping pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge and rewrite every enabled entity in entities.yaml.
    Sync,
    /// Merge one page of field definitions into the stored mapping.
    Merge {
        #[arg(long)]
        entity: Entity,
        #[arg(long)]
        fields: PathBuf,
    },
    /// Print records rewritten with the stored mapping.
    Rewrite {
        #[arg(long)]
        entity: Entity,
        #[arg(long)]
        records: PathBuf,
    },
    /// Print the stored mapping as JSON.
    ShowState {
        #[arg(long)]
        entity: Option<Entity>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} entities={} skipped={} records={} summary={}",
                summary.run_id,
                summary.entities.len(),
                summary.skipped.len(),
                summary.records(),
                summary.summary_path
            );
        }
        Commands::Merge { entity, fields } => {
            let (report, saved) = SyncPipeline::new(SyncConfig::from_env())
                .merge_field_file(entity, &fields)
                .await
                .with_context(|| format!("merging {} into {entity}", fields.display()))?;
            println!(
                "merged {entity}: created={} refreshed={} extended={} options_added={} \
                 skipped={} entries={} unchanged={}",
                report.created,
                report.refreshed,
                report.extended,
                report.options_added,
                report.skipped,
                saved.entries,
                saved.unchanged
            );
        }
        Commands::Rewrite { entity, records } => {
            let rewritten = SyncPipeline::new(SyncConfig::from_env())
                .rewrite_record_file(entity, &records)
                .await
                .with_context(|| format!("rewriting {}", records.display()))?;
            println!("{}", serde_json::to_string_pretty(&rewritten)?);
        }
        Commands::ShowState { entity } => {
            let states = SyncPipeline::new(SyncConfig::from_env())
                .stored_states(entity)
                .await?;
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
    }

    Ok(())
}
