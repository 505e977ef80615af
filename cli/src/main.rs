//! ccdindex CLI: run the database and block import jobs and inspect their state.
//!
//! Usage:
//! ```bash
//! ccdindex run    --config ccdindex.json [--follow]
//! ccdindex status --config ccdindex.json
//! ccdindex reset  --config ccdindex.json
//! ccdindex ranges 1 2 3 5 6 8
//! ccdindex info
//! ```

mod config;
mod logging;

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ccdindex_core::block::{BlockImportSummary, BlockImporter, BlockSource, BlockStores};
use ccdindex_core::checkpoint::CheckpointManager;
use ccdindex_core::health::JobHealth;
use ccdindex_core::importer::{ImportJob, ImportSummary};
use ccdindex_core::job::FrontierSource;
use ccdindex_core::metrics::ImportMetrics;
use ccdindex_core::ranges::{covered_heights, sorted_to_ranges};
use ccdindex_core::repository::RepositoryFactory;
use ccdindex_storage::PostgresStorage;

use config::CliConfig;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "status" => cmd_status(&args[2..]).await,
        "reset" => cmd_reset(&args[2..]).await,
        "ranges" => cmd_ranges(&args[2..]),
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("ccdindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("ccdindex {}", env!("CARGO_PKG_VERSION"));
    println!("Concordium block data import and reconciliation\n");
    println!("USAGE:");
    println!("    ccdindex <COMMAND>\n");
    println!("COMMANDS:");
    println!("    run      Run the import jobs until they catch up");
    println!("    status   Show the saved checkpoints and latest read height");
    println!("    reset    Delete the saved checkpoint of the batch import job");
    println!("    ranges   Collapse heights into contiguous ranges");
    println!("    info     Show default configuration");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("FLAGS:");
    println!("    --config <PATH>   JSON config file (DATABASE_URL overrides database_url)");
    println!("    --follow          Keep importing until interrupted (run only)");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn load_config(args: &[String]) -> Result<CliConfig> {
    let path = parse_flag(args, "--config").map(PathBuf::from);
    CliConfig::load(path.as_deref())
}

async fn cmd_run(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    logging::init_tracing(&config.log);
    if config.import.frontier == FrontierSource::Node {
        bail!("the CLI has no node client; use the \"repository\" frontier");
    }

    let storage = PostgresStorage::connect(config.database_url()?)
        .await
        .context("connecting to PostgreSQL")?;
    let health = Arc::new(JobHealth::new());
    let metrics = Arc::new(ImportMetrics::global());
    let mut job = ImportJob::new(
        config.import.clone(),
        Arc::new(storage.clone()),
        Box::new(storage.clone()),
        health.clone(),
        metrics.clone(),
    )?;
    let blocks = if config.blocks.enabled {
        Some(BlockImporter::new(
            config.blocks.clone(),
            config.chain_time.clone(),
            BlockStores::shared(storage),
            health.clone(),
            metrics.clone(),
        )?)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
            }
        }
    });

    let follow = has_flag(args, "--follow");
    let poll = Duration::from_millis(config.poll_interval_ms);
    let mut total = ImportSummary::default();
    let mut block_total = BlockImportSummary::default();
    loop {
        let summary = job.run(cancel.clone()).await?;
        total.batches += summary.batches;
        total.heights_imported += summary.heights_imported;
        total.events_stored += summary.events_stored;
        total.rejections_stored += summary.rejections_stored;
        total.final_height = summary.final_height;
        let mut cancelled = summary.cancelled;

        if let Some(blocks) = &blocks {
            if !cancelled {
                let summary = blocks.run(cancel.clone()).await?;
                block_total.blocks += summary.blocks;
                block_total.events_stored += summary.events_stored;
                block_total.rejections_stored += summary.rejections_stored;
                block_total.last_block_height = summary.last_block_height;
                block_total.total_amount_staked =
                    summary.total_amount_staked.or(block_total.total_amount_staked);
                cancelled = summary.cancelled;
            }
        }
        if cancelled || !follow {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }
    }

    info!(
        job = %job.job_name(),
        batches = total.batches,
        heights = total.heights_imported,
        events = total.events_stored,
        rejections = total.rejections_stored,
        final_height = ?total.final_height,
        "import finished"
    );
    if let Some(blocks) = &blocks {
        info!(
            job = %blocks.job_name(),
            blocks = block_total.blocks,
            events = block_total.events_stored,
            rejections = block_total.rejections_stored,
            last_block_height = ?block_total.last_block_height,
            total_amount_staked = ?block_total.total_amount_staked,
            "block import finished"
        );
    }
    Ok(())
}

async fn cmd_status(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let storage = PostgresStorage::connect(config.database_url()?).await?;
    let job_name = &config.import.job_name;
    let state = CheckpointManager::new(Box::new(storage.clone()), job_name.clone())
        .load_state()
        .await?;
    let mut repo = storage.create().await?;
    let latest = repo.latest_read_height().await?;
    let final_height = repo.final_height().await?;

    println!("Job: {job_name}");
    println!("  Next batch:           {}", state.next_batch);
    println!(
        "  Next batch starts at: {}",
        config.import.batch_range(state.next_batch).0
    );
    println!(
        "  Latest read height:   {}",
        latest.map_or_else(|| "none".to_string(), |h| h.to_string())
    );
    println!("  Staging final height: {final_height}");

    let blocks_job = &config.blocks.job_name;
    let blocks = CheckpointManager::new(Box::new(storage.clone()), blocks_job.clone())
        .load_state()
        .await?;
    let staged = storage.last_staged_height().await?;
    let show = |h: Option<u64>| h.map_or_else(|| "none".to_string(), |h| h.to_string());

    println!("Job: {blocks_job}");
    println!("  Enabled:              {}", config.blocks.enabled);
    println!("  Last block height:    {}", show(blocks.last_block_height));
    println!("  Last staged block:    {}", show(staged));
    println!("  Last genesis index:   {}", blocks.last_genesis_index);
    match blocks.next_pending_baker_change_time {
        Some(at) => println!("  Next baker change:    {at}"),
        None => println!("  Next baker change:    none"),
    }
    Ok(())
}

async fn cmd_reset(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    let storage = PostgresStorage::connect(config.database_url()?).await?;
    CheckpointManager::new(Box::new(storage), config.import.job_name.clone())
        .reset()
        .await?;
    println!("Checkpoint of {} deleted", config.import.job_name);
    Ok(())
}

fn cmd_ranges(args: &[String]) -> Result<()> {
    let mut heights = args
        .iter()
        .map(|a| a.parse::<u64>().with_context(|| format!("invalid height: {a}")))
        .collect::<Result<Vec<_>>>()?;
    heights.sort_unstable();
    heights.dedup();

    let ranges = sorted_to_ranges(&heights);
    for (start, end) in &ranges {
        if start == end {
            println!("{start}");
        } else {
            println!("{start}-{end}");
        }
    }
    println!("{} heights in {} ranges", covered_heights(&ranges), ranges.len());
    Ok(())
}

fn cmd_info() {
    let config = CliConfig::default();
    println!("CCDIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default job name: {}", config.import.job_name);
    println!("  Default batch size: {} heights", config.import.batch_size);
    println!("  Default parallel batches: {}", config.import.max_parallel_tasks);
    println!(
        "  Default retry: {} (delay {} ms)",
        match config.import.retry.retry_count {
            -1 => "forever".to_string(),
            n => format!("{n} times"),
        },
        config.import.retry.retry_delay_ms
    );
    println!("  Default read-height sampling: every {} ms", config.import.metric_delay_ms);
    println!("  Default block job name: {}", config.blocks.job_name);
    println!("  Storage backends: memory, PostgreSQL (feature: postgres)");
}
