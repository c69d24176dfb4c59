//! Status command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use darkroom_client::DarkroomClient;
use darkroom_core::domain::metrics::QueueMetrics;

use crate::config::Config;

/// Status subcommands
#[derive(Subcommand)]
pub enum StatusCommands {
    /// Job counts by status and average processing time
    Metrics {
        /// Only jobs of this owner
        #[arg(short, long)]
        owner: Option<i64>,
    },
    /// Worker pool state
    Pool,
    /// Model cache occupancy
    Cache,
    /// Check that the server is up
    Health,
}

pub async fn handle_status_command(command: StatusCommands, config: &Config) -> Result<()> {
    let client = DarkroomClient::new(&config.server_url);

    match command {
        StatusCommands::Metrics { owner } => show_metrics(&client, owner).await,
        StatusCommands::Pool => show_pool(&client).await,
        StatusCommands::Cache => show_cache(&client).await,
        StatusCommands::Health => check_health(&client).await,
    }
}

async fn show_metrics(client: &DarkroomClient, owner: Option<i64>) -> Result<()> {
    match owner {
        Some(owner) => {
            let owner_metrics = client.get_owner_metrics(owner).await?;
            println!("{}", format!("Metrics for owner {}:", owner).bold());
            print_metrics(&owner_metrics.metrics);
        }
        None => {
            let metrics = client.get_metrics().await?;
            println!("{}", "Queue Metrics:".bold());
            print_metrics(&metrics);
        }
    }

    Ok(())
}

fn print_metrics(metrics: &QueueMetrics) {
    println!("  Total:       {}", metrics.total);
    println!("  Pending:     {}", metrics.pending.to_string().yellow());
    println!("  Processing:  {}", metrics.processing.to_string().cyan());
    println!("  Completed:   {}", metrics.completed.to_string().green());
    println!("  Failed:      {}", metrics.failed.to_string().red());
    println!("  Avg. time:   {:.1}s", metrics.avg_processing_time_secs);
}

async fn show_pool(client: &DarkroomClient) -> Result<()> {
    let pool = client.get_pool_status().await?;

    println!("{}", "Worker Pool:".bold());
    println!("  Active workers: {}", pool.active_workers);
    println!("  Queue size:     {}", pool.queue_size);

    if !pool.workers.is_empty() {
        println!();
        for worker in pool.workers {
            let current = worker
                .current_job_id
                .map(|id| id.cyan())
                .unwrap_or_else(|| "idle".dimmed());
            println!(
                "  {} Worker {} ({} job(s), since {}): {}",
                "▸".cyan(),
                worker.id,
                worker.jobs_processed,
                worker.started_at.format("%Y-%m-%d %H:%M:%S"),
                current
            );
        }
    }

    Ok(())
}

async fn show_cache(client: &DarkroomClient) -> Result<()> {
    let stats = client.get_cache_stats().await?;
    let mib = |bytes: u64| bytes as f64 / (1024.0 * 1024.0);

    println!("{}", "Model Cache:".bold());
    println!("  Entries: {}", stats.entries);
    println!(
        "  Size:    {:.1} MiB of {:.1} MiB",
        mib(stats.total_bytes),
        mib(stats.max_bytes)
    );

    Ok(())
}

async fn check_health(client: &DarkroomClient) -> Result<()> {
    if client.health().await? {
        println!("{} {}", "✓".green(), client.base_url());
    } else {
        println!("{} {} is not reachable", "✗".red(), client.base_url());
    }

    Ok(())
}
