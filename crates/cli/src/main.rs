mod args;
mod config;
mod output;
mod runner;

use anyhow::{anyhow, Result};
use clap::Parser;

use args::{Cli, Commands};
use kavach_common::JobStatus;
use kavach_telemetry::{init_tracing, LogFormat};
use runner::ScanOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_format: LogFormat = cli.log_format.parse().map_err(|e: String| anyhow!(e))?;
    init_tracing(cli.verbose, log_format);
    let db = cli.db.as_deref();

    match cli.command {
        Commands::Scan {
            target,
            stages,
            concurrency,
            preset,
            config,
            output_format,
            owner,
            wordlist,
            advisories,
            ct,
            subfinder,
            nuclei,
            metrics_addr,
        } => {
            let status = runner::run_scan(
                db,
                ScanOptions {
                    target,
                    stages,
                    concurrency,
                    preset,
                    config,
                    output_format,
                    owner,
                    wordlist,
                    advisories,
                    ct,
                    subfinder,
                    nuclei,
                    metrics_addr,
                },
            )
            .await?;
            if status == JobStatus::Failed {
                std::process::exit(2);
            }
        }
        Commands::Jobs { owner, status } => runner::list_jobs(db, owner, status).await?,
        Commands::Show { job, output_format } => runner::show_job(db, job, &output_format).await?,
        Commands::Triage { job, record, status } => runner::triage(db, job, record, &status).await?,
        Commands::Reaggregate { job, config } => {
            runner::reaggregate(db, job, config.as_deref()).await?
        }
        Commands::Cancel { job } => runner::cancel(db, job).await?,
        Commands::Delete { job } => runner::delete(db, job).await?,
    }

    Ok(())
}
