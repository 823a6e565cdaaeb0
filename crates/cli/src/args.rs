use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "kavach")]
#[command(version)]
#[command(about = "Staged scan orchestrator: discovery, live-host checks, enumeration and detection", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log format: compact, json
    #[arg(long, default_value = "compact", global = true)]
    pub log_format: String,

    /// SQLite database URL (e.g. sqlite://kavach.db). In-memory when omitted.
    #[arg(long, env = "KAVACH_DB", global = true)]
    pub db: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a scan and wait for it to finish
    Scan {
        /// Root target: domain, URL, IP, CIDR or IPv4 range
        #[arg(short = 't', long, required = true)]
        target: String,

        /// Stages to run, comma separated. Example: live_host_check,vulnerability_detection
        #[arg(short, long, value_delimiter = ',')]
        stages: Vec<String>,

        /// Worker pool size for this job
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Preset: fast, balanced, accurate, stealth
        #[arg(long, default_value = "balanced", value_parser = ["fast", "balanced", "accurate", "stealth"])]
        preset: String,

        /// JSON config file; values override the preset
        #[arg(long, env = "KAVACH_CONFIG")]
        config: Option<PathBuf>,

        /// Output format: text, json, csv
        #[arg(short, long, default_value = "text")]
        output_format: String,

        /// Submitting principal
        #[arg(long, env = "USER", default_value = "local")]
        owner: String,

        /// Subdomain wordlist, one label per line
        #[arg(long)]
        wordlist: Option<PathBuf>,

        /// Advisory table (JSON array) for version checks
        #[arg(long)]
        advisories: Option<PathBuf>,

        /// Also query certificate-transparency logs
        #[arg(long)]
        ct: bool,

        /// Also run subfinder for discovery
        #[arg(long)]
        subfinder: bool,

        /// Also run nuclei for detection
        #[arg(long)]
        nuclei: bool,

        /// Expose Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },

    /// List stored jobs
    Jobs {
        /// Only jobs submitted by this owner
        #[arg(long)]
        owner: Option<String>,

        /// Only jobs in this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Print the report of a stored job
    Show {
        job: Uuid,

        #[arg(short, long, default_value = "text")]
        output_format: String,
    },

    /// Set the triage status of a vulnerability record
    Triage {
        job: Uuid,
        record: Uuid,

        /// open, confirmed, false_positive
        status: String,
    },

    /// Re-run aggregation over a finished job's findings
    Reaggregate {
        job: Uuid,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Cancel a job that has no live driver
    Cancel { job: Uuid },

    /// Delete a finished job; vulnerability records are kept
    Delete { job: Uuid },
}
