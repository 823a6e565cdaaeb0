// runner.rs
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kavach_common::{
    Engine, JobFilter, JobStatus, RecordStatus, ScanRequest, ScanStore, Stage, StageSelection,
};
use kavach_engines::dns::DEFAULT_WORDLIST;
use kavach_engines::{default_engines, CertTransparency, ExternalTool};
use kavach_fingerprint::AdvisoryDb;
use kavach_orchestrator::{BroadcastPublisher, Coordinator, ScopeAllowlist};
use kavach_storage::{MemoryStore, SqliteStore};

use crate::config::{self, Settings};
use crate::output::{print_jobs, print_report, Report};

/// Flags of the `scan` subcommand.
pub struct ScanOptions {
    pub target: String,
    pub stages: Vec<String>,
    pub concurrency: Option<usize>,
    pub preset: String,
    pub config: Option<PathBuf>,
    pub output_format: String,
    pub owner: String,
    pub wordlist: Option<PathBuf>,
    pub advisories: Option<PathBuf>,
    pub ct: bool,
    pub subfinder: bool,
    pub nuclei: bool,
    pub metrics_addr: Option<SocketAddr>,
}

pub async fn open_store(db: Option<&str>) -> Result<Arc<dyn ScanStore>> {
    match db {
        Some(url) => {
            let store = SqliteStore::connect(url)
                .await
                .with_context(|| format!("failed to open database {url}"))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

fn parse_stages(raw: &[String]) -> Result<Option<StageSelection>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let stages = raw
        .iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<Stage>().map_err(|e| anyhow!("{e}")))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(StageSelection::from(stages)))
}

fn parse_record_status(raw: &str) -> Result<RecordStatus> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "open" => Ok(RecordStatus::Open),
        "confirmed" => Ok(RecordStatus::Confirmed),
        "false_positive" | "fp" => Ok(RecordStatus::FalsePositive),
        other => Err(anyhow!("unknown record status '{other}'")),
    }
}

fn parse_job_status(raw: &str) -> Result<JobStatus> {
    let wanted = raw.trim().to_ascii_lowercase();
    [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Partial,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ]
    .into_iter()
    .find(|s| s.as_str() == wanted)
    .ok_or_else(|| anyhow!("unknown job status '{raw}'"))
}

fn load_wordlist(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read wordlist {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn build_engines(settings: &Settings, opts: &ScanOptions) -> Result<Vec<Arc<dyn Engine>>> {
    let wordlist = match opts.wordlist.as_deref().or(settings.wordlist.as_deref()) {
        Some(path) => load_wordlist(path)?,
        None => DEFAULT_WORDLIST.iter().map(|w| (*w).to_string()).collect(),
    };
    let advisories = match opts.advisories.as_deref().or(settings.advisories.as_deref()) {
        Some(path) => AdvisoryDb::load(path)?,
        None => AdvisoryDb::default(),
    };
    info!("Wordlist: {} label(s)", wordlist.len());
    info!("Advisories: {} entr(ies)", advisories.len());

    let concurrency = opts.concurrency.unwrap_or(settings.orchestrator.max_concurrency);
    let mut engines = default_engines(wordlist, Arc::new(advisories), probe_parallelism(concurrency))
        .map_err(|e| anyhow!("engine setup: {e}"))?;
    if opts.ct {
        let ct = CertTransparency::new().map_err(|e| anyhow!("certificate transparency: {e}"))?;
        engines.push(Arc::new(ct));
    }
    if opts.subfinder {
        engines.push(Arc::new(ExternalTool::subfinder()));
    }
    if opts.nuclei {
        engines.push(Arc::new(ExternalTool::nuclei()));
    }
    for spec in &settings.tools {
        engines.push(Arc::new(ExternalTool::new(spec.clone())));
    }
    Ok(engines)
}

/// Connections a single probe or DNS unit may hold open.
fn probe_parallelism(concurrency: usize) -> usize {
    concurrency.saturating_mul(4).clamp(4, 128)
}

/// Forward live progress events to the log.
fn watch_progress(publisher: &BroadcastPublisher) {
    let mut events = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok((job_id, event)) => debug!(
                    job_id = %job_id,
                    kind = %event.kind,
                    stage = ?event.stage,
                    sub_target = ?event.sub_target,
                    payload = %event.payload,
                    "progress"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "progress subscriber lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

pub async fn run_scan(db: Option<&str>, opts: ScanOptions) -> Result<JobStatus> {
    let settings = config::load(&opts.preset, opts.config.as_deref())?;

    info!("Starting scan...");
    info!("Target: {}", opts.target);
    info!("Preset: {}", opts.preset);
    info!(
        "Concurrency: {}",
        opts.concurrency.unwrap_or(settings.orchestrator.max_concurrency)
    );

    if let Some(addr) = opts.metrics_addr {
        kavach_telemetry::install_prometheus(addr)?;
    }

    let store = open_store(db).await?;
    let engines = build_engines(&settings, &opts)?;
    let publisher = Arc::new(BroadcastPublisher::default());
    watch_progress(&publisher);

    let stages = parse_stages(&opts.stages)?.unwrap_or_else(|| settings.orchestrator.stages.clone());
    let mut coordinator = Coordinator::new(settings.orchestrator.clone(), store)
        .with_publisher(publisher)
        .with_engines(engines);
    if !settings.allowlist.is_empty() {
        coordinator = coordinator.with_authorizer(Arc::new(ScopeAllowlist::from_entries(&settings.allowlist)?));
    }
    info!("Engines: {}", coordinator.engine_ids().join(", "));

    let mut request = ScanRequest::new(opts.target.clone(), opts.owner.clone()).with_stages(stages);
    if let Some(concurrency) = opts.concurrency {
        request = request.with_concurrency(concurrency);
    }

    let scan_start = Instant::now();
    let job_id = coordinator.submit(request).await?;
    info!("Job {} submitted", job_id);

    let status = tokio::select! {
        status = coordinator.wait(job_id) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, cancelling job {}", job_id);
            coordinator.cancel(job_id).await?;
            coordinator.wait(job_id).await?
        }
    };
    let scan_duration = scan_start.elapsed();

    let view = coordinator.status(job_id).await?;
    let records = coordinator.vulnerabilities(job_id).await?;
    let sub_targets = coordinator.sub_targets(job_id).await?;
    print_report(
        &Report {
            view: &view,
            records: &records,
            sub_targets: &sub_targets,
            duration: Some(scan_duration),
        },
        &opts.output_format,
    )?;
    Ok(status)
}

/// Coordinator over an existing store, for the maintenance commands.
async fn offline(db: Option<&str>, config: Option<&Path>) -> Result<Coordinator> {
    if db.is_none() {
        warn!("No --db given; the in-memory store is empty");
    }
    let settings = config::load("balanced", config)?;
    Ok(Coordinator::new(settings.orchestrator, open_store(db).await?))
}

pub async fn list_jobs(db: Option<&str>, owner: Option<String>, status: Option<String>) -> Result<()> {
    let filter = JobFilter {
        owner,
        status: status.as_deref().map(parse_job_status).transpose()?,
    };
    let jobs = offline(db, None).await?.list_jobs(&filter).await?;
    print_jobs(&jobs);
    Ok(())
}

pub async fn show_job(db: Option<&str>, job_id: Uuid, output_format: &str) -> Result<()> {
    let coordinator = offline(db, None).await?;
    let view = coordinator.status(job_id).await?;
    let records = coordinator.vulnerabilities(job_id).await?;
    let sub_targets = coordinator.sub_targets(job_id).await?;
    print_report(
        &Report {
            view: &view,
            records: &records,
            sub_targets: &sub_targets,
            duration: None,
        },
        output_format,
    )
}

pub async fn triage(db: Option<&str>, job_id: Uuid, record_id: Uuid, status: &str) -> Result<()> {
    let status = parse_record_status(status)?;
    let record = offline(db, None)
        .await?
        .triage(job_id, record_id, status)
        .await?;
    println!("{} {} -> {}", record.id, record.title, record.status.as_str());
    Ok(())
}

pub async fn reaggregate(db: Option<&str>, job_id: Uuid, config: Option<&Path>) -> Result<()> {
    let records = offline(db, config).await?.reaggregate(job_id).await?;
    println!("Job {} re-aggregated into {} record(s)", job_id, records);
    Ok(())
}

pub async fn cancel(db: Option<&str>, job_id: Uuid) -> Result<()> {
    let status = offline(db, None).await?.cancel(job_id).await?;
    println!("Job {} is {}", job_id, status);
    Ok(())
}

pub async fn delete(db: Option<&str>, job_id: Uuid) -> Result<()> {
    offline(db, None).await?.delete_job(job_id).await?;
    println!("Job {} deleted", job_id);
    Ok(())
}
