use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use kavach_common::{
    Finding, JobFilter, JobStatus, ProgressEvent, ScanJob, ScanStore, StageRun, StageRunFilter,
    StageRunKey, SubTarget, VulnerabilityRecord,
};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, ScanJob>,
    sub_targets: HashMap<Uuid, BTreeMap<String, SubTarget>>,
    stage_runs: HashMap<StageRunKey, StageRun>,
    findings: HashMap<Uuid, Vec<Finding>>,
    records: HashMap<Uuid, BTreeMap<Uuid, VulnerabilityRecord>>,
    events: HashMap<Uuid, Vec<ProgressEvent>>,
}

/// In-process store. Every method takes one lock, so each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn save_job(&self, job: &ScanJob) -> Result<()> {
        self.tables.write().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<ScanJob>> {
        Ok(self.tables.read().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScanJob>> {
        let tables = self.tables.read();
        let mut jobs: Vec<ScanJob> = tables
            .jobs
            .values()
            .filter(|j| filter.owner.as_ref().map_or(true, |o| &j.owner == o))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn transition_job(&self, id: Uuid, from: &[JobStatus], to: JobStatus) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.jobs.get_mut(&id) {
            Some(job) if from.contains(&job.status) => {
                job.set_status(to);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        tables.jobs.remove(&id);
        tables.sub_targets.remove(&id);
        tables.stage_runs.retain(|key, _| key.job_id != id);
        tables.findings.remove(&id);
        tables.events.remove(&id);
        Ok(())
    }

    async fn insert_sub_target(&self, sub_target: &SubTarget) -> Result<bool> {
        let mut tables = self.tables.write();
        let per_job = tables.sub_targets.entry(sub_target.job_id).or_default();
        if per_job.contains_key(&sub_target.dedup_key) {
            return Ok(false);
        }
        per_job.insert(sub_target.dedup_key.clone(), sub_target.clone());
        Ok(true)
    }

    async fn sub_targets(&self, job_id: Uuid) -> Result<Vec<SubTarget>> {
        Ok(self
            .tables
            .read()
            .sub_targets
            .get(&job_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_stage_run(&self, run: &StageRun) -> Result<bool> {
        let mut tables = self.tables.write();
        let key = run.key();
        if tables.stage_runs.contains_key(&key) {
            return Ok(false);
        }
        tables.stage_runs.insert(key, run.clone());
        Ok(true)
    }

    async fn load_stage_run(&self, key: &StageRunKey) -> Result<Option<StageRun>> {
        Ok(self.tables.read().stage_runs.get(key).cloned())
    }

    async fn update_stage_run(&self, expected: &StageRun, next: &StageRun) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.stage_runs.get_mut(&expected.key()) {
            Some(row) if row.status == expected.status && row.attempts == expected.attempts => {
                *row = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query_stage_runs(&self, filter: &StageRunFilter) -> Result<Vec<StageRun>> {
        let tables = self.tables.read();
        let mut runs: Vec<StageRun> = tables
            .stage_runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| (a.stage, &a.dedup_key).cmp(&(b.stage, &b.dedup_key)));
        Ok(runs)
    }

    async fn save_findings(&self, findings: &[Finding]) -> Result<()> {
        let mut tables = self.tables.write();
        for finding in findings {
            let per_job = tables.findings.entry(finding.job_id).or_default();
            if !per_job.iter().any(|f| f.id == finding.id) {
                per_job.push(finding.clone());
            }
        }
        Ok(())
    }

    async fn findings(&self, job_id: Uuid) -> Result<Vec<Finding>> {
        Ok(self.tables.read().findings.get(&job_id).cloned().unwrap_or_default())
    }

    async fn save_vulnerabilities(&self, records: &[VulnerabilityRecord]) -> Result<()> {
        let mut tables = self.tables.write();
        for record in records {
            tables
                .records
                .entry(record.job_id)
                .or_default()
                .insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn vulnerabilities(&self, job_id: Uuid) -> Result<Vec<VulnerabilityRecord>> {
        Ok(self
            .tables
            .read()
            .records
            .get(&job_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn append_event(&self, event: &ProgressEvent) -> Result<()> {
        self.tables
            .write()
            .events
            .entry(event.job_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn events(&self, job_id: Uuid) -> Result<Vec<ProgressEvent>> {
        Ok(self.tables.read().events.get(&job_id).cloned().unwrap_or_default())
    }
}
