//! Output formatting for scan reports

use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use kavach_common::{ScanJob, SubTarget, VulnerabilityRecord};
use kavach_orchestrator::JobView;

/// Everything one report prints.
pub struct Report<'a> {
    pub view: &'a JobView,
    pub records: &'a [VulnerabilityRecord],
    pub sub_targets: &'a [SubTarget],
    pub duration: Option<Duration>,
}

impl Report<'_> {
    fn host_of(&self) -> HashMap<Uuid, &str> {
        self.sub_targets
            .iter()
            .map(|s| (s.id, s.dedup_key.as_str()))
            .collect()
    }

    /// Most severe first, then by host.
    fn sorted(&self) -> Vec<&VulnerabilityRecord> {
        let hosts = self.host_of();
        let mut records: Vec<_> = self.records.iter().collect();
        records.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| hosts.get(&a.sub_target_id).cmp(&hosts.get(&b.sub_target_id)))
                .then_with(|| a.title.cmp(&b.title))
        });
        records
    }
}

/// Print a report in the specified format
pub fn print_report(report: &Report<'_>, format: &str) -> Result<()> {
    let format = format.trim().to_lowercase();
    match format.as_str() {
        "json" | "j" => print_json(report)?,
        "csv" | "c" => print_csv(report),
        "table" | "text" | "t" | "" => print_table(report),
        _ => {
            eprintln!("Warning: Unknown format '{}', using default table format", format);
            print_table(report);
        }
    }
    Ok(())
}

fn print_table(report: &Report<'_>) {
    let job = &report.view.job;
    let hosts = report.host_of();

    println!("\nJob {} ({}) - {}", job.id, job.root_target, job.status);
    if report.records.is_empty() {
        println!("\nNo vulnerabilities recorded.");
    } else {
        println!("\n{:-<100}", "");
        println!(
            "{:<10} {:<28} {:<26} {:<34}",
            "SEVERITY", "SUB-TARGET", "TYPE", "TITLE"
        );
        println!("{:-<100}", "");
        for record in report.sorted() {
            let host = hosts.get(&record.sub_target_id).copied().unwrap_or("?");
            println!(
                "{:<10} {:<28} {:<26} {:<34}",
                record.severity.as_str(),
                truncate(host, 28),
                truncate(&record.finding_type, 26),
                truncate(&record.title, 34)
            );
        }
        println!("{:-<100}", "");
    }

    println!("\n📊 Summary:");
    println!("  Sub-targets: {}", report.view.sub_targets);
    println!("  Findings: {}", report.view.findings);
    println!("  Vulnerabilities: {}", report.view.vulnerabilities);
    for (stage, counts) in &report.view.stages {
        println!(
            "  {:<24} ✓ {}  ✗ {}  ⊘ {}  … {}",
            stage.as_str(),
            counts.succeeded,
            counts.failed,
            counts.skipped,
            counts.pending + counts.running
        );
    }
    if !report.view.failed_units.is_empty() {
        println!("\n  Failed units:");
        for unit in &report.view.failed_units {
            println!(
                "    {} {} after {} attempt(s): {}",
                unit.stage,
                unit.sub_target,
                unit.attempts,
                unit.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if let Some(duration) = report.duration.or_else(|| job.elapsed()) {
        println!("  ⏱️  Duration: {}", format_duration(duration));
    }
    println!();
}

fn print_json(report: &Report<'_>) -> Result<()> {
    let duration = report.duration.or_else(|| report.view.job.elapsed());
    let output = json!({
        "job": report.view,
        "duration_seconds": duration.map(|d| d.as_secs_f64()),
        "sub_targets": report.sub_targets,
        "vulnerabilities": report.sorted(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_csv(report: &Report<'_>) {
    let hosts = report.host_of();
    println!("id,severity,sub_target,type,signature,title,engines,confidence,status,first_seen,last_seen");
    for record in report.sorted() {
        println!(
            "{},{},{},{},{},{},{},{:.2},{},{},{}",
            record.id,
            record.severity,
            csv_field(hosts.get(&record.sub_target_id).copied().unwrap_or("")),
            csv_field(&record.finding_type),
            csv_field(&record.signature),
            csv_field(&record.title),
            csv_field(&record.engines.join(";")),
            record.confidence,
            record.status.as_str(),
            record.first_seen.to_rfc3339(),
            record.last_seen.to_rfc3339()
        );
    }
}

/// Stored jobs, newest first.
pub fn print_jobs(jobs: &[ScanJob]) {
    if jobs.is_empty() {
        println!("\nNo jobs stored.\n");
        return;
    }
    let mut jobs: Vec<_> = jobs.iter().collect();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    println!("\n{:-<100}", "");
    println!(
        "{:<38} {:<12} {:<28} {:<10} {:<10}",
        "ID", "STATUS", "TARGET", "OWNER", "DURATION"
    );
    println!("{:-<100}", "");
    for job in jobs {
        println!(
            "{:<38} {:<12} {:<28} {:<10} {:<10}",
            job.id.to_string(),
            job.status.as_str(),
            truncate(&job.root_target, 28),
            truncate(&job.owner, 10),
            job.elapsed().map(format_duration).unwrap_or_else(|| "-".into())
        );
    }
    println!("{:-<100}\n", "");
}

/// Quote a CSV field; newlines are flattened.
fn csv_field(value: &str) -> String {
    let flat = value.replace(['\r', '\n'], " ");
    if flat.contains([',', '"']) {
        format!("\"{}\"", flat.replace('"', "\"\""))
    } else {
        flat
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() > width {
        let head: String = value.chars().take(width.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        value.to_string()
    }
}

/// Format duration in a human-readable way
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs == 0 {
        format!("{}ms", millis)
    } else if total_secs < 60 {
        if millis > 0 {
            format!("{}.{:03}s", total_secs, millis)
        } else {
            format!("{}s", total_secs)
        }
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kavach_common::{JobStatus, RecordStatus, ScanRequest, Severity, Stage, SubTargetKind};
    use kavach_orchestrator::StageCounts;
    use std::collections::BTreeMap;

    fn fixture() -> (JobView, Vec<VulnerabilityRecord>, Vec<SubTarget>) {
        let mut job = ScanJob::new(ScanRequest::new("example.com", "alice"), "example.com".into());
        job.set_status(JobStatus::Completed);
        let api = SubTarget::new(
            job.id,
            "api.example.com".into(),
            "api.example.com".into(),
            SubTargetKind::Domain,
            Stage::Discovery,
        );
        let seen = job.created_at;
        let record = |title: &str, severity| VulnerabilityRecord {
            id: Uuid::new_v4(),
            job_id: job.id,
            sub_target_id: api.id,
            finding_type: "outdated_software".into(),
            signature: "nginx/1.14.0".into(),
            title: title.into(),
            severity,
            confidence: 0.8,
            primary_engine: "banner-version".into(),
            engines: vec!["banner-version".into(), "external-nuclei".into()],
            evidence: json!({ "banner": "nginx/1.14.0" }),
            status: RecordStatus::Open,
            finding_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            first_seen: seen,
            last_seen: seen,
        };
        let records = vec![
            record("nginx, \"old\"", Severity::Medium),
            record("redis 6.0", Severity::Critical),
        ];
        let mut stages = BTreeMap::new();
        stages.insert(
            Stage::VulnerabilityDetection,
            StageCounts {
                succeeded: 1,
                ..StageCounts::default()
            },
        );
        let view = JobView {
            job,
            stages,
            failed_units: Vec::new(),
            sub_targets: 1,
            findings: 4,
            vulnerabilities: records.len(),
        };
        (view, records, vec![api])
    }

    #[test]
    fn test_print_report_formats() {
        let (view, records, subs) = fixture();
        let report = Report {
            view: &view,
            records: &records,
            sub_targets: &subs,
            duration: Some(Duration::from_secs(5)),
        };
        assert!(print_report(&report, "json").is_ok());
        assert!(print_report(&report, "csv").is_ok());
        assert!(print_report(&report, "text").is_ok());
        assert!(print_report(&report, "yaml").is_ok());
    }

    #[test]
    fn test_sorted_by_severity() {
        let (view, records, subs) = fixture();
        let report = Report {
            view: &view,
            records: &records,
            sub_targets: &subs,
            duration: None,
        };
        let sorted = report.sorted();
        assert_eq!(sorted[0].severity, Severity::Critical);
        assert_eq!(sorted[1].severity, Severity::Medium);
    }

    #[test]
    fn test_print_jobs() {
        let (view, _, _) = fixture();
        print_jobs(&[view.job.clone(), ScanJob::new(ScanRequest::new("10.0.0.1", "bob"), "10.0.0.1".into())]);
        print_jobs(&[]);
    }

    #[test]
    fn test_csv_field() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "two lines");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-hostname.example.com", 12), "a-very-lo...");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_millis(5500)), "5.500s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
    }
}
