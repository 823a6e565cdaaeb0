//! Result aggregation
//!
//! Findings sharing (type, sub-target, normalized signature) collapse into
//! one vulnerability record. The output depends only on the finding set,
//! the policy and the triage status of records that already exist, so
//! running it twice over the same input yields the same records.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kavach_common::{
    AggregationPolicy, Finding, RecordKey, RecordStatus, SeverityPolicy, VulnerabilityRecord,
};

/// Signature a finding is grouped under: the engine-supplied signature
/// trimmed and lower-cased, or the canonical evidence JSON when there is
/// none.
#[must_use]
pub fn normalized_signature(finding: &Finding) -> String {
    match finding.signature.as_deref().map(str::trim) {
        Some(sig) if !sig.is_empty() => sig.to_ascii_lowercase(),
        // serde_json objects are key-sorted, so this is canonical
        _ => finding.evidence.to_string(),
    }
}

#[must_use]
pub fn record_key(finding: &Finding) -> RecordKey {
    RecordKey {
        finding_type: finding.finding_type.clone(),
        sub_target_id: finding.sub_target_id,
        signature: normalized_signature(finding),
    }
}

fn trust_order<'a>(policy: &AggregationPolicy, f: &'a Finding) -> (usize, &'a str, uuid::Uuid) {
    (policy.rank(&f.engine), f.engine.as_str(), f.id)
}

/// Finding that represents its group.
fn representative<'a>(group: &[&'a Finding], policy: &AggregationPolicy) -> Option<&'a Finding> {
    match policy.severity {
        SeverityPolicy::Max => {
            let max = group.iter().map(|f| f.severity).max()?;
            group
                .iter()
                .copied()
                .filter(|f| f.severity == max)
                .min_by(|a, b| trust_order(policy, a).cmp(&trust_order(policy, b)))
        }
        SeverityPolicy::MostTrusted => {
            let trusted = group
                .iter()
                .copied()
                .min_by(|a, b| trust_order(policy, a).cmp(&trust_order(policy, b)))?;
            group
                .iter()
                .copied()
                .filter(|f| f.engine == trusted.engine)
                .max_by(|a, b| a.severity.cmp(&b.severity).then_with(|| b.id.cmp(&a.id)))
        }
    }
}

/// Merge `findings` into canonical records, sorted by key. Triage status of
/// records in `existing` carries over.
#[must_use]
pub fn aggregate(
    findings: &[Finding],
    policy: &AggregationPolicy,
    existing: &[VulnerabilityRecord],
) -> Vec<VulnerabilityRecord> {
    let triaged: HashMap<_, _> = existing.iter().map(|r| (r.id, r.status)).collect();

    let mut groups: BTreeMap<RecordKey, Vec<&Finding>> = BTreeMap::new();
    for finding in findings {
        groups.entry(record_key(finding)).or_default().push(finding);
    }

    groups
        .into_iter()
        .filter_map(|(key, group)| {
            let rep = representative(&group, policy)?;
            let id = key.record_id();
            let engines: BTreeSet<&str> = group.iter().map(|f| f.engine.as_str()).collect();
            let mut finding_ids: Vec<_> = group.iter().map(|f| f.id).collect();
            finding_ids.sort();

            Some(VulnerabilityRecord {
                id,
                job_id: rep.job_id,
                sub_target_id: key.sub_target_id,
                finding_type: key.finding_type,
                signature: key.signature,
                title: rep.title.clone(),
                severity: rep.severity,
                confidence: group.iter().map(|f| f.confidence).fold(0.0, f32::max),
                primary_engine: rep.engine.clone(),
                engines: engines.into_iter().map(str::to_string).collect(),
                evidence: rep.evidence.clone(),
                status: triaged.get(&id).copied().unwrap_or(RecordStatus::Open),
                finding_ids,
                first_seen: group.iter().map(|f| f.observed_at).min()?,
                last_seen: group.iter().map(|f| f.observed_at).max()?,
            })
        })
        .collect()
}
