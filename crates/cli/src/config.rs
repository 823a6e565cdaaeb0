//! Config file loading
//!
//! The file is a JSON object holding `OrchestratorConfig` fields plus the
//! CLI-only keys below. It is layered over the selected preset, so a file
//! that only sets `retry.budget` keeps the preset's backoff.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use kavach_common::OrchestratorConfig;
use kavach_engines::ExternalToolSpec;

#[derive(Debug, Default)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub tools: Vec<ExternalToolSpec>,
    /// Scope allowlist entries; empty allows every target.
    pub allowlist: Vec<String>,
    pub wordlist: Option<PathBuf>,
    pub advisories: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Extras {
    tools: Vec<ExternalToolSpec>,
    allowlist: Vec<String>,
    wordlist: Option<PathBuf>,
    advisories: Option<PathBuf>,
}

pub fn load(preset: &str, path: Option<&Path>) -> Result<Settings> {
    let base = OrchestratorConfig::preset(preset).ok_or_else(|| anyhow!("unknown preset '{preset}'"))?;
    let Some(path) = path else {
        return Ok(Settings {
            orchestrator: base,
            ..Settings::default()
        });
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse(base, &raw).with_context(|| format!("invalid config file {}", path.display()))
}

fn parse(base: OrchestratorConfig, raw: &str) -> Result<Settings> {
    let file: Value = serde_json::from_str(raw)?;
    if !file.is_object() {
        return Err(anyhow!("expected a JSON object"));
    }
    let extras: Extras = serde_json::from_value(file.clone())?;

    let mut merged = serde_json::to_value(&base)?;
    merge(&mut merged, &file);
    let orchestrator: OrchestratorConfig = serde_json::from_value(merged)?;

    Ok(Settings {
        orchestrator,
        tools: extras.tools,
        allowlist: extras.allowlist,
        wordlist: extras.wordlist,
        advisories: extras.advisories,
    })
}

/// Objects merge key by key; anything else is replaced.
fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
