//! External tool adapter
//!
//! Runs an allowlisted binary against one sub-target. `{target}` and
//! `{host}` in the argument list are substituted before launch. Discovery
//! and enumeration tools print one name per line; detection tools print
//! JSON lines in the nuclei result shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use kavach_common::{
    Capability, Engine, EngineError, EngineOutput, FindingDraft, InvokeContext, Severity,
    SubTarget,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutput {
    Lines,
    JsonLines,
}

/// Declarative tool definition, loadable from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalToolSpec {
    pub id: String,
    pub capability: Capability,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_output")]
    pub output: ToolOutput,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

fn default_output() -> ToolOutput {
    ToolOutput::Lines
}

pub struct ExternalTool {
    spec: ExternalToolSpec,
}

impl ExternalTool {
    pub fn new(spec: ExternalToolSpec) -> Self {
        Self { spec }
    }

    /// `subfinder -silent -d {host}`
    pub fn subfinder() -> Self {
        Self::new(ExternalToolSpec {
            id: "external-subfinder".into(),
            capability: Capability::Discover,
            program: "subfinder".into(),
            args: vec!["-silent".into(), "-d".into(), "{host}".into()],
            output: ToolOutput::Lines,
            concurrency: Some(2),
        })
    }

    /// `nuclei -silent -jsonl -u {target}`
    pub fn nuclei() -> Self {
        Self::new(ExternalToolSpec {
            id: "external-nuclei".into(),
            capability: Capability::Detect,
            program: "nuclei".into(),
            args: vec!["-silent".into(), "-jsonl".into(), "-u".into(), "{target}".into()],
            output: ToolOutput::JsonLines,
            concurrency: Some(4),
        })
    }

    fn render_args(&self, target: &SubTarget) -> Vec<String> {
        self.spec
            .args
            .iter()
            .map(|a| a.replace("{target}", &target.value).replace("{host}", target.host()))
            .collect()
    }

    fn parse(&self, stdout: &str) -> EngineOutput {
        let lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
        match self.spec.output {
            ToolOutput::Lines => EngineOutput::discovered(lines.map(str::to_string).collect()),
            ToolOutput::JsonLines => {
                EngineOutput::findings(lines.filter_map(parse_json_finding).collect())
            }
        }
    }
}

fn text<'a>(value: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .find_map(|p| value.pointer(p).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// One JSON result line; unparseable lines are skipped.
#[must_use]
pub fn parse_json_finding(line: &str) -> Option<FindingDraft> {
    let value: Value = serde_json::from_str(line).ok()?;
    if !value.is_object() {
        return None;
    }
    let finding_type = text(&value, &["/template-id", "/type"]).unwrap_or("external");
    let title = text(&value, &["/info/name", "/title"]).unwrap_or(finding_type);
    let severity = text(&value, &["/info/severity", "/severity"]).map_or(Severity::Info, Severity::parse_lenient);

    let mut draft = FindingDraft::new(finding_type, title).with_severity(severity);
    if let Some(signature) = text(&value, &["/signature", "/matcher-name", "/matched-at"]) {
        draft = draft.with_signature(signature);
    }
    Some(draft.with_evidence(value))
}

#[async_trait]
impl Engine for ExternalTool {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn capability(&self) -> Capability {
        self.spec.capability
    }

    fn concurrency_limit(&self) -> Option<usize> {
        self.spec.concurrency
    }

    #[instrument(skip(self, ctx), fields(tool = %self.spec.id, target = %target.value))]
    async fn invoke(
        &self,
        target: &SubTarget,
        ctx: &InvokeContext,
    ) -> Result<EngineOutput, EngineError> {
        let args = self.render_args(target);
        info!(command = %self.spec.program, ?args, "launching external tool");

        let child = Command::new(&self.spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => EngineError::Fatal(format!("{} not installed", self.spec.program)),
                _ => EngineError::from_io(&e, ctx.timeout),
            })?;

        let out = timeout(ctx.timeout, child.wait_with_output())
            .await
            .map_err(|_| EngineError::Timeout(ctx.timeout))?
            .map_err(|e| EngineError::from_io(&e, ctx.timeout))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let excerpt: String = stderr.trim().chars().take(512).collect();
            warn!(status = %out.status, "external tool failed");
            return Err(EngineError::Fatal(format!("{} exited with {}: {excerpt}", self.spec.program, out.status)));
        }

        Ok(self.parse(&String::from_utf8_lossy(&out.stdout)))
    }
}
