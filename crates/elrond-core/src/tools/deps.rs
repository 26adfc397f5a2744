/// Dependency reporting over the tool catalog.
///
/// Discovery for each tool runs on the rayon pool; [`ToolDiscovery`] is
/// internally synchronised and each id is scanned at most once.
use crate::error::ExecError;
use crate::exec::{CommandExecutor, ExecOptions};
use crate::tools::discovery::ToolDiscovery;
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for a version probe; version flags should return instantly.
const VERSION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct AvailableTool {
    pub id: String,
    pub category: String,
    pub path: PathBuf,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissingTool {
    pub id: String,
    pub category: String,
    pub required: bool,
    pub suggestion: String,
}

/// Result of [`check_dependencies`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyReport {
    pub available: Vec<AvailableTool>,
    pub missing: Vec<MissingTool>,
}

impl DependencyReport {
    /// True when no *required* tool is missing.
    pub fn is_satisfied(&self) -> bool {
        !self.missing.iter().any(|m| m.required)
    }
}

/// Check every catalog tool applicable to the discovery platform.
///
/// With `required_only`, optional tools are left out of the report entirely.
pub fn check_dependencies(discovery: &ToolDiscovery, required_only: bool) -> DependencyReport {
    let platform = discovery.platform();
    let tools: Vec<_> = discovery
        .catalog()
        .for_platform(platform)
        .filter(|t| !required_only || t.required)
        .collect();

    let outcomes: Vec<_> = tools
        .par_iter()
        .map(|tool| (*tool, discovery.resolve(&tool.id).resolved_path))
        .collect();

    let mut report = DependencyReport::default();
    for (tool, path) in outcomes {
        match path {
            Some(path) => report.available.push(AvailableTool {
                id: tool.id.clone(),
                category: tool.category.clone(),
                path,
                required: tool.required,
            }),
            None => report.missing.push(MissingTool {
                id: tool.id.clone(),
                category: tool.category.clone(),
                required: tool.required,
                suggestion: tool.install_hint_for(platform),
            }),
        }
    }
    tracing::info!(
        "Dependency check: {} available, {} missing",
        report.available.len(),
        report.missing.len()
    );
    report
}

/// Outcome of a version probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VersionStatus {
    /// The catalog declares no version command.
    NotChecked,
    /// The version output contained no recognisable version number.
    Unparsed { output: String },
    Ok { version: String },
    TooOld { version: String, minimum: String },
}

/// Run the tool's version command and compare against `min_version`.
pub fn check_version(
    executor: &CommandExecutor,
    tool_id: &str,
) -> Result<VersionStatus, ExecError> {
    let Some(def) = executor.discovery().catalog().get(tool_id) else {
        return Ok(VersionStatus::NotChecked);
    };
    let Some(args) = def.version_command.as_ref() else {
        return Ok(VersionStatus::NotChecked);
    };

    // Many tools print their version on stderr or exit non-zero for -V.
    let output = match executor.execute_with(
        tool_id,
        args,
        &ExecOptions::default().timeout(VERSION_TIMEOUT),
    ) {
        Ok(result) => format!("{}\n{}", result.stdout, result.stderr),
        Err(ExecError::ToolExecutionFailed { stdout, stderr, .. }) => {
            format!("{stdout}\n{stderr}")
        }
        Err(other) => return Err(other),
    };

    let Some(version) = extract_version(&output) else {
        return Ok(VersionStatus::Unparsed {
            output: output.trim().chars().take(200).collect(),
        });
    };
    match def.min_version.as_deref() {
        Some(minimum) if compare_versions(&version, minimum) == Ordering::Less => {
            Ok(VersionStatus::TooOld {
                version,
                minimum: minimum.to_owned(),
            })
        }
        _ => Ok(VersionStatus::Ok { version }),
    }
}

/// First dotted version in `text`, else the first bare number.
fn extract_version(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty())
        .collect();
    tokens
        .iter()
        .find(|t| t.contains('.'))
        .or_else(|| tokens.first())
        .map(|t| t.to_string())
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
