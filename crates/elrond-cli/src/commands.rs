/// Subcommand handlers.
///
/// Handlers write their report to a caller-supplied writer so the output
/// can be asserted in tests; only `mount` and `exec` interact with the
/// terminal beyond that (waiting for Enter, forwarding tool output).
use crate::session::Session;
use anyhow::{bail, Context, Result};
use elrond_core::tools::{check_version, VersionStatus};
use elrond_core::{
    check_dependencies, CancelToken, DependencyReport, ExecError, ExecOptions, ImageDescriptor,
    MountOptions,
};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ── identify ─────────────────────────────────────────────────────────────────

pub fn identify(images: &[PathBuf], json: bool, out: &mut impl Write) -> Result<()> {
    let descriptors = images
        .iter()
        .map(|path| {
            ImageDescriptor::probe(path)
                .with_context(|| format!("Cannot read image {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    if json {
        #[derive(Serialize)]
        struct Row<'a> {
            path: &'a Path,
            image_type: elrond_core::ImageType,
            size_bytes: u64,
        }
        let rows: Vec<_> = descriptors
            .iter()
            .map(|d| Row {
                path: &d.path,
                image_type: d.detected_type,
                size_bytes: d.size_bytes,
            })
            .collect();
        writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
        return Ok(());
    }

    for d in &descriptors {
        writeln!(out, "{:<8} {:>16}  {}", d.detected_type, d.size_bytes, d.path.display())?;
    }
    Ok(())
}

// ── deps / tools ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct DepsOutput<'a> {
    #[serde(flatten)]
    report: &'a DependencyReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    versions: Vec<(String, VersionStatus)>,
}

pub fn deps(
    session: &Session,
    required_only: bool,
    versions: bool,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let report = check_dependencies(session.discovery(), required_only);

    let mut statuses = Vec::new();
    if versions {
        for tool in &report.available {
            match check_version(&session.executor, &tool.id) {
                Ok(status) => statuses.push((tool.id.clone(), status)),
                Err(e) => warn!("Version check for {} failed: {e}", tool.id),
            }
        }
    }

    if json {
        let output = DepsOutput {
            report: &report,
            versions: statuses,
        };
        writeln!(out, "{}", serde_json::to_string_pretty(&output)?)?;
    } else {
        for tool in &report.available {
            let version = statuses
                .iter()
                .find(|(id, _)| id == &tool.id)
                .map(|(_, status)| describe_version(status))
                .unwrap_or_default();
            writeln!(out, "  ok       {:<16} {}{version}", tool.id, tool.path.display())?;
        }
        for tool in &report.missing {
            let marker = if tool.required { "MISSING" } else { "missing" };
            writeln!(out, "  {marker:<8} {:<16} {}", tool.id, tool.suggestion)?;
        }
    }

    if !report.is_satisfied() {
        let required: Vec<_> = report
            .missing
            .iter()
            .filter(|m| m.required)
            .map(|m| m.id.as_str())
            .collect();
        bail!("Required tools missing: {}", required.join(", "));
    }
    Ok(())
}

fn describe_version(status: &VersionStatus) -> String {
    match status {
        VersionStatus::NotChecked => String::new(),
        VersionStatus::Unparsed { .. } => " (version unknown)".to_owned(),
        VersionStatus::Ok { version } => format!(" ({version})"),
        VersionStatus::TooOld { version, minimum } => {
            format!(" ({version}, older than required {minimum})")
        }
    }
}

pub fn tools(session: &Session, out: &mut impl Write) -> Result<()> {
    let discovery = session.discovery();
    let platform = discovery.platform();
    for tool in discovery.catalog().for_platform(platform) {
        let location = discovery
            .resolve(&tool.id)
            .resolved_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_owned());
        let required = if tool.required { "required" } else { "" };
        writeln!(
            out,
            "{:<16} {:<10} {:<8} {location}",
            tool.id, tool.category, required
        )?;
    }
    Ok(())
}

// ── mount ────────────────────────────────────────────────────────────────────

/// Mount `image`, print the record as JSON, then hold the mount until the
/// user presses Enter or Ctrl-C. The registry unmounts on the way out.
pub fn mount(
    session: &Session,
    image: &Path,
    mount_point: Option<PathBuf>,
    read_write: bool,
) -> Result<()> {
    let registry = session.registry()?;
    let (ok, message) = registry.adapter().check_permissions();
    if !ok {
        warn!("{message}");
    }

    let mut opts = MountOptions::default();
    if let Some(point) = mount_point {
        opts = opts.at(point);
    }
    if read_write {
        opts = opts.read_write();
    }

    let record = registry
        .mount(image, &opts)
        .with_context(|| format!("Failed to mount {}", image.display()))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    eprintln!(
        "Mounted at {} ({}). Press Enter or Ctrl-C to unmount.",
        record.mount_point.display(),
        record.created_at.with_timezone(&chrono::Local).format("%H:%M:%S")
    );

    let (done_tx, done_rx) = crossbeam_channel::bounded::<&'static str>(2);
    let ctrlc_tx = done_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.try_send("interrupt");
    })
    .context("Failed to set Ctrl-C handler")?;
    std::thread::Builder::new()
        .name("elrond-stdin".to_owned())
        .spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            let _ = done_tx.try_send("enter");
        })
        .context("Failed to spawn stdin reader")?;

    let reason = done_rx.recv().unwrap_or("channel closed");
    info!("Unmounting after {reason}");

    let errors = registry.teardown();
    if !errors.is_empty() {
        for err in &errors {
            eprintln!("error: {err}");
        }
        bail!("{} mount(s) could not be released", errors.len());
    }
    Ok(())
}

// ── exec ─────────────────────────────────────────────────────────────────────

/// Run `tool` with `args`, forwarding its output. Ctrl-C kills the tool's
/// whole process tree.
pub fn exec(session: &Session, tool: &str, args: &[String], timeout: Option<u64>) -> Result<()> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("Failed to set Ctrl-C handler")?;

    let opts = ExecOptions::default()
        .maybe_timeout(timeout.map(Duration::from_secs))
        .cancel(cancel);
    match session.executor.execute_with(tool, args, &opts) {
        Ok(result) => {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            info!("{tool} finished in {:?}", result.duration);
            Ok(())
        }
        Err(err) => {
            if let Some(captured) = err.captured() {
                print!("{}", captured.stdout);
                eprint!("{}", captured.stderr);
            }
            if let ExecError::ToolNotFound { suggestion, .. } = &err {
                eprintln!("hint: {suggestion}");
            }
            Err(err.into())
        }
    }
}
