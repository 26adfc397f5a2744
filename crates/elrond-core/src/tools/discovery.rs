/// Tool discovery: resolves catalog ids to executables on disk.
///
/// Lookup order:
/// 1. The session cache (positive and negative results).
/// 2. The catalog's search directories for the current platform.
/// 3. The system executable search path (`PATH`).
///
/// Tool locations are assumed stable for one process run, so a result is
/// never invalidated implicitly. [`ToolDiscovery::clear_cache`] exists for
/// tests and long-lived hosts that install tools at runtime.
use crate::error::ExecError;
use crate::platform::Platform;
use crate::tools::catalog::{ToolCatalog, ToolDefinition};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Windows executable extensions tried when a catalog name has none.
const WINDOWS_EXTENSIONS: &[&str] = &["exe", "cmd", "bat", "ps1"];

/// A cached discovery outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResolution {
    pub tool_id: String,
    /// `None` when the tool was searched for and not found.
    pub resolved_path: Option<PathBuf>,
    pub resolved_at: DateTime<Utc>,
}

/// Session-scoped resolver. Shared by reference (`Arc`) between the
/// executor and anything else that needs tool paths.
pub struct ToolDiscovery {
    catalog: Arc<ToolCatalog>,
    platform: Platform,
    system_path: Vec<PathBuf>,
    cache: RwLock<HashMap<String, ToolResolution>>,
    scans: AtomicUsize,
}

impl ToolDiscovery {
    /// Discovery for the current platform using the process `PATH`.
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        let system_path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self {
            catalog,
            platform: Platform::current(),
            system_path,
            cache: RwLock::new(HashMap::new()),
            scans: AtomicUsize::new(0),
        }
    }

    /// Replace the system search path (stage 3). An empty vector disables it.
    pub fn with_system_path(mut self, dirs: Vec<PathBuf>) -> Self {
        self.system_path = dirs;
        self
    }

    /// Resolve for a platform other than the host's.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Resolve `tool_id` to an executable path.
    pub fn discover(&self, tool_id: &str) -> Result<PathBuf, ExecError> {
        self.resolve(tool_id)
            .resolved_path
            .ok_or_else(|| ExecError::ToolNotFound {
                tool_id: tool_id.to_owned(),
                suggestion: self.suggestion(tool_id),
            })
    }

    /// Cached resolution for `tool_id`, scanning the filesystem on first use.
    pub fn resolve(&self, tool_id: &str) -> ToolResolution {
        if let Some(hit) = self.cache.read().get(tool_id) {
            return hit.clone();
        }

        let resolved_path = self.scan(tool_id);
        let resolution = ToolResolution {
            tool_id: tool_id.to_owned(),
            resolved_path,
            resolved_at: Utc::now(),
        };

        // A concurrent caller may have scanned too; the first insert wins so
        // every caller observes the same path.
        self.cache
            .write()
            .entry(tool_id.to_owned())
            .or_insert(resolution)
            .clone()
    }

    pub fn is_available(&self, tool_id: &str) -> bool {
        self.resolve(tool_id).resolved_path.is_some()
    }

    /// Install hint for `tool_id` on this platform.
    pub fn suggestion(&self, tool_id: &str) -> String {
        match self.catalog.get(tool_id) {
            Some(def) => def.install_hint_for(self.platform),
            None => format!("'{tool_id}' has no entry in the tool catalog"),
        }
    }

    /// Number of filesystem scans performed since creation or the last
    /// [`Self::clear_cache`].
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    /// Snapshot of every cached resolution.
    pub fn cached(&self) -> Vec<ToolResolution> {
        let mut all: Vec<_> = self.cache.read().values().cloned().collect();
        all.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        all
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
        self.scans.store(0, Ordering::Relaxed);
    }

    fn scan(&self, tool_id: &str) -> Option<PathBuf> {
        self.scans.fetch_add(1, Ordering::Relaxed);

        let Some(def) = self.catalog.get(tool_id) else {
            debug!("Discovery: '{tool_id}' is not in the catalog");
            return None;
        };
        if !def.applies_to(self.platform) {
            debug!("Discovery: '{tool_id}' does not apply to {}", self.platform);
            return None;
        }

        let catalog_dirs = def
            .search_paths_for(self.platform)
            .iter()
            .filter_map(|raw| expand_path(raw));
        if let Some(found) = self.find_in(def, catalog_dirs) {
            debug!("Discovery: '{tool_id}' -> {} (catalog path)", found.display());
            return Some(found);
        }

        if let Some(found) = self.find_in(def, self.system_path.iter().cloned()) {
            debug!("Discovery: '{tool_id}' -> {} (PATH)", found.display());
            return Some(found);
        }

        debug!("Discovery: '{tool_id}' not found");
        None
    }

    fn find_in(
        &self,
        def: &ToolDefinition,
        dirs: impl Iterator<Item = PathBuf>,
    ) -> Option<PathBuf> {
        for dir in dirs {
            for name in &def.executable_names {
                for candidate in candidate_names(name, self.platform) {
                    let path = dir.join(&candidate);
                    if is_executable(&path) {
                        return Some(path);
                    }
                }
            }
        }
        None
    }
}

/// File names to try for `name`. On Windows a bare name is also tried with
/// each executable extension.
fn candidate_names(name: &str, platform: Platform) -> Vec<String> {
    let mut names = vec![name.to_owned()];
    if platform == Platform::Windows && Path::new(name).extension().is_none() {
        names.extend(WINDOWS_EXTENSIONS.iter().map(|ext| format!("{name}.{ext}")));
    }
    names
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Expand a leading `~` and `%VAR%` / `$VAR` / `${VAR}` references.
///
/// Returns `None` when a referenced variable is unset, so the directory is
/// skipped rather than searched under a half-expanded path.
pub fn expand_path(raw: &str) -> Option<PathBuf> {
    expand_with(raw, |key| std::env::var(key).ok())
}

fn expand_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    if let Some(stripped) = rest.strip_prefix('~') {
        if stripped.is_empty() || stripped.starts_with(|c| c == '/' || c == '\\') {
            out.push_str(&lookup("HOME").or_else(|| lookup("USERPROFILE"))?);
            rest = stripped;
        }
    }

    while let Some(pos) = rest.find(|c| c == '%' || c == '$') {
        out.push_str(&rest[..pos]);
        let marker = rest.as_bytes()[pos];
        let after = &rest[pos + 1..];
        let (name, remainder) = if marker == b'%' {
            match after.find('%') {
                Some(end) => (&after[..end], &after[end + 1..]),
                None => {
                    out.push('%');
                    rest = after;
                    continue;
                }
            }
        } else if let Some(braced) = after.strip_prefix('{') {
            let end = braced.find('}')?;
            (&braced[..end], &braced[end + 1..])
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], &after[end..])
        };
        if name.is_empty() {
            out.push(marker as char);
            rest = after;
            continue;
        }
        out.push_str(&lookup(name)?);
        rest = remainder;
    }
    out.push_str(rest);
    Some(PathBuf::from(out))
}
