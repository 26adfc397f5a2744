/// Declarative tool catalog.
///
/// The catalog is configuration, not code: a JSON document listing every
/// external tool with its per-platform search paths and install hints. A
/// default catalog is embedded at build time; deployments may replace it
/// with their own file. Once loaded it is immutable for the process lifetime.
use crate::error::CatalogError;
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// The catalog shipped with the crate.
pub const BUILTIN_CATALOG: &str = include_str!("../../catalog/tools.json");

/// Metadata for one external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    /// Broad grouping, e.g. `mount`, `system`, `memory`, `timeline`.
    pub category: String,
    /// Platforms the tool applies to.
    pub platforms: Vec<Platform>,
    /// File names tried in order within each search directory.
    pub executable_names: Vec<String>,
    #[serde(default)]
    pub search_paths: BTreeMap<Platform, Vec<String>>,
    #[serde(default)]
    pub install_hint: BTreeMap<Platform, String>,
    #[serde(default)]
    pub required: bool,
    /// Arguments that make the tool print its version.
    #[serde(default)]
    pub version_command: Option<Vec<String>>,
    #[serde(default)]
    pub min_version: Option<String>,
}

impl ToolDefinition {
    pub fn applies_to(&self, platform: Platform) -> bool {
        self.platforms.contains(&platform)
    }

    pub fn search_paths_for(&self, platform: Platform) -> &[String] {
        self.search_paths
            .get(&platform)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Install suggestion for `platform`, with a generic fallback.
    pub fn install_hint_for(&self, platform: Platform) -> String {
        match self.install_hint.get(&platform) {
            Some(hint) => hint.clone(),
            None if !self.applies_to(platform) => {
                format!("'{}' is not available on {}", self.id, platform)
            }
            None => format!("install '{}' and make sure it is on PATH", self.id),
        }
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    tools: Vec<ToolDefinition>,
}

/// Immutable registry of [`ToolDefinition`]s keyed by id.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Build from already-parsed definitions, rejecting duplicate ids and
    /// entries without executables.
    pub fn new(tools: Vec<ToolDefinition>) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(tools.len());
        for (i, tool) in tools.iter().enumerate() {
            if tool.executable_names.is_empty() {
                return Err(CatalogError::NoExecutables(tool.id.clone()));
            }
            if index.insert(tool.id.clone(), i).is_some() {
                return Err(CatalogError::DuplicateId(tool.id.clone()));
            }
        }
        Ok(Self { tools, index })
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::new(file.tools)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json(&json)?;
        tracing::info!(
            "Loaded tool catalog {} ({} tools)",
            path.display(),
            catalog.len()
        );
        Ok(catalog)
    }

    /// The embedded default catalog.
    pub fn builtin() -> Self {
        Self::from_json(BUILTIN_CATALOG).expect("built-in tool catalog is valid")
    }

    /// Load `path` if given, otherwise the built-in catalog.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, CatalogError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin()),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ToolDefinition> {
        self.index.get(id).map(|&i| &self.tools[i])
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Tools applicable to `platform`, in catalog order.
    pub fn for_platform(&self, platform: Platform) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.iter().filter(move |t| t.applies_to(platform))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_parses() {
        let catalog = ToolCatalog::builtin();
        assert!(!catalog.is_empty());
        for id in ["ewfmount", "qemu-nbd", "losetup", "hdiutil", "aim_cli", "volatility3"] {
            assert!(catalog.get(id).is_some(), "built-in catalog lacks {id}");
        }
    }

    #[test]
    fn test_volatility_hint_mentions_pip() {
        let catalog = ToolCatalog::builtin();
        let vol = catalog.get("volatility3").unwrap();
        for platform in [Platform::Linux, Platform::MacOs, Platform::Windows] {
            assert!(vol.install_hint_for(platform).contains("pip install volatility3"));
        }
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let json = r#"{"tools": [
            {"id": "a", "category": "x", "platforms": ["linux"], "executable_names": ["a"]},
            {"id": "a", "category": "x", "platforms": ["linux"], "executable_names": ["b"]}
        ]}"#;
        assert!(matches!(
            ToolCatalog::from_json(json),
            Err(CatalogError::DuplicateId(id)) if id == "a"
        ));
    }

    #[test]
    fn test_tool_without_executables_is_rejected() {
        let json = r#"{"tools": [
            {"id": "a", "category": "x", "platforms": ["linux"], "executable_names": []}
        ]}"#;
        assert!(matches!(
            ToolCatalog::from_json(json),
            Err(CatalogError::NoExecutables(_))
        ));
    }

    #[test]
    fn test_platform_filter_and_fallback_hint() {
        let json = r#"{"tools": [
            {"id": "hdiutil", "category": "mount", "platforms": ["macos"], "executable_names": ["hdiutil"]},
            {"id": "fls", "category": "filesystem", "platforms": ["linux", "macos"], "executable_names": ["fls"]}
        ]}"#;
        let catalog = ToolCatalog::from_json(json).unwrap();
        let linux: Vec<_> = catalog.for_platform(Platform::Linux).map(|t| &t.id).collect();
        assert_eq!(linux, vec!["fls"]);
        let hdiutil = catalog.get("hdiutil").unwrap();
        assert!(hdiutil.install_hint_for(Platform::Linux).contains("not available"));
        assert!(catalog.get("fls").unwrap().install_hint_for(Platform::Linux).contains("PATH"));
    }
}
