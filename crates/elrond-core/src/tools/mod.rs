/// Tool metadata, discovery and dependency checks.
///
/// - [`catalog`]: The declarative, immutable tool catalog.
/// - [`discovery`]: Id to executable resolution with a session cache.
/// - [`deps`]: Availability and version reports over the catalog.
pub mod catalog;
pub mod deps;
pub mod discovery;

pub use catalog::{ToolCatalog, ToolDefinition, BUILTIN_CATALOG};
pub use deps::{
    check_dependencies, check_version, AvailableTool, DependencyReport, MissingTool,
    VersionStatus,
};
pub use discovery::{ToolDiscovery, ToolResolution};
