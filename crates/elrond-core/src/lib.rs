//! Elrond Core: image mounting and forensic tool execution.
//!
//! This crate contains all mount, discovery and execution logic with zero
//! CLI dependencies. Front-ends (the `elrond` binary, job runners, tests)
//! drive it through a small blocking API.
//!
//! # Modules
//!
//! - [`model`]: Image, mount-record and execution data types.
//! - [`identify`]: Content-signature image type identification.
//! - [`tools`]: Declarative tool catalog, discovery and dependency checks.
//! - [`exec`]: Argument-vector process execution with timeout and cancellation.
//! - [`platform`]: Per-OS mount adapters with ordered backend fallback.
//! - [`registry`]: Process-wide authority over active mounts.
//! - [`config`]: Runtime configuration (pool sizes, catalog location).
//! - [`error`]: Error taxonomy shared by all of the above.
pub mod config;
pub mod error;
pub mod exec;
pub mod identify;
pub mod model;
pub mod platform;
pub mod registry;
pub mod tools;

pub use config::ElrondConfig;
pub use error::{CatalogError, ConfigError, ExecError, MountError};
pub use exec::{CancelToken, CommandExecutor, ExecOptions};
pub use identify::identify;
pub use model::{ExecutionResult, ImageDescriptor, ImageType, MountBackend, MountRecord};
pub use platform::{create_adapter, Platform, PlatformAdapter, UnmountMode};
pub use registry::{MountOptions, MountRegistry};
pub use tools::{check_dependencies, DependencyReport, ToolCatalog, ToolDiscovery};
