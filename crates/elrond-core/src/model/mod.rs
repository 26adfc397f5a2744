/// Data model: image descriptors, mount records and execution results.
///
/// All types here are plain values. Mount records are owned by the
/// [`crate::registry::MountRegistry`]; execution results are handed to the
/// caller and never retained.
pub mod execution;
pub mod image;
pub mod mount;

pub use execution::ExecutionResult;
pub use image::{ImageDescriptor, ImageType};
pub use mount::{MountBackend, MountRecord};
