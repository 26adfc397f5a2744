/// Image classification types.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Container or raw format of an evidence image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Expert Witness Format (`.E01`, `.Ex01`, `.L01`).
    Ewf,
    Raw,
    Vmdk,
    Dmg,
    Apfs,
    Vhd,
    Vhdx,
    Iso,
    Unknown,
}

impl ImageType {
    pub const ALL: [ImageType; 9] = [
        Self::Ewf,
        Self::Raw,
        Self::Vmdk,
        Self::Dmg,
        Self::Apfs,
        Self::Vhd,
        Self::Vhdx,
        Self::Iso,
        Self::Unknown,
    ];

    /// Short lowercase name, as used in logs and serialized records.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ewf => "ewf",
            Self::Raw => "raw",
            Self::Vmdk => "vmdk",
            Self::Dmg => "dmg",
            Self::Apfs => "apfs",
            Self::Vhd => "vhd",
            Self::Vhdx => "vhdx",
            Self::Iso => "iso",
            Self::Unknown => "unknown",
        }
    }

    /// Map a file extension (without the dot, any case) to an image type.
    ///
    /// Returns `None` for extensions that carry no format information.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        let ty = match ext.as_str() {
            "e01" | "ex01" | "l01" | "lx01" | "s01" => Self::Ewf,
            "raw" | "dd" | "img" | "001" | "bin" | "mem" | "dmp" | "vmem" => Self::Raw,
            "vmdk" => Self::Vmdk,
            "dmg" | "sparseimage" | "sparsebundle" => Self::Dmg,
            "apfs" => Self::Apfs,
            "vhd" => Self::Vhd,
            "vhdx" => Self::Vhdx,
            "iso" => Self::Iso,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// An image file classified for a single mount attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub path: PathBuf,
    pub detected_type: ImageType,
    pub size_bytes: u64,
}

impl ImageDescriptor {
    /// Stat and classify `path`.
    pub fn probe(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            detected_type: crate::identify::identify(path),
            size_bytes: meta.len(),
        })
    }
}
