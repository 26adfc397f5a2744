/// Image type identification by content signature with extension fallback.
///
/// Reads a 64 KiB leading window (large enough to reach the ISO9660 primary
/// volume descriptor at sector 16) plus the trailing 512 bytes, where VHD
/// and UDIF (DMG) footers live. Signatures always win over the extension;
/// the extension is consulted only when the bytes are unreadable or match
/// nothing known.
use crate::model::ImageType;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Size of the leading window read from every image.
pub const HEAD_WINDOW: usize = 64 * 1024;

/// Size of the trailing footer window.
pub const TAIL_WINDOW: usize = 512;

const EWF_V1: &[u8] = b"EVF\x09\x0d\x0a\xff\x00";
const EWF_V2: &[u8] = b"EVF2\x0d\x0a\x81\x00";
const EWF_LOGICAL: &[u8] = b"LVF\x09\x0d\x0a\xff\x00";
const VHDX: &[u8] = b"vhdxfile";
const VMDK_SPARSE: &[u8] = b"KDMV";
const VMDK_DESCRIPTOR: &[u8] = b"# Disk DescriptorFile";
const APFS_NXSB: &[u8] = b"NXSB";
const APFS_NXSB_OFFSET: usize = 32;
const DMG_ENCRYPTED: &[u8] = b"encrcdsa";
const ISO9660: &[u8] = b"CD001";
const ISO9660_OFFSET: usize = 0x8001;
const VHD_FOOTER: &[u8] = b"conectix";
const UDIF_TRAILER: &[u8] = b"koly";
const GPT_HEADER: &[u8] = b"EFI PART";
const GPT_OFFSET: usize = 512;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_SIGNATURE_OFFSET: usize = 510;

/// Classify the image at `path`. Never fails: unreadable files fall back to
/// extension mapping and finally to [`ImageType::Unknown`].
pub fn identify(path: &Path) -> ImageType {
    let ext = path.extension().and_then(|e| e.to_str());
    match read_windows(path) {
        Ok((head, tail)) => identify_bytes(&head, &tail, ext),
        Err(e) => {
            tracing::debug!("identify: cannot read {}: {e}", path.display());
            identify_bytes(&[], &[], ext)
        }
    }
}

/// Pure classification over a leading window, a trailing window and an
/// optional extension.
pub fn identify_bytes(head: &[u8], tail: &[u8], extension: Option<&str>) -> ImageType {
    if let Some(ty) = match_signature(head, tail) {
        return ty;
    }
    extension
        .and_then(ImageType::from_extension)
        .unwrap_or(ImageType::Unknown)
}

fn match_signature(head: &[u8], tail: &[u8]) -> Option<ImageType> {
    if [EWF_V1, EWF_V2, EWF_LOGICAL]
        .iter()
        .any(|sig| head.starts_with(sig))
    {
        return Some(ImageType::Ewf);
    }
    if head.starts_with(VHDX) {
        return Some(ImageType::Vhdx);
    }
    if head.starts_with(VMDK_SPARSE) || head.starts_with(VMDK_DESCRIPTOR) {
        return Some(ImageType::Vmdk);
    }
    if at(head, APFS_NXSB_OFFSET, APFS_NXSB) {
        return Some(ImageType::Apfs);
    }
    if head.starts_with(DMG_ENCRYPTED) {
        return Some(ImageType::Dmg);
    }
    if at(head, ISO9660_OFFSET, ISO9660) {
        return Some(ImageType::Iso);
    }

    // Footers are checked before partition tables: a fixed VHD is a raw
    // disk followed by a footer, and UDIF images often embed an MBR.
    if tail.starts_with(VHD_FOOTER) || head.starts_with(VHD_FOOTER) {
        return Some(ImageType::Vhd);
    }
    if tail.starts_with(UDIF_TRAILER) {
        return Some(ImageType::Dmg);
    }

    if at(head, GPT_OFFSET, GPT_HEADER) || at(head, MBR_SIGNATURE_OFFSET, &MBR_SIGNATURE) {
        return Some(ImageType::Raw);
    }
    None
}

fn at(buf: &[u8], offset: usize, sig: &[u8]) -> bool {
    buf.get(offset..offset + sig.len()) == Some(sig)
}

/// Read the head and tail windows. Files shorter than the head window yield
/// a short head and a tail taken from whatever lies beyond it.
fn read_windows(path: &Path) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut head = Vec::with_capacity(HEAD_WINDOW);
    (&mut file).take(HEAD_WINDOW as u64).read_to_end(&mut head)?;

    let mut tail = Vec::new();
    if len >= (TAIL_WINDOW as u64) * 2 {
        file.seek(SeekFrom::Start(len - TAIL_WINDOW as u64))?;
        file.take(TAIL_WINDOW as u64).read_to_end(&mut tail)?;
    }
    Ok((head, tail))
}
