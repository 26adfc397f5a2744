/// Windows backends: Arsenal Image Mounter (`aim_cli`) and PowerShell
/// `Mount-DiskImage`.
///
/// Mount points are drive letters. Every value handed to PowerShell travels
/// through `ELROND_*` environment variables read by constant scripts, so an
/// image path can never change what a script does.
use super::adapter::{or_release, Adapter, AttachContext, Attachment, Backends, ToolContext};
use super::paths::to_extended_length;
use super::pool::MountPointPool;
use super::Platform;
use crate::config::ElrondConfig;
use crate::error::{AttemptFailure, BackendAttempt, ConfigError, MountError};
use crate::exec::{CommandExecutor, ExecOptions};
use crate::model::{ExecutionResult, ImageDescriptor, ImageType, MountBackend};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

pub type WindowsAdapter = Adapter<WindowsBackends>;

impl Adapter<WindowsBackends> {
    pub fn from_config(
        config: &ElrondConfig,
        executor: Arc<CommandExecutor>,
    ) -> Result<Self, ConfigError> {
        let (first, last) = config.drive_letter_range()?;
        Ok(Adapter::new(
            WindowsBackends::default(),
            executor,
            MountPointPool::drive_letters(first, last),
            Vec::new(),
            config.assume_elevated,
            config.default_timeout(),
        ))
    }
}

const AIM_TOOL: &str = "aim_cli";
const POWERSHELL_TOOL: &str = "powershell";

const AIM_DOWNLOAD: &str = "https://arsenalrecon.com/downloads";

const POWERSHELL_ARGS: [&str; 4] = ["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass"];

/// Prints the base directory of the installed `Arsenal.ImageMounter` module.
const MODULE_BASE_SCRIPT: &str = "(Get-Module -ListAvailable -Name Arsenal.ImageMounter | \
     Sort-Object Version -Descending | Select-Object -First 1).ModuleBase";

/// Gives the largest non-reserved partition of disk `ELROND_DISK_NUMBER`
/// the letter `ELROND_DRIVE_LETTER`.
const ASSIGN_LETTER_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$disk = [int]$env:ELROND_DISK_NUMBER
$part = Get-Partition -DiskNumber $disk |
    Where-Object { $_.Type -ne 'Reserved' -and $_.Size -gt 0 } |
    Sort-Object Size -Descending | Select-Object -First 1
if (-not $part) { throw "no mountable partition on disk $disk" }
$part | Set-Partition -NewDriveLetter $env:ELROND_DRIVE_LETTER
"#;

/// Mounts `ELROND_IMAGE_PATH` with `Mount-DiskImage` and assigns
/// `ELROND_DRIVE_LETTER`. Dismounts again if anything after the attach fails.
const MOUNT_DISK_IMAGE_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$image = $env:ELROND_IMAGE_PATH
$letter = $env:ELROND_DRIVE_LETTER
$mounted = Mount-DiskImage -ImagePath $image -StorageType $env:ELROND_STORAGE_TYPE `
    -Access $env:ELROND_ACCESS -NoDriveLetter -PassThru
try {
    if ($env:ELROND_STORAGE_TYPE -eq 'ISO') {
        $volume = $mounted | Get-Volume
        $cim = Get-CimInstance Win32_Volume | Where-Object { $_.DeviceID -eq $volume.Path }
        Set-CimInstance -InputObject $cim -Property @{ DriveLetter = "${letter}:" }
    } else {
        $part = $mounted | Get-Disk | Get-Partition |
            Where-Object { $_.Type -ne 'Reserved' -and $_.Size -gt 0 } |
            Sort-Object Size -Descending | Select-Object -First 1
        if (-not $part) { throw 'no mountable partition in image' }
        $part | Set-Partition -NewDriveLetter $letter
    }
    (Get-DiskImage -ImagePath $image).DevicePath
} catch {
    Dismount-DiskImage -ImagePath $image -ErrorAction SilentlyContinue | Out-Null
    throw
}
"#;

const DISMOUNT_DISK_IMAGE_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
Dismount-DiskImage -ImagePath $env:ELROND_IMAGE_PATH | Out-Null
"#;

#[derive(Debug, Default)]
pub struct WindowsBackends {
    /// `aim_cli.exe` found inside the PowerShell module, looked up once.
    module_aim_cli: OnceLock<Option<PathBuf>>,
}

const ARSENAL: &[MountBackend] = &[MountBackend::Arsenal];
const VIRTUAL_DISK: &[MountBackend] = &[MountBackend::Arsenal, MountBackend::MountDiskImage];
const OPTICAL: &[MountBackend] = &[MountBackend::MountDiskImage];

impl Backends for WindowsBackends {
    const PLATFORM: Platform = Platform::Windows;

    fn candidates(&self, image_type: ImageType) -> &'static [MountBackend] {
        match image_type {
            ImageType::Ewf | ImageType::Vmdk | ImageType::Raw | ImageType::Unknown => ARSENAL,
            ImageType::Vhd | ImageType::Vhdx => VIRTUAL_DISK,
            ImageType::Iso => OPTICAL,
            ImageType::Dmg | ImageType::Apfs => &[],
        }
    }

    fn requires_privilege(&self, backend: MountBackend) -> bool {
        matches!(backend, MountBackend::Arsenal | MountBackend::MountDiskImage)
    }

    fn attach(
        &self,
        ctx: &AttachContext<'_>,
        backend: MountBackend,
    ) -> Result<Attachment, AttemptFailure> {
        match backend {
            MountBackend::Arsenal => self.attach_arsenal(ctx),
            MountBackend::MountDiskImage => attach_disk_image(ctx),
            other => Err(AttemptFailure::Unavailable(format!(
                "{other} is not a Windows backend"
            ))),
        }
    }

    fn detach(
        &self,
        tools: &ToolContext<'_>,
        attachment: &Attachment,
        force: bool,
    ) -> Result<(), String> {
        match attachment.backend {
            MountBackend::Arsenal => {
                let aim = self.aim_cli(tools).map_err(|e| e.to_string())?;
                let device = attachment
                    .device
                    .as_deref()
                    .ok_or_else(|| format!("no AIM device for {}", attachment.mount_point.display()))?;
                aim_dismount(tools, &aim, device, force)
                    .map(drop)
                    .map_err(|e| e.to_string())
            }
            MountBackend::MountDiskImage => {
                let opts = ExecOptions::default().env(
                    "ELROND_IMAGE_PATH",
                    to_extended_length(&attachment.image_path).display().to_string(),
                );
                powershell(tools, DISMOUNT_DISK_IMAGE_SCRIPT, opts)
                    .map(drop)
                    .map_err(|e| e.to_string())
            }
            other => Err(format!("{other} is not a Windows backend")),
        }
    }

    fn unavailable_guidance(
        &self,
        image: &ImageDescriptor,
        attempts: &[BackendAttempt],
    ) -> Option<MountError> {
        if attempts.is_empty() || !attempts.iter().all(|a| a.reason.is_unavailable()) {
            return None;
        }
        Some(MountError::BackendUnavailable {
            missing: describe_missing(attempts),
            guidance: guidance_for(image.detected_type),
        })
    }

    fn permission_message(&self, elevated: bool) -> String {
        if elevated {
            "running as Administrator: all Windows mount backends are available".to_owned()
        } else {
            "not running as Administrator: Arsenal Image Mounter and Mount-DiskImage both \
             need an elevated prompt (Run as administrator)"
                .to_owned()
        }
    }
}

// ── Arsenal Image Mounter ────────────────────────────────────────────────────

impl WindowsBackends {
    /// `aim_cli` from the catalog search paths, else from the installed
    /// `Arsenal.ImageMounter` PowerShell module.
    fn aim_cli(&self, tools: &ToolContext<'_>) -> Result<PathBuf, AttemptFailure> {
        let not_found = match tools.executor().discovery().discover(AIM_TOOL) {
            Ok(path) => return Ok(path),
            Err(err) => err,
        };
        self.module_aim_cli
            .get_or_init(|| find_module_aim_cli(tools))
            .clone()
            .ok_or_else(|| not_found.into())
    }

    fn attach_arsenal(&self, ctx: &AttachContext<'_>) -> Result<Attachment, AttemptFailure> {
        let aim = self.aim_cli(&ctx.tools)?;
        let letter = drive_letter(ctx.mount_point)?;

        let mut args = vec!["--mount".to_owned()];
        if ctx.read_only {
            args.push("--readonly".to_owned());
        }
        args.push(format!("--filename={}", ctx.image.path.display()));
        args.push(format!("--provider={}", aim_provider(ctx.image.detected_type)));
        args.push("--background".to_owned());

        let result = ctx
            .tools
            .run_program(AIM_TOOL, &aim, &args, ExecOptions::default())?;
        let device = parse_aim_device(&result.stdout);
        let (device, disk) = match (device, parse_aim_disk(&result.stdout)) {
            (Some(device), Some(disk)) => (device, disk),
            (device, _) => {
                // The image is attached somewhere even though the output
                // could not be read; dismount whatever it produced.
                let failure = AttemptFailure::unusable_output(
                    "aim_cli reported no device and disk number",
                    result,
                );
                return or_release(Err(failure), "aim_cli output parsing", || {
                    release_unreported_aim(ctx, &aim, device)
                });
            }
        };
        info!("Arsenal attached {} as device {device} (disk {disk})", ctx.image.path.display());

        let opts = ExecOptions::default()
            .env("ELROND_DISK_NUMBER", disk.to_string())
            .env("ELROND_DRIVE_LETTER", letter.to_string());
        let assigned = powershell(&ctx.tools, ASSIGN_LETTER_SCRIPT, opts)
            .map(drop)
            .map_err(AttemptFailure::from);
        or_release(assigned, "drive letter assignment", || {
            aim_dismount(&ctx.tools, &aim, &device, true)
                .map(drop)
                .map_err(|e| e.to_string())
        })?;

        Ok(Attachment {
            backend: MountBackend::Arsenal,
            image_path: ctx.image.path.clone(),
            mount_point: ctx.mount_point.to_path_buf(),
            device: Some(device),
            claimed_device: None,
        })
    }
}

fn find_module_aim_cli(tools: &ToolContext<'_>) -> Option<PathBuf> {
    let base = match powershell(tools, MODULE_BASE_SCRIPT, ExecOptions::default()) {
        Ok(result) => result.stdout.trim().to_owned(),
        Err(err) => {
            debug!("Arsenal.ImageMounter module lookup failed: {err}");
            return None;
        }
    };
    if base.is_empty() {
        return None;
    }
    let candidate = Path::new(&base).join("aim_cli.exe");
    if candidate.is_file() {
        info!("Using aim_cli from PowerShell module at {}", candidate.display());
        Some(candidate)
    } else {
        debug!("Arsenal.ImageMounter module at {base} has no aim_cli.exe");
        None
    }
}

fn aim_dismount(
    tools: &ToolContext<'_>,
    aim: &Path,
    device: &str,
    force: bool,
) -> Result<ExecutionResult, crate::error::ExecError> {
    let mut args = vec![format!("--dismount={device}")];
    if force {
        args.push("--force".to_owned());
    }
    tools.run_program(AIM_TOOL, aim, &args, ExecOptions::default())
}

/// Dismount `device`, or every AIM device backed by the image when the
/// device number itself is unknown.
fn release_unreported_aim(
    ctx: &AttachContext<'_>,
    aim: &Path,
    device: Option<String>,
) -> Result<(), String> {
    let devices = match device {
        Some(device) => vec![device],
        None => {
            let listing = ctx
                .tools
                .run_program(AIM_TOOL, aim, &["--list"], ExecOptions::default())
                .map_err(|e| e.to_string())?;
            aim_devices_for_image(&listing.stdout, &ctx.image.path)
        }
    };
    if devices.is_empty() {
        return Err(format!(
            "no AIM device found for {}",
            ctx.image.path.display()
        ));
    }
    let failures: Vec<String> = devices
        .iter()
        .filter_map(|device| aim_dismount(&ctx.tools, aim, device, true).err())
        .map(|e| e.to_string())
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

fn aim_provider(image_type: ImageType) -> &'static str {
    match image_type {
        ImageType::Ewf => "LibEwf",
        _ => "DiscUtils",
    }
}

/// AIM device number from `aim_cli` output, e.g. `Device number 000001`.
fn parse_aim_device(stdout: &str) -> Option<String> {
    let pos = stdout.to_ascii_lowercase().find("device number")?;
    let digits: String = stdout[pos + "device number".len()..]
        .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
        .chars()
        .take_while(char::is_ascii_hexdigit)
        .collect();
    (!digits.is_empty()).then_some(digits)
}

/// Physical disk number from `aim_cli` output, e.g. `\\?\PhysicalDrive3`.
fn parse_aim_disk(stdout: &str) -> Option<u32> {
    let pos = stdout.to_ascii_lowercase().find("physicaldrive")?;
    stdout[pos + "physicaldrive".len()..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()
}

/// Device numbers in `aim_cli --list` output whose entry names `image`.
/// An entry starts at its `Device number` line and names the image file on
/// a following line.
fn aim_devices_for_image(listing: &str, image: &Path) -> Vec<String> {
    let needle = image.to_string_lossy().to_ascii_lowercase();
    let mut devices = Vec::new();
    let mut current: Option<String> = None;
    for line in listing.lines() {
        if let Some(device) = parse_aim_device(line) {
            current = Some(device);
        } else if line.to_ascii_lowercase().contains(&needle) {
            if let Some(device) = current.take() {
                devices.push(device);
            }
        }
    }
    devices
}

// ── Mount-DiskImage ──────────────────────────────────────────────────────────

fn attach_disk_image(ctx: &AttachContext<'_>) -> Result<Attachment, AttemptFailure> {
    let storage_type = match ctx.image.detected_type {
        ImageType::Iso => "ISO",
        ImageType::Vhd => "VHD",
        ImageType::Vhdx => "VHDX",
        other => {
            return Err(AttemptFailure::Unavailable(format!(
                "Mount-DiskImage cannot attach {other} images"
            )))
        }
    };
    let letter = drive_letter(ctx.mount_point)?;
    let access = if ctx.read_only { "ReadOnly" } else { "ReadWrite" };

    let opts = ExecOptions::default()
        .env(
            "ELROND_IMAGE_PATH",
            to_extended_length(&ctx.image.path).display().to_string(),
        )
        .env("ELROND_DRIVE_LETTER", letter.to_string())
        .env("ELROND_STORAGE_TYPE", storage_type)
        .env("ELROND_ACCESS", access);
    let result = powershell(&ctx.tools, MOUNT_DISK_IMAGE_SCRIPT, opts)?;
    let device = result.stdout_lines().last().map(str::to_owned);

    Ok(Attachment {
        backend: MountBackend::MountDiskImage,
        image_path: ctx.image.path.clone(),
        mount_point: ctx.mount_point.to_path_buf(),
        device,
        claimed_device: None,
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn powershell(
    tools: &ToolContext<'_>,
    script: &str,
    opts: ExecOptions,
) -> Result<ExecutionResult, crate::error::ExecError> {
    let mut args: Vec<&str> = POWERSHELL_ARGS.to_vec();
    args.extend(["-Command", script]);
    tools.run_with(POWERSHELL_TOOL, &args, opts)
}

/// `M:\` -> `M`.
fn drive_letter(mount_point: &Path) -> Result<char, AttemptFailure> {
    mount_point
        .to_string_lossy()
        .chars()
        .next()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .ok_or_else(|| {
            AttemptFailure::failed(format!(
                "{} is not a drive-letter mount point",
                mount_point.display()
            ))
        })
}

fn describe_missing(attempts: &[BackendAttempt]) -> String {
    attempts
        .iter()
        .map(|a| match &a.reason {
            AttemptFailure::ToolNotFound { tool_id, .. } => tool_id.clone(),
            other => format!("{} ({other})", a.backend),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn guidance_for(image_type: ImageType) -> String {
    let mut text = format!(
        "Install Arsenal Image Mounter ({AIM_DOWNLOAD}) and make sure aim_cli.exe is on PATH \
         or the Arsenal.ImageMounter PowerShell module is installed."
    );
    if image_type == ImageType::Ewf {
        text.push_str(
            " Alternatively mount the image under WSL2: `wsl --install`, then inside the \
             distribution `sudo apt install ewf-tools` and `ewfmount <image> <mount point>`.",
        );
    } else {
        text.push_str(
            " Alternatively mount the image under WSL2 (`wsl --install`) with qemu-nbd or a \
             loop device.",
        );
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_table() {
        let b = WindowsBackends::default();
        for t in [ImageType::Ewf, ImageType::Vmdk, ImageType::Raw, ImageType::Unknown] {
            assert_eq!(b.candidates(t), &[MountBackend::Arsenal], "{t}");
        }
        assert_eq!(
            b.candidates(ImageType::Vhdx),
            &[MountBackend::Arsenal, MountBackend::MountDiskImage]
        );
        assert_eq!(b.candidates(ImageType::Iso), &[MountBackend::MountDiskImage]);
        assert!(b.candidates(ImageType::Dmg).is_empty());
        assert!(b.requires_privilege(MountBackend::Arsenal));
    }

    #[test]
    fn test_parse_aim_device_and_disk() {
        let out = "Mounting image...\r\nDevice number 000003\r\n\
                   Device is \\\\?\\PhysicalDrive4\r\nMounted read only.\r\n";
        assert_eq!(parse_aim_device(out).as_deref(), Some("000003"));
        assert_eq!(parse_aim_disk(out), Some(4));
        assert_eq!(parse_aim_device("Device number: 2\nPhysicalDrive12\n").as_deref(), Some("2"));
        assert_eq!(parse_aim_disk("Device number: 2\nPhysicalDrive12\n"), Some(12));
        assert_eq!(parse_aim_device("Error: access denied\n"), None);
        assert_eq!(parse_aim_disk("Device number 000001\n"), None);
    }

    #[test]
    fn test_aim_devices_for_image_matches_listing_entries() {
        let listing = "Device number 000000\n  Image file: C:\\Evidence\\other.E01\n\
                       Device number 000004\n  Image file: C:\\Evidence\\Case.E01\n\
                       Device number 000005\n  Image file: D:\\scratch.vhd\n";
        assert_eq!(
            aim_devices_for_image(listing, Path::new(r"c:\evidence\case.e01")),
            vec!["000004".to_owned()]
        );
        assert!(aim_devices_for_image(listing, Path::new(r"C:\nothing.dd")).is_empty());
    }

    #[test]
    fn test_drive_letter_from_mount_point() {
        assert_eq!(drive_letter(Path::new("m:\\")), Ok('M'));
        assert!(drive_letter(Path::new("/mnt/x")).is_err());
    }

    #[test]
    fn test_guidance_only_when_every_backend_is_missing() {
        let b = WindowsBackends::default();
        let image = ImageDescriptor {
            path: PathBuf::from(r"C:\Evidence\disk.E01"),
            detected_type: ImageType::Ewf,
            size_bytes: 1024,
        };
        let missing = [BackendAttempt {
            backend: MountBackend::Arsenal,
            reason: AttemptFailure::ToolNotFound {
                tool_id: "aim_cli".into(),
                suggestion: String::new(),
            },
        }];
        match b.unavailable_guidance(&image, &missing) {
            Some(MountError::BackendUnavailable { missing, guidance }) => {
                assert_eq!(missing, "aim_cli");
                assert!(guidance.contains("wsl --install"));
                assert!(guidance.contains("ewf-tools"));
            }
            other => panic!("unexpected guidance: {other:?}"),
        }

        let failed = [BackendAttempt {
            backend: MountBackend::Arsenal,
            reason: AttemptFailure::failed("driver not loaded"),
        }];
        assert!(b.unavailable_guidance(&image, &failed).is_none());
    }

    #[test]
    fn test_scripts_take_input_only_from_environment() {
        for script in [MOUNT_DISK_IMAGE_SCRIPT, ASSIGN_LETTER_SCRIPT, DISMOUNT_DISK_IMAGE_SCRIPT] {
            assert!(script.contains("$env:ELROND_"));
            assert!(!script.contains("{}"));
        }
    }
}
