/// Lexical path normalisation per platform syntax.
///
/// Nothing here touches the filesystem, so the Windows rules can be
/// exercised on any host. Unix paths are handled component-wise and keep
/// their bytes; Windows rules apply to paths that are valid Unicode.
use super::Platform;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

const VERBATIM_PREFIX: &str = r"\\?\";
const VERBATIM_UNC_PREFIX: &str = r"\\?\UNC\";
const DEVICE_PREFIX: &str = r"\\.\";

/// Windows `MAX_PATH` minus the terminating NUL.
const MAX_PATH_CHARS: usize = 259;

/// Canonical form of `path` for `platform`.
pub fn normalize_path(platform: Platform, path: &Path) -> PathBuf {
    match platform {
        Platform::Windows => match path.to_str() {
            Some(raw) => PathBuf::from(normalize_windows(raw)),
            None => path.to_path_buf(),
        },
        Platform::Linux | Platform::MacOs => normalize_unix(path),
    }
}

/// Windows rules:
/// - `/` becomes `\`, runs of separators collapse;
/// - `\\?\` and `\\?\UNC\` prefixes are stripped (UNC becomes `\\server\share`);
/// - the drive letter is uppercased and a bare `C:` becomes `C:\`;
/// - `.` and `..` components are resolved lexically;
/// - device paths (`\\.\PhysicalDrive0`) are left untouched.
fn normalize_windows(raw: &str) -> String {
    let mut s = raw.replace('/', "\\");
    if s.starts_with(DEVICE_PREFIX) {
        return s;
    }
    if let Some(rest) = s.strip_prefix(VERBATIM_UNC_PREFIX) {
        s = format!(r"\\{rest}");
    } else if let Some(rest) = s.strip_prefix(VERBATIM_PREFIX) {
        s = rest.to_owned();
    }

    let (prefix, body) = if let Some(rest) = s.strip_prefix(r"\\") {
        // UNC: \\server\share is the root and is never collapsed.
        let mut parts = rest.splitn(3, '\\').filter(|p| !p.is_empty());
        let server = parts.next().unwrap_or_default();
        let share = parts.next().unwrap_or_default();
        let body = parts.next().unwrap_or_default().to_owned();
        (format!(r"\\{server}\{share}"), body)
    } else if s.len() >= 2 && s.as_bytes()[1] == b':' && s.as_bytes()[0].is_ascii_alphabetic() {
        let letter = s[..1].to_ascii_uppercase();
        (format!("{letter}:"), s[2..].to_owned())
    } else {
        (String::new(), s.clone())
    };

    let absolute = !prefix.is_empty() || body.starts_with('\\');
    let parts = resolve_components(body.split('\\'), absolute);

    match (prefix.is_empty(), prefix.starts_with(r"\\")) {
        // UNC share root.
        (false, true) if parts.is_empty() => prefix,
        (false, true) => format!(r"{prefix}\{}", parts.join("\\")),
        // Drive-qualified.
        (false, false) => format!(r"{prefix}\{}", parts.join("\\")),
        (true, _) if absolute => format!(r"\{}", parts.join("\\")),
        (true, _) if parts.is_empty() => ".".to_owned(),
        (true, _) => parts.join("\\"),
    }
}

/// Unix rules: collapse `//`, drop `.`, resolve `..` lexically (never above
/// `/`), strip trailing `/`. Backslashes and non-UTF-8 bytes are legal in
/// file names and are left alone.
fn normalize_unix(path: &Path) -> PathBuf {
    let absolute = path.has_root();
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(OsStr::new("..")),
            },
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    let mut out = if absolute {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    out.extend(parts);
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn resolve_components<'a>(components: impl Iterator<Item = &'a str>, absolute: bool) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for part in components {
        match part {
            "" | "." => {}
            ".." => match out.last() {
                Some(&last) if last != ".." => {
                    out.pop();
                }
                _ if absolute => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}

/// Add the `\\?\` (or `\\?\UNC\`) prefix to a normalised Windows path that
/// exceeds `MAX_PATH`, so Win32 APIs accept it. Shorter paths are returned
/// unchanged.
pub fn to_extended_length(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    let s = normalize_windows(raw);
    if s.chars().count() <= MAX_PATH_CHARS || s.starts_with(DEVICE_PREFIX) {
        return PathBuf::from(s);
    }
    match s.strip_prefix(r"\\") {
        Some(unc) => PathBuf::from(format!("{VERBATIM_UNC_PREFIX}{unc}")),
        None => PathBuf::from(format!("{VERBATIM_PREFIX}{s}")),
    }
}
