//! Validation and confined extraction of release archives.
//!
//! Every entry is checked before anything is written: absolute paths, drive
//! prefixes, `..` segments and symbolic links reject the whole archive, and so
//! do two entries that would land on the same path. An archive is either flat
//! or wrapped in one top-level directory named `<id>` or `<id>-<version>`;
//! a wrapper with any other name, or entries next to the wrapper, are rejected.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipArchive;

use crate::error::{Result, UpdaterError};
use crate::version::Version;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Kind of an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One validated entry, with its path relative to the payload root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub index: usize,
    pub path: PathBuf,
    pub kind: EntryKind,
    pub mode: Option<u32>,
}

/// Counts reported after extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
}

/// Validate `bytes` as a release archive of `component_id` and return the
/// entries that make up its payload.
pub fn plan(component_id: &str, bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let invalid = |reason: String| UpdaterError::InvalidArchive {
        component: component_id.to_string(),
        reason,
    };

    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| invalid(err.to_string()))?;
    if archive.len() == 0 {
        return Err(invalid("archive is empty".into()));
    }

    let mut raw = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive
            .by_index(index)
            .map_err(|err| invalid(err.to_string()))?;
        let name = file.name().to_string();
        let mode = file.unix_mode();
        if mode.map_or(false, |mode| mode & S_IFMT == S_IFLNK) {
            return Err(invalid(format!("entry '{name}' is a symbolic link")));
        }
        let segments = confined_segments(&name).map_err(invalid)?;
        if segments.is_empty() {
            continue;
        }
        let kind = if file.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        raw.push((index, segments, kind, mode));
    }

    let strip = wrapper_dir(component_id, &raw).map_err(invalid)?;
    if let Some(wrapper) = &strip {
        debug!(
            target: "updater",
            component = component_id,
            wrapper = %wrapper,
            "stripping archive wrapper directory"
        );
    }

    let entries: Vec<ArchiveEntry> = raw
        .into_iter()
        .filter_map(|(index, segments, kind, mode)| {
            let skip = usize::from(strip.is_some());
            let path: PathBuf = segments.iter().skip(skip).collect();
            if path.as_os_str().is_empty() {
                return None;
            }
            Some(ArchiveEntry {
                index,
                path,
                kind,
                mode,
            })
        })
        .collect();

    if !entries.iter().any(|entry| entry.kind == EntryKind::File) {
        return Err(invalid("archive contains no files".into()));
    }
    check_collisions(&entries).map_err(invalid)?;
    Ok(entries)
}

/// Extract the payload of `bytes` into `dest`, which must already exist.
pub fn extract(component_id: &str, bytes: &[u8], dest: &Path) -> Result<ExtractSummary> {
    let entries = plan(component_id, bytes)?;
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| UpdaterError::InvalidArchive {
            component: component_id.to_string(),
            reason: err.to_string(),
        })?;

    let mut summary = ExtractSummary::default();
    for entry in &entries {
        let target = dest.join(&entry.path);
        match entry.kind {
            EntryKind::Directory => {
                fs::create_dir_all(&target)
                    .map_err(|err| UpdaterError::filesystem(&target, err))?;
                summary.directories += 1;
            }
            EntryKind::File => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| UpdaterError::filesystem(parent, err))?;
                }
                let mut file = archive
                    .by_index(entry.index)
                    .map_err(|err| UpdaterError::InvalidArchive {
                        component: component_id.to_string(),
                        reason: err.to_string(),
                    })?;
                let mut out = File::create(&target)
                    .map_err(|err| UpdaterError::filesystem(&target, err))?;
                io::copy(&mut file, &mut out).map_err(|err| match err.kind() {
                    io::ErrorKind::InvalidData => UpdaterError::InvalidArchive {
                        component: component_id.to_string(),
                        reason: format!("{}: {err}", entry.path.display()),
                    },
                    _ => UpdaterError::filesystem(&target, err),
                })?;
                set_permissions(&out, &target, entry.mode)?;
                summary.files += 1;
            }
        }
    }

    Ok(summary)
}

/// Split a raw zip entry name into path segments, rejecting anything that
/// could land outside the extraction root.
fn confined_segments(name: &str) -> std::result::Result<Vec<String>, String> {
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(format!("entry '{name}' has an absolute path"));
    }
    let mut segments = Vec::new();
    for segment in name.split(|c: char| c == '/' || c == '\\') {
        match segment {
            "" | "." => continue,
            ".." => return Err(format!("entry '{name}' escapes the archive root")),
            s if s.contains(':') => return Err(format!("entry '{name}' has a path prefix")),
            s => segments.push(s.to_string()),
        }
    }
    Ok(segments)
}

type RawEntry = (usize, Vec<String>, EntryKind, Option<u32>);

/// The wrapper directory to strip, if the archive has one.
///
/// A top-level directory counts as a wrapper when it is named after the
/// component, optionally suffixed with a version. Flat archives have none.
fn wrapper_dir(
    component_id: &str,
    entries: &[RawEntry],
) -> std::result::Result<Option<String>, String> {
    let nested = |(_, segments, kind, _): &RawEntry| {
        segments.len() > 1 || *kind == EntryKind::Directory
    };
    let roots: HashSet<&String> = entries.iter().filter_map(|entry| entry.1.first()).collect();

    let wrapper = roots
        .iter()
        .find(|root| is_wrapper_name(component_id, root))
        .map(|root| root.to_string());
    match wrapper {
        Some(wrapper) => {
            let stray = entries
                .iter()
                .find(|&entry| entry.1.first() != Some(&wrapper) || !nested(entry));
            match stray {
                Some((_, segments, _, _)) => Err(format!(
                    "entry '{}' lies outside the '{wrapper}' directory",
                    segments.join("/")
                )),
                None => Ok(Some(wrapper)),
            }
        }
        None if roots.len() == 1 && entries.iter().all(nested) => {
            let root = roots.into_iter().next().map(String::as_str).unwrap_or_default();
            Err(format!("archive is wrapped in '{root}', expected '{component_id}'"))
        }
        None => Ok(None),
    }
}

fn is_wrapper_name(component_id: &str, name: &str) -> bool {
    match name.strip_prefix(component_id) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('-')
            .map_or(false, |version| version.parse::<Version>().is_ok()),
        None => false,
    }
}

/// Reject entries that would overwrite each other, or a file that another
/// entry needs as a directory.
fn check_collisions(entries: &[ArchiveEntry]) -> std::result::Result<(), String> {
    let mut files = HashSet::new();
    let mut dirs = HashSet::new();
    for entry in entries {
        if entry.kind == EntryKind::File {
            if !files.insert(entry.path.as_path()) {
                return Err(format!("duplicate entry '{}'", entry.path.display()));
            }
        } else {
            dirs.insert(entry.path.as_path());
        }
        dirs.extend(
            entry
                .path
                .ancestors()
                .skip(1)
                .filter(|ancestor| !ancestor.as_os_str().is_empty()),
        );
    }
    match files.iter().find(|file| dirs.contains(*file)) {
        Some(file) => Err(format!(
            "entry '{}' is both a file and a directory",
            file.display()
        )),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn set_permissions(file: &File, path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        let perms = fs::Permissions::from_mode(mode & 0o755 | 0o600);
        file.set_permissions(perms)
            .map_err(|err| UpdaterError::filesystem(path, err))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_file: &File, _path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
