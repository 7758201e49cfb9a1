//! Archive extraction for downloaded dependencies.
//!
//! Runtime archives, export templates (`.tpz`) and macOS test artifacts are
//! zip files; released addon packages on Unix are gzipped tarballs.

use crate::error::{CiError, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Unpacks an archive into a directory.
pub trait Extractor: Send + Sync {
    /// Extract `archive` into `dest`, creating `dest` if absent.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// Archive layout, picked from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") || name.ends_with(".tpz") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// Extractor backed by the `zip` and `tar` crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveExtractor;

impl Extractor for ArchiveExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let fail = |reason: String| CiError::Extraction {
            archive: archive.to_path_buf(),
            dest: dest.to_path_buf(),
            reason,
        };

        let format = ArchiveFormat::detect(archive)
            .ok_or_else(|| fail("unsupported archive format".to_string()))?;
        fs::create_dir_all(dest).map_err(|e| fail(format!("create destination: {e}")))?;

        match format {
            ArchiveFormat::Zip => extract_zip(archive, dest),
            ArchiveFormat::TarGz => extract_tar_gz(archive, dest),
        }
        .map_err(fail)
    }
}

fn extract_zip(path: &Path, out_dir: &Path) -> std::result::Result<(), String> {
    let f = File::open(path).map_err(|e| format!("open: {e}"))?;
    let mut z = zip::ZipArchive::new(f).map_err(|e| format!("open zip: {e}"))?;
    for i in 0..z.len() {
        let mut file = z.by_index(i).map_err(|e| format!("zip entry {i}: {e}"))?;
        let rel = sanitize_rel_path(Path::new(file.name()))?;
        let out_path = out_dir.join(rel);
        if file.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| format!("mkdir {}: {e}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
        }
        let mut out =
            File::create(&out_path).map_err(|e| format!("create {}: {e}", out_path.display()))?;
        std::io::copy(&mut file, &mut out)
            .map_err(|e| format!("write {}: {e}", out_path.display()))?;
        drop(out);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| format!("chmod {}: {e}", out_path.display()))?;
            }
        }
        debug!(path = %out_path.display(), "Extracted");
    }
    Ok(())
}

fn extract_tar_gz(path: &Path, out_dir: &Path) -> std::result::Result<(), String> {
    let f = File::open(path).map_err(|e| format!("open: {e}"))?;
    let mut ar = tar::Archive::new(GzDecoder::new(f));
    let entries = ar.entries().map_err(|e| format!("read tar entries: {e}"))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| format!("tar entry: {e}"))?;
        let entry_path = entry
            .path()
            .map_err(|e| format!("tar entry path: {e}"))?
            .to_path_buf();
        let rel = sanitize_rel_path(&entry_path)?;
        let out_path = out_dir.join(rel);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
        }
        entry
            .unpack(&out_path)
            .map_err(|e| format!("unpack {}: {e}", out_path.display()))?;
        debug!(path = %out_path.display(), "Extracted");
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> std::result::Result<PathBuf, String> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!("invalid archive path (absolute): {}", path.display()))
            }
            Component::ParentDir => {
                return Err(format!("invalid archive path (..): {}", path.display()))
            }
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}
