//! Environment dump for debugging a failed CI run.

use crate::archive::ArchiveFormat;
use crate::cache::digest_file;
use crate::config::CiConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Addon manifest printed alongside the directory listings.
pub const EXTENSION_MANIFEST: &str = "godot-rapier-3d.gdextension";

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Non-recursive listing of one directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirListing {
    pub path: PathBuf,
    pub exists: bool,
    pub entries: Vec<EntryInfo>,
}

/// SHA-256 of a cached archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveDigest {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Everything `debug` prints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub listings: Vec<DirListing>,
    pub archives: Vec<ArchiveDigest>,
    pub manifest: Option<String>,
}

/// List `dir`, sorted by name. A missing directory yields `exists = false`.
pub fn list_dir(dir: &Path) -> Result<DirListing> {
    if !dir.is_dir() {
        return Ok(DirListing {
            path: dir.to_path_buf(),
            exists: false,
            entries: Vec::new(),
        });
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push(EntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(DirListing {
        path: dir.to_path_buf(),
        exists: true,
        entries,
    })
}

/// Digest every archive directly inside `cache_dir`.
pub fn archive_digests(cache_dir: &Path) -> Result<Vec<ArchiveDigest>> {
    let listing = list_dir(cache_dir)?;
    let mut digests = Vec::new();
    for entry in listing.entries.iter().filter(|e| !e.is_dir) {
        let path = cache_dir.join(&entry.name);
        if ArchiveFormat::detect(&path).is_none() {
            continue;
        }
        debug!(path = %path.display(), "Hashing cached archive");
        digests.push(ArchiveDigest {
            sha256: digest_file(&path)?,
            size: entry.size,
            path,
        });
    }
    Ok(digests)
}

/// Collect listings of every diagnostic directory, cached archive digests
/// and the addon manifest.
pub fn collect(config: &CiConfig) -> Result<Diagnostics> {
    let listings = config
        .diagnostic_dirs()
        .iter()
        .map(|d| list_dir(d))
        .collect::<Result<Vec<_>>>()?;
    let archives = archive_digests(&config.cache_dir())?;
    let manifest = std::fs::read_to_string(config.project_dir.join(EXTENSION_MANIFEST)).ok();
    Ok(Diagnostics {
        listings,
        archives,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_list_missing_dir() {
        let dir = tempdir().unwrap();
        let listing = list_dir(&dir.path().join("nope")).unwrap();
        assert!(!listing.exists);
        assert!(listing.entries.is_empty());
    }

    #[test]
    fn test_collect_lists_and_hashes_cache() {
        let dir = tempdir().unwrap();
        let config = CiConfig::new(dir.path(), dir.path());
        std::fs::create_dir_all(config.cache_dir()).unwrap();
        std::fs::write(config.cache_dir().join("runtime.zip"), b"abc").unwrap();
        std::fs::write(config.cache_dir().join("Godot_v4.4-stable_linux.x86_64"), b"bin").unwrap();
        std::fs::write(dir.path().join(EXTENSION_MANIFEST), "[configuration]\n").unwrap();

        let diag = collect(&config).unwrap();
        assert_eq!(diag.listings.len(), 5);
        assert!(diag.listings[1].exists);
        assert_eq!(diag.listings[1].entries.len(), 2);
        assert!(!diag.listings[3].exists);

        assert_eq!(diag.archives.len(), 1);
        assert_eq!(diag.archives[0].size, 3);
        assert_eq!(
            diag.archives[0].sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(diag.manifest.as_deref(), Some("[configuration]\n"));
    }
}
