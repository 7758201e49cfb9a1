//! Download cache for external binary dependencies.
//!
//! A cached file is identified by the final path segment of the URL it came
//! from. Presence of that file in the cache directory counts as proof of a
//! prior successful download; there is no checksum verification. Downloads
//! are written to a temporary file and renamed into place, so an interrupted
//! fetch never leaves a same-named entry behind.

use crate::archive::Extractor;
use crate::error::{CiError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Subdirectory of the export-templates archive that holds the templates.
pub const TEMPLATES_SUBDIR: &str = "templates";

/// Fetches the full body of a URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// HTTP fetcher backed by `reqwest`.
pub struct HttpFetcher {
    http_client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("gr3d-ci/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        Ok(body.to_vec())
    }
}

/// Derive the cache file name from a URL: its final path segment, with any
/// query string or fragment dropped.
pub fn file_name_from_url(url: &str) -> Result<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    match without_query.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(CiError::InvalidUrl(url.to_string())),
    }
}

/// SHA-256 of a file on disk, hex encoded.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Filename-addressed download cache plus extraction helpers.
pub struct CacheStore {
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    /// (archive, destination) pairs already extracted by this process.
    extracted: Mutex<HashMap<(PathBuf, PathBuf), Arc<Mutex<bool>>>>,
}

impl CacheStore {
    pub fn new(fetcher: Arc<dyn Fetcher>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            fetcher,
            extractor,
            extracted: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure the resource at `url` is present in `dir`, downloading it
    /// only when no same-named file exists. Returns the cached file name.
    pub async fn ensure(&self, url: &str, dir: &Path) -> Result<String> {
        let file_name = file_name_from_url(url)?;
        let path = dir.join(&file_name);

        if tokio::fs::try_exists(&path).await? {
            info!(path = %path.display(), "Already downloaded");
            return Ok(file_name);
        }

        info!(url = %url, path = %path.display(), "Downloading");
        let body = self.fetcher.fetch(url).await?;
        let bytes = body.len();

        let dir = dir.to_path_buf();
        let dest = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&dir, &dest, &body))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

        info!(path = %path.display(), bytes = bytes, "Downloaded");
        Ok(file_name)
    }

    /// Path of an already-cached resource, or `MissingDependency`.
    pub async fn cached_path(&self, url: &str, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(file_name_from_url(url)?);
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(CiError::MissingDependency(path))
        }
    }

    /// Extract `archive` into `dest`, creating `dest` if absent.
    pub async fn extract_into(&self, archive: &Path, dest: &Path) -> Result<()> {
        info!(archive = %archive.display(), dest = %dest.display(), "Extracting");
        let extractor = Arc::clone(&self.extractor);
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extractor.extract(&archive, &dest))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?
    }

    /// Like [`extract_into`](Self::extract_into), but a given archive is
    /// extracted into a given destination at most once per process.
    /// Concurrent callers wait for the first extraction to finish.
    pub async fn extract_once(&self, archive: &Path, dest: &Path) -> Result<()> {
        self.once(archive, dest, false).await
    }

    /// Extract an export-templates archive into `dest` and flatten its
    /// nested `templates/` directory, at most once per process.
    pub async fn install_templates_once(&self, archive: &Path, dest: &Path) -> Result<()> {
        self.once(archive, dest, true).await
    }

    async fn once(&self, archive: &Path, dest: &Path, relocate: bool) -> Result<()> {
        let slot = {
            let mut extracted = self.extracted.lock().await;
            Arc::clone(
                extracted
                    .entry((archive.to_path_buf(), dest.to_path_buf()))
                    .or_default(),
            )
        };

        let mut done = slot.lock().await;
        if *done {
            debug!(archive = %archive.display(), dest = %dest.display(), "Already extracted");
            return Ok(());
        }
        self.extract_into(archive, dest).await?;
        if relocate {
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || relocate_templates(&dest, &dest))
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))??;
        }
        *done = true;
        Ok(())
    }

    /// Move every file under `extracted_root/templates/` up into `dest_dir`.
    ///
    /// The export-templates archive nests its contents one directory deeper
    /// than where the runtime expects installed templates. Returns the number
    /// of files moved.
    pub fn relocate_templates(&self, extracted_root: &Path, dest_dir: &Path) -> Result<usize> {
        relocate_templates(extracted_root, dest_dir)
    }
}

/// See [`CacheStore::relocate_templates`].
pub fn relocate_templates(extracted_root: &Path, dest_dir: &Path) -> Result<usize> {
    let nested = extracted_root.join(TEMPLATES_SUBDIR);
    if !nested.is_dir() {
        debug!(dir = %nested.display(), "No nested templates directory");
        return Ok(0);
    }

    std::fs::create_dir_all(dest_dir)?;
    let files: Vec<PathBuf> = WalkDir::new(&nested)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    for path in &files {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = dest_dir.join(name);
        debug!(from = %path.display(), to = %target.display(), "Moving template");
        std::fs::rename(path, &target)?;
    }

    // Leftover is only the emptied directory skeleton.
    if nested != dest_dir {
        std::fs::remove_dir_all(&nested)?;
    }
    info!(count = files.len(), dest = %dest_dir.display(), "Relocated export templates");
    Ok(files.len())
}

fn write_atomically(dir: &Path, dest: &Path, body: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.flush()?;
    if let Err(e) = tmp.persist(dest) {
        // Another task of the same OS family finished the same download first.
        if dest.exists() {
            return Ok(());
        }
        return Err(e.error.into());
    }
    Ok(())
}
