//! In-process fakes for the external collaborators (testing only)
//!
//! Provides `MemoryFetcher` and `LineDiff` so the cache and comparison
//! behavior can be exercised without network access or a `git` binary.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cache::Fetcher;
use crate::compare::DiffTool;
use crate::error::{CiError, Result};

// ---------------------------------------------------------------------------
// MemoryFetcher
// ---------------------------------------------------------------------------

/// Fetcher serving canned bodies from a `HashMap<url, bytes>` and counting
/// every call.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` for `url`.
    pub fn with_response(self, url: &str, body: Vec<u8>) -> Self {
        self.responses.lock().unwrap().insert(url.to_string(), body);
        self
    }

    /// Number of fetches issued for `url`.
    pub fn fetch_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    /// Number of fetches issued for any URL.
    pub fn total_fetches(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(url.to_string());
        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CiError::Fetch {
                url: url.to_string(),
                reason: "404 Not Found".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// LineDiff
// ---------------------------------------------------------------------------

/// Positional line differ.
///
/// Compares line `i` of one file with line `i` of the other and prints
/// changed lines git-style (`-old` / `+new`), with unchanged lines prefixed
/// by a space. Good enough to assert on which step changed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineDiff;

#[async_trait]
impl DiffTool for LineDiff {
    async fn diff(&self, a: &Path, b: &Path, _context_lines: usize) -> Result<String> {
        let text_a = tokio::fs::read_to_string(a).await?;
        let text_b = tokio::fs::read_to_string(b).await?;
        if text_a == text_b {
            return Ok(String::new());
        }

        let lines_a: Vec<&str> = text_a.lines().collect();
        let lines_b: Vec<&str> = text_b.lines().collect();
        let mut out = format!("--- {}\n+++ {}\n", a.display(), b.display());
        for i in 0..lines_a.len().max(lines_b.len()) {
            match (lines_a.get(i), lines_b.get(i)) {
                (Some(x), Some(y)) if x == y => out.push_str(&format!(" {x}\n")),
                (x, y) => {
                    if let Some(x) = x {
                        out.push_str(&format!("-{x}\n"));
                    }
                    if let Some(y) = y {
                        out.push_str(&format!("+{y}\n"));
                    }
                }
            }
        }
        Ok(out)
    }
}
