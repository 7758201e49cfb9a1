//! Determinism report comparison.
//!
//! Every unordered pair of reports is compared. A report splits at the first
//! line containing the hash-table header into a descriptive header and a
//! hash block; two reports diverge when their hash blocks differ byte for
//! byte. A word-level diff of the full files is written for every pair.

use crate::config::{CompareOptions, MalformedPolicy};
use crate::error::{CiError, Result};
use crate::reports::report_name;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

/// File name of the machine-readable summary written next to the diffs.
pub const SUMMARY_FILE: &str = "comparison-summary.json";

/// Produces a human-readable diff of two files.
#[async_trait]
pub trait DiffTool: Send + Sync {
    async fn diff(&self, a: &Path, b: &Path, context_lines: usize) -> Result<String>;
}

/// `git diff --no-index --word-diff` as the diff collaborator.
#[derive(Debug, Clone)]
pub struct GitDiff {
    program: String,
}

impl Default for GitDiff {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitDiff {
    pub fn new() -> Self {
        Self::default()
    }

    fn args(a: &Path, b: &Path, context_lines: usize) -> Vec<String> {
        vec![
            "--no-pager".to_string(),
            "diff".to_string(),
            "--no-index".to_string(),
            "--word-diff=plain".to_string(),
            format!("--unified={context_lines}"),
            "--".to_string(),
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl DiffTool for GitDiff {
    async fn diff(&self, a: &Path, b: &Path, context_lines: usize) -> Result<String> {
        let args = Self::args(a, b, context_lines);
        info!("$ {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CiError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        // 0: identical, 1: differences found, anything else: git failed.
        match output.status.code() {
            Some(0) | Some(1) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            code => Err(CiError::Diff {
                a: a.to_path_buf(),
                b: b.to_path_buf(),
                reason: format!(
                    "exit code {:?}: {}",
                    code,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }
}

/// A report split into its header and hash block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report<'a> {
    pub header: &'a [u8],
    pub hash_block: &'a [u8],
    /// False when no header line was found and the whole file stands in for
    /// the hash block.
    pub partitioned: bool,
}

impl<'a> Report<'a> {
    /// Split at the first line containing `marker`. Returns `None` when no
    /// line contains it.
    pub fn partition(content: &'a [u8], marker: &str) -> Option<Self> {
        let marker = marker.as_bytes();
        if marker.is_empty() {
            return None;
        }
        let mut line_start = 0;
        for line in content.split_inclusive(|b| *b == b'\n') {
            if line.windows(marker.len()).any(|w| w == marker) {
                return Some(Self {
                    header: &content[..line_start],
                    hash_block: &content[line_start..],
                    partitioned: true,
                });
            }
            line_start += line.len();
        }
        None
    }

    /// Treat the whole file as the hash block.
    pub fn whole(content: &'a [u8]) -> Self {
        Self {
            header: &[],
            hash_block: content,
            partitioned: false,
        }
    }

    /// Hash-block rows after the column-header line.
    pub fn rows(&self) -> Vec<&'a [u8]> {
        let skip = usize::from(self.partitioned);
        let mut rows: Vec<&'a [u8]> = self.hash_block.split(|b| *b == b'\n').skip(skip).collect();
        while rows.last().is_some_and(|r| r.is_empty()) {
            rows.pop();
        }
        rows
    }
}

/// Number of hash-block rows that differ between two reports, counting rows
/// present in only one of them.
pub fn mismatched_rows(a: &Report<'_>, b: &Report<'_>) -> usize {
    let rows_a = a.rows();
    let rows_b = b.rows();
    let shared = rows_a.len().min(rows_b.len());
    let changed = rows_a
        .iter()
        .zip(rows_b.iter())
        .filter(|(x, y)| x != y)
        .count();
    changed + (rows_a.len() - shared) + (rows_b.len() - shared)
}

/// Per-pair console verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Matched,
    Mismatched,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Matched => f.write_str("All hashes matched"),
            Verdict::Mismatched => f.write_str("Hash mismatches detected"),
        }
    }
}

/// Outcome of comparing one pair of reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComparisonResult {
    pub report_a: PathBuf,
    pub report_b: PathBuf,
    pub divergent: bool,
    pub diff_artifact_path: PathBuf,
    /// Hash-block rows that differ.
    pub mismatched_rows: usize,
    /// False when at least one report lacked the header line.
    pub partitioned: bool,
}

impl ComparisonResult {
    pub fn verdict(&self) -> Verdict {
        if self.divergent {
            Verdict::Mismatched
        } else {
            Verdict::Matched
        }
    }
}

/// Every unordered pair of `items`, in input order.
pub fn pairs<T: Clone>(items: &[T]) -> Vec<(T, T)> {
    let mut combos = Vec::new();
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            combos.push((items[i].clone(), items[j].clone()));
        }
    }
    combos
}

/// Diff artifact path for a pair: `<nameA>-<nameB>--comparison.diff`.
pub fn diff_artifact_path(out_dir: &Path, a: &Path, b: &Path) -> PathBuf {
    out_dir.join(format!(
        "{}-{}--comparison.diff",
        report_name(a),
        report_name(b)
    ))
}

/// Compares sets of reports.
pub struct ReportComparator {
    diff_tool: Arc<dyn DiffTool>,
    options: CompareOptions,
}

impl ReportComparator {
    pub fn new(diff_tool: Arc<dyn DiffTool>, options: CompareOptions) -> Self {
        Self { diff_tool, options }
    }

    /// Compare every unordered pair of `reports`, writing diff artifacts into
    /// `out_dir`. Fewer than two reports is a no-op.
    pub async fn compare_all(&self, reports: &[PathBuf], out_dir: &Path) -> Result<Vec<ComparisonResult>> {
        if reports.len() < 2 {
            info!(count = reports.len(), "Fewer than two reports, nothing to compare");
            return Ok(Vec::new());
        }
        tokio::fs::create_dir_all(out_dir).await?;

        let combos = pairs(reports);
        info!(reports = reports.len(), pairs = combos.len(), "Comparing reports");

        let results = join_all(
            combos
                .iter()
                .map(|(a, b)| self.compare_pair(a, b, out_dir)),
        )
        .await;
        results.into_iter().collect()
    }

    /// Compare one pair and write its diff artifact.
    pub async fn compare_pair(&self, a: &Path, b: &Path, out_dir: &Path) -> Result<ComparisonResult> {
        info!(a = %a.display(), b = %b.display(), "Comparing");
        let content_a = tokio::fs::read(a).await?;
        let content_b = tokio::fs::read(b).await?;

        let report_a = self.partition(a, &content_a)?;
        let report_b = self.partition(b, &content_b)?;

        let divergent = report_a.hash_block != report_b.hash_block;
        let mismatched = mismatched_rows(&report_a, &report_b);

        let diff = self
            .diff_tool
            .diff(a, b, self.options.context_lines)
            .await?;
        let artifact = diff_artifact_path(out_dir, a, b);
        tokio::fs::write(&artifact, diff).await?;

        let result = ComparisonResult {
            report_a: a.to_path_buf(),
            report_b: b.to_path_buf(),
            divergent,
            diff_artifact_path: artifact,
            mismatched_rows: mismatched,
            partitioned: report_a.partitioned && report_b.partitioned,
        };
        info!(
            a = %report_name(a),
            b = %report_name(b),
            mismatched_rows = mismatched,
            artifact = %result.diff_artifact_path.display(),
            "{}",
            result.verdict()
        );
        Ok(result)
    }

    fn partition<'a>(&self, path: &Path, content: &'a [u8]) -> Result<Report<'a>> {
        if let Some(report) = Report::partition(content, &self.options.header_marker) {
            return Ok(report);
        }
        match self.options.malformed {
            MalformedPolicy::Strict => Err(CiError::MalformedReport {
                path: path.to_path_buf(),
                marker: self.options.header_marker.clone(),
            }),
            MalformedPolicy::WholeFile => {
                warn!(
                    path = %path.display(),
                    marker = %self.options.header_marker.escape_debug(),
                    "Report has no hash-table header, comparing whole file"
                );
                Ok(Report::whole(content))
            }
        }
    }
}

/// Write all comparison results as pretty JSON.
pub fn write_summary_json(path: &Path, results: &[ComparisonResult]) -> Result<()> {
    let content = serde_json::to_string_pretty(results)?;
    std::fs::write(path, content)?;
    Ok(())
}
