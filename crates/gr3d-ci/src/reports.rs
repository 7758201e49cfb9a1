//! Report files on disk: collecting fresh ones and finding collected ones.
//!
//! The test binary writes `*report.txt` into the reports directory. Each
//! fresh report is renamed to `<target>-<epochMillis>-report.txt` so that
//! reports from different targets never collide and sort chronologically.

use crate::error::{CiError, Result};
use crate::target::Target;
use globset::{Glob, GlobMatcher};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// File-name pattern of every report, fresh or collected.
pub const REPORT_GLOB: &str = "*report.txt";

const COLLECTED_SUFFIX: &str = "-report.txt";

fn report_matcher() -> Result<GlobMatcher> {
    Glob::new(REPORT_GLOB)
        .map(|g| g.compile_matcher())
        .map_err(|e| CiError::Io(std::io::Error::other(e.to_string())))
}

/// Collected report file name for `target` at `epoch_millis`.
pub fn collected_name(target: Target, epoch_millis: i64) -> String {
    format!("{target}-{epoch_millis}{COLLECTED_SUFFIX}")
}

/// Whether `name` already follows the collected naming convention.
pub fn is_collected_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(COLLECTED_SUFFIX) else {
        return false;
    };
    Target::ALL.iter().any(|t| {
        stem.strip_prefix(t.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|millis| !millis.is_empty() && millis.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Rename every fresh report in `reports_dir` to embed `target` and a
/// timestamp starting at `epoch_millis`.
///
/// Already-collected reports are left alone. When several fresh reports are
/// found, each gets a strictly later timestamp than the previous one, and a
/// timestamp is skipped if its name is taken. Returns the new paths.
pub fn collect_reports(reports_dir: &Path, target: Target, epoch_millis: i64) -> Result<Vec<PathBuf>> {
    let matcher = report_matcher()?;
    let mut fresh: Vec<PathBuf> = std::fs::read_dir(reports_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| {
                    let n = n.to_string_lossy();
                    matcher.is_match(n.as_ref()) && !is_collected_name(&n)
                })
                .unwrap_or(false)
        })
        .collect();
    fresh.sort();

    if fresh.is_empty() {
        info!(dir = %reports_dir.display(), "No fresh reports to collect");
        return Ok(Vec::new());
    }

    let mut stamp = epoch_millis;
    let mut collected = Vec::with_capacity(fresh.len());
    for path in fresh {
        let mut dest = reports_dir.join(collected_name(target, stamp));
        while dest.exists() {
            stamp += 1;
            dest = reports_dir.join(collected_name(target, stamp));
        }
        info!(from = %path.display(), to = %dest.display(), "Renaming report");
        std::fs::rename(&path, &dest)?;
        collected.push(dest);
        stamp += 1;
    }
    Ok(collected)
}

/// Every report under `reports_dir` (recursively), sorted by path.
pub fn discover_reports(reports_dir: &Path) -> Result<Vec<PathBuf>> {
    if !reports_dir.is_dir() {
        debug!(dir = %reports_dir.display(), "Reports directory does not exist");
        return Ok(Vec::new());
    }
    let matcher = report_matcher()?;
    let mut reports: Vec<PathBuf> = WalkDir::new(reports_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| matcher.is_match(e.file_name().to_string_lossy().as_ref()))
        .map(|e| e.into_path())
        .collect();
    reports.sort();
    Ok(reports)
}

/// Report name used in comparison artifact names: the file name minus `.txt`.
pub fn report_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".txt").map(str::to_string).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_collected_name_roundtrip() {
        let name = collected_name(Target::X86_64UnknownLinuxGnu, 1_700_000_000_000);
        assert_eq!(name, "x86_64-unknown-linux-gnu-1700000000000-report.txt");
        assert!(is_collected_name(&name));
        assert!(!is_collected_name("run1-report.txt"));
        assert!(!is_collected_name("x86_64-unknown-linux-gnu--report.txt"));
        assert!(!is_collected_name("x86_64-unknown-linux-gnu-12a-report.txt"));
    }

    #[test]
    fn test_collect_renames_fresh_reports_only() {
        let dir = tempdir().unwrap();
        let old = collected_name(Target::Aarch64AppleDarwin, 1_600_000_000_000);
        std::fs::write(dir.path().join(&old), "old").unwrap();
        std::fs::write(dir.path().join("determinism-report.txt"), "new").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let collected =
            collect_reports(dir.path(), Target::X86_64UnknownLinuxGnu, 1_700_000_000_000).unwrap();

        assert_eq!(collected.len(), 1);
        assert_eq!(
            collected[0],
            dir.path()
                .join("x86_64-unknown-linux-gnu-1700000000000-report.txt")
        );
        assert!(dir.path().join(&old).exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(!dir.path().join("determinism-report.txt").exists());
    }

    #[test]
    fn test_collected_reports_sort_chronologically() {
        let dir = tempdir().unwrap();
        let target = Target::X86_64UnknownLinuxGnu;

        std::fs::write(dir.path().join("run1-report.txt"), "1").unwrap();
        let first = collect_reports(dir.path(), target, 1_700_000_000_000).unwrap();
        std::fs::write(dir.path().join("run2-report.txt"), "2").unwrap();
        let second = collect_reports(dir.path(), target, 1_700_000_000_250).unwrap();

        let mut names = vec![report_name(&second[0]), report_name(&first[0])];
        names.sort();
        assert_eq!(names[0], report_name(&first[0]));
        assert_eq!(std::fs::read_to_string(&first[0]).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(&second[0]).unwrap(), "2");
    }

    #[test]
    fn test_several_fresh_reports_get_distinct_stamps() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a-report.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b-report.txt"), "b").unwrap();

        let collected =
            collect_reports(dir.path(), Target::I686PcWindowsMsvc, 1_000).unwrap();
        assert_eq!(collected.len(), 2);
        assert_ne!(collected[0], collected[1]);
        assert!(collected[0] < collected[1]);
    }

    #[test]
    fn test_discover_is_recursive_and_sorted() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b-report.txt"), "").unwrap();
        std::fs::write(dir.path().join("nested/a-report.txt"), "").unwrap();
        std::fs::write(dir.path().join("x--comparison.diff"), "").unwrap();

        let found = discover_reports(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.windows(2).all(|w| w[0] <= w[1]));
        assert!(discover_reports(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn test_report_name_strips_txt() {
        assert_eq!(
            report_name(Path::new("/r/x86_64-unknown-linux-gnu-1-report.txt")),
            "x86_64-unknown-linux-gnu-1-report"
        );
    }
}
