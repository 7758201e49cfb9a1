//! Pairwise report comparison, mostly with the in-process differ.

use gr3d_ci::compare::{write_summary_json, SUMMARY_FILE};
use gr3d_ci::fakes::LineDiff;
use gr3d_ci::{
    CiError, CompareOptions, ComparisonResult, GitDiff, MalformedPolicy, ReportComparator, Verdict,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn comparator(malformed: MalformedPolicy) -> ReportComparator {
    ReportComparator::new(
        Arc::new(LineDiff),
        CompareOptions {
            malformed,
            ..CompareOptions::default()
        },
    )
}

fn write_report(dir: &Path, name: &str, target: &str, hashes: &[&str]) -> PathBuf {
    let mut content = format!("Determinism report\nTarget: {target}\nStep\tHash\n");
    for (i, hash) in hashes.iter().enumerate() {
        content.push_str(&format!("{}\t{}\n", i + 1, hash));
    }
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Test: a changed hash on step 2 is detected and shows up in the artifact
#[tokio::test]
async fn test_single_hash_change_diverges() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_report(dir.path(), "linux-1-report.txt", "linux", &["h1", "h2"]);
    let b = write_report(dir.path(), "windows-2-report.txt", "windows", &["h1", "h3"]);

    let results = comparator(MalformedPolicy::WholeFile)
        .compare_all(&[a.clone(), b.clone()], dir.path())
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.divergent);
    assert_eq!(result.verdict(), Verdict::Mismatched);
    assert_eq!(result.mismatched_rows, 1);
    assert!(result.partitioned);
    assert_eq!(result.report_a, a);
    assert_eq!(result.report_b, b);
    assert_eq!(
        result.diff_artifact_path,
        dir.path().join("linux-1-report-windows-2-report--comparison.diff")
    );

    let diff = std::fs::read_to_string(&result.diff_artifact_path).unwrap();
    assert!(diff.contains("-2\th2"));
    assert!(diff.contains("+2\th3"));
    // Artifact covers the whole file, header included.
    assert!(diff.contains("-Target: linux"));
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Test: the git differ writes a word-level artifact and the same verdict
#[tokio::test]
async fn test_git_word_diff_artifact() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let a = write_report(dir.path(), "linux-1-report.txt", "linux", &["h1", "h2"]);
    let b = write_report(dir.path(), "windows-2-report.txt", "windows", &["h1", "h3"]);

    let comparator = ReportComparator::new(Arc::new(GitDiff::new()), CompareOptions::default());
    let results = comparator.compare_all(&[a, b], dir.path()).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].verdict(), Verdict::Mismatched);
    assert_eq!(results[0].mismatched_rows, 1);

    let diff = std::fs::read_to_string(&results[0].diff_artifact_path).unwrap();
    assert!(diff.contains("2\t[-h2-]{+h3+}"), "{diff}");
    assert!(diff.contains("Target: [-linux-]{+windows+}"), "{diff}");
}

/// Test: differing headers with identical hash blocks still match
#[tokio::test]
async fn test_header_only_difference_matches() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_report(dir.path(), "a-report.txt", "linux", &["h1", "h2"]);
    let b = write_report(dir.path(), "b-report.txt", "macos", &["h1", "h2"]);

    let results = comparator(MalformedPolicy::WholeFile)
        .compare_all(&[a, b], dir.path())
        .await
        .unwrap();

    assert!(!results[0].divergent);
    assert_eq!(results[0].verdict().to_string(), "All hashes matched");
    assert_eq!(results[0].mismatched_rows, 0);
    // Artifact is written even for matching pairs.
    assert!(results[0].diff_artifact_path.exists());
}

/// Test: n reports produce C(n,2) pairs and artifacts
#[tokio::test]
async fn test_all_unordered_pairs_compared() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let reports: Vec<PathBuf> = (0..4)
        .map(|i| write_report(dir.path(), &format!("r{i}-report.txt"), "t", &["h1"]))
        .collect();

    let results = comparator(MalformedPolicy::WholeFile)
        .compare_all(&reports, &out)
        .await
        .unwrap();

    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| !r.divergent));
    let artifacts = std::fs::read_dir(&out).unwrap().count();
    assert_eq!(artifacts, 6);
}

/// Test: fewer than two reports is a no-op
#[tokio::test]
async fn test_fewer_than_two_reports_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let one = write_report(dir.path(), "only-report.txt", "t", &["h1"]);
    let comparator = comparator(MalformedPolicy::Strict);

    assert!(comparator.compare_all(&[], &out).await.unwrap().is_empty());
    assert!(comparator.compare_all(&[one], &out).await.unwrap().is_empty());
    assert!(!out.exists());
}

/// Test: a report without the header line under both policies
#[tokio::test]
async fn test_malformed_report_policies() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_report(dir.path(), "good-report.txt", "t", &["h1"]);
    let bad = dir.path().join("bad-report.txt");
    std::fs::write(&bad, "crashed before writing the table\n").unwrap();

    let results = comparator(MalformedPolicy::WholeFile)
        .compare_all(&[good.clone(), bad.clone()], dir.path())
        .await
        .unwrap();
    assert!(results[0].divergent);
    assert!(!results[0].partitioned);

    let err = comparator(MalformedPolicy::Strict)
        .compare_all(&[good, bad.clone()], dir.path())
        .await
        .unwrap_err();
    match err {
        CiError::MalformedReport { path, marker } => {
            assert_eq!(path, bad);
            assert_eq!(marker, "Step\tHash");
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Test: the summary file round-trips through serde
#[tokio::test]
async fn test_summary_json_written() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_report(dir.path(), "a-report.txt", "t", &["h1", "h2"]);
    let b = write_report(dir.path(), "b-report.txt", "t", &["h1", "hX"]);

    let results = comparator(MalformedPolicy::WholeFile)
        .compare_all(&[a, b], dir.path())
        .await
        .unwrap();
    let summary = dir.path().join(SUMMARY_FILE);
    write_summary_json(&summary, &results).unwrap();

    let parsed: Vec<ComparisonResult> =
        serde_json::from_str(&std::fs::read_to_string(&summary).unwrap()).unwrap();
    assert_eq!(parsed, results);
}
