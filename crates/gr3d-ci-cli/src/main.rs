//! GR3D CI - determinism test pipeline CLI
//!
//! The `gr3d-ci` command drives the godot-rapier-3d determinism tests.
//!
//! ## Commands
//!
//! - `download` / `extract` / `dependencies`: fetch and unpack the runtime
//!   and export templates
//! - `build`: prime the project and export the test artifact
//! - `test`: run the test artifact and collect its report
//! - `run`: the whole pipeline for every target, then `compare`
//! - `compare`: pairwise hash-report comparison
//! - `addon`: fetch the prebuilt addon package
//! - `debug`: dump directories and cached archive digests

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};

use gr3d_ci::compare::{write_summary_json, SUMMARY_FILE};
use gr3d_ci::pipeline::with_watchdog;
use gr3d_ci::reports::discover_reports;
use gr3d_ci::{
    diagnostics, telemetry, ArchiveExtractor, CacheStore, CiConfig, CiError, CompareOptions,
    ComparisonResult, GitDiff, HttpFetcher, MalformedPolicy, OsFamily, ReportComparator, Target,
    TargetPipeline,
};

#[derive(Parser)]
#[command(name = "gr3d-ci")]
#[command(author = "GR3D Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Determinism test pipeline for godot-rapier-3d", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Root of the test project
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Home directory the runtime installs export templates under
    #[arg(long, global = true, env = "HOME")]
    home: Option<PathBuf>,

    /// OS label of the CI runner (Windows, macOS, Linux)
    #[arg(long, global = true, env = "RUNNER_OS")]
    runner_os: Option<String>,

    /// Abort the whole invocation after this many seconds
    #[arg(long, global = true, default_value_t = 600)]
    watchdog_secs: u64,

    /// Pause between priming and exporting, in milliseconds
    #[arg(long, global = true, default_value_t = 1000)]
    settle_ms: u64,

    /// Maximum number of targets running at once (default: all)
    #[arg(long, global = true)]
    max_parallel: Option<usize>,

    /// Fail a comparison when a report has no hash-table header
    #[arg(long, global = true)]
    strict_reports: bool,

    /// Context lines in comparison diffs
    #[arg(long, global = true, default_value_t = 100)]
    diff_context: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the runtime and export templates into the cache
    Download {
        /// Targets to download for
        targets: Vec<String>,
    },

    /// Extract previously downloaded runtime and export templates
    Extract {
        /// Targets to extract for
        targets: Vec<String>,
    },

    /// Download and extract the runtime and export templates
    Dependencies {
        /// Targets to prepare
        targets: Vec<String>,
    },

    /// Prime the project and export the test artifact
    Build {
        /// Targets to build
        targets: Vec<String>,
    },

    /// Run the exported test artifact and collect its report
    Test {
        /// Targets to test
        targets: Vec<String>,
    },

    /// Run the whole pipeline for every target, then compare reports
    Run {
        /// Targets to run
        targets: Vec<String>,

        /// Exit non-zero when any pair of reports diverges
        #[arg(long)]
        fail_on_mismatch: bool,
    },

    /// Compare hash reports pairwise
    Compare {
        /// Reports to compare (default: every report under the reports dir)
        reports: Vec<PathBuf>,

        /// Where diff artifacts are written (default: the reports dir)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Exit non-zero when any pair of reports diverges
        #[arg(long)]
        fail_on_mismatch: bool,
    },

    /// Download the prebuilt addon package into the project
    Addon {
        /// Targets to fetch the addon for
        targets: Vec<String>,
    },

    /// Print directories and cached archive digests
    Debug,
}

impl Commands {
    /// Raw target arguments, for commands that take them.
    fn target_args(&self) -> Option<&[String]> {
        match self {
            Commands::Download { targets }
            | Commands::Extract { targets }
            | Commands::Dependencies { targets }
            | Commands::Build { targets }
            | Commands::Test { targets }
            | Commands::Run { targets, .. }
            | Commands::Addon { targets } => Some(targets.as_slice()),
            Commands::Compare { .. } | Commands::Debug => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    let (targets, config) = prepare(&cli)?;
    let config = Arc::new(config);
    let budget = config.watchdog;

    match with_watchdog(budget, dispatch(cli.command, targets, config)).await {
        Ok(result) => result,
        Err(e) => {
            // In-flight children are killed on drop; blocking tasks are not
            // waited for.
            error!(error = %e, "Aborting");
            eprintln!("✗ {e}");
            std::process::exit(1);
        }
    }
}

/// Validate targets, then build the configuration. A bad target is
/// reported before the project or home directory is looked at.
fn prepare(cli: &Cli) -> Result<(Vec<Target>, CiConfig)> {
    let targets = match cli.command.target_args() {
        Some(args) => parse_targets(args)?,
        None => Vec::new(),
    };
    Ok((targets, build_config(cli)?))
}

/// Build the one configuration record every command shares.
fn build_config(cli: &Cli) -> Result<CiConfig> {
    let project_dir = std::fs::canonicalize(&cli.project_dir)
        .with_context(|| format!("Project directory not found: {:?}", cli.project_dir))?;
    let home = cli
        .home
        .clone()
        .context("Home directory unknown: set HOME or pass --home")?;

    let runner_os = cli.runner_os.as_deref().and_then(|label| {
        let os = OsFamily::from_runner_label(label);
        if os.is_none() {
            warn!(label = %label, "Unrecognized RUNNER_OS, ignoring");
        }
        os
    });

    let compare = CompareOptions {
        context_lines: cli.diff_context,
        malformed: if cli.strict_reports {
            MalformedPolicy::Strict
        } else {
            MalformedPolicy::WholeFile
        },
        ..CompareOptions::default()
    };

    Ok(CiConfig::new(project_dir, home)
        .with_runner_os(runner_os)
        .with_settle_delay(Duration::from_millis(cli.settle_ms))
        .with_watchdog(Duration::from_secs(cli.watchdog_secs))
        .with_max_parallel(cli.max_parallel)
        .with_compare(compare))
}

async fn dispatch(command: Commands, targets: Vec<Target>, config: Arc<CiConfig>) -> Result<()> {
    match command {
        Commands::Download { .. } => cmd_download(&pipeline(&config)?, &targets).await,
        Commands::Extract { .. } => cmd_extract(&pipeline(&config)?, &targets).await,
        Commands::Dependencies { .. } => cmd_dependencies(&pipeline(&config)?, &targets).await,
        Commands::Build { .. } => cmd_build(&pipeline(&config)?, &targets).await,
        Commands::Test { .. } => cmd_test(&pipeline(&config)?, &targets).await,
        Commands::Run {
            fail_on_mismatch, ..
        } => cmd_run(&pipeline(&config)?, &targets, fail_on_mismatch).await,
        Commands::Compare {
            reports,
            out_dir,
            fail_on_mismatch,
        } => cmd_compare(&config, reports, out_dir, fail_on_mismatch).await,
        Commands::Addon { .. } => cmd_addon(&pipeline(&config)?, &targets).await,
        Commands::Debug => cmd_debug(&config),
    }
}

/// Validate every target argument before any I/O happens.
fn parse_targets(args: &[String]) -> Result<Vec<Target>> {
    match Target::parse_all(args) {
        Ok(targets) => {
            println!(
                "Targets: {}",
                targets
                    .iter()
                    .map(Target::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Ok(targets)
        }
        Err(CiError::InvalidTarget { target, valid }) if target.is_empty() => {
            anyhow::bail!("No target passed. Valid targets: {}", valid)
        }
        Err(e) => Err(e.into()),
    }
}

fn pipeline(config: &Arc<CiConfig>) -> Result<TargetPipeline> {
    let fetcher = HttpFetcher::new().context("Failed to create HTTP client")?;
    let cache = CacheStore::new(Arc::new(fetcher), Arc::new(ArchiveExtractor));
    Ok(TargetPipeline::new(Arc::clone(config), Arc::new(cache)))
}

type Outcome = std::result::Result<String, CiError>;

/// Run `action` for every target, at most `max_parallel` at once. Outcomes
/// come back in argument order.
async fn for_each_target<F, Fut>(config: &CiConfig, targets: &[Target], action: F) -> Vec<(Target, Outcome)>
where
    F: Fn(Target) -> Fut,
    Fut: Future<Output = Outcome>,
{
    let limit = config.max_parallel.unwrap_or(targets.len()).max(1);
    let action = &action;
    stream::iter(targets.iter().copied())
        .map(|target| async move { (target, action(target).await) })
        .buffered(limit)
        .collect()
        .await
}

/// Print a per-target line and turn any failure into one error at the end.
fn summarize(action: &str, outcomes: &[(Target, Outcome)]) -> Result<()> {
    for (target, outcome) in outcomes {
        match outcome {
            Ok(detail) => println!("  ✓ {} {}", target, detail),
            Err(e) => println!("  ✗ {} {}", target, e),
        }
    }
    let failed = outcomes.iter().filter(|(_, o)| o.is_err()).count();
    println!();
    println!("Summary: {}/{} targets {}", outcomes.len() - failed, outcomes.len(), action);
    if failed > 0 {
        anyhow::bail!("{} of {} targets failed", failed, outcomes.len());
    }
    Ok(())
}

async fn cmd_download(pipeline: &TargetPipeline, targets: &[Target]) -> Result<()> {
    let outcomes = for_each_target(pipeline.config(), targets, |target| async move {
        pipeline.check_runner_os(target);
        let profile = pipeline.profile(target);
        pipeline
            .download_dependencies(&profile)
            .await
            .map(|_| format!("cached in {}", pipeline.config().cache_dir().display()))
    })
    .await;
    summarize("downloaded", &outcomes)
}

async fn cmd_extract(pipeline: &TargetPipeline, targets: &[Target]) -> Result<()> {
    let outcomes = for_each_target(pipeline.config(), targets, |target| async move {
        let profile = pipeline.profile(target);
        pipeline.extract_dependencies(&profile).await.map(|_| {
            format!(
                "templates in {}",
                pipeline
                    .config()
                    .export_templates_dir(profile.os_family)
                    .display()
            )
        })
    })
    .await;
    summarize("extracted", &outcomes)
}

async fn cmd_dependencies(pipeline: &TargetPipeline, targets: &[Target]) -> Result<()> {
    let outcomes = for_each_target(pipeline.config(), targets, |target| async move {
        pipeline.check_runner_os(target);
        let profile = pipeline.profile(target);
        pipeline
            .acquire_dependencies(&profile)
            .await
            .map(|_| "ready".to_string())
    })
    .await;
    summarize("ready", &outcomes)
}

async fn cmd_build(pipeline: &TargetPipeline, targets: &[Target]) -> Result<()> {
    let outcomes = for_each_target(pipeline.config(), targets, |target| async move {
        let profile = pipeline.profile(target);
        pipeline
            .build(&profile)
            .await
            .map(|artifact| format!("-> {}", artifact.display()))
    })
    .await;
    summarize("built", &outcomes)
}

async fn cmd_test(pipeline: &TargetPipeline, targets: &[Target]) -> Result<()> {
    let outcomes = for_each_target(pipeline.config(), targets, |target| async move {
        let profile = pipeline.profile(target);
        let tested = pipeline.test(&profile).await?;
        for report in &tested.reports {
            println!("  report: {}", report.display());
        }
        match tested.error(target) {
            Some(e) => Err(e),
            None => Ok(format!("{} report(s)", tested.reports.len())),
        }
    })
    .await;
    summarize("tested", &outcomes)
}

async fn cmd_addon(pipeline: &TargetPipeline, targets: &[Target]) -> Result<()> {
    let outcomes = for_each_target(pipeline.config(), targets, |target| async move {
        pipeline.check_runner_os(target);
        let profile = pipeline.profile(target);
        pipeline
            .fetch_addon(&profile)
            .await
            .map(|library| format!("-> {}", library.display()))
    })
    .await;
    summarize("installed", &outcomes)
}

async fn cmd_run(pipeline: &TargetPipeline, targets: &[Target], fail_on_mismatch: bool) -> Result<()> {
    println!(
        "Running determinism pipeline in {}",
        pipeline.config().project_dir.display()
    );
    println!();

    let batch = pipeline.run_batch(targets).await;

    println!("Status: {}", if batch.success() { "✓ PASSED" } else { "✗ FAILED" });
    println!("Duration: {}ms", batch.duration_ms);
    println!();
    for run in &batch.runs {
        let status = if run.passed() { "✓" } else { "✗" };
        println!("  {} {} ({}ms, {:?})", status, run.target, run.duration_ms, run.state);
        for step in &run.steps {
            let mark = if step.passed() { "✓" } else { "✗" };
            println!(
                "      {} {} ({}ms, exit code: {})",
                mark, step.step_name, step.duration_ms, step.exit_code
            );
        }
        if let Some(reason) = run.failure_reason() {
            println!("      reason: {}", reason);
        }
    }
    println!();
    println!("Summary: {}/{} targets passed", batch.passed_count(), batch.runs.len());
    println!();

    let compared = cmd_compare(pipeline.config(), Vec::new(), None, fail_on_mismatch).await;

    if !batch.success() {
        anyhow::bail!("{} of {} targets failed", batch.failed_count(), batch.runs.len());
    }
    compared
}

async fn cmd_compare(
    config: &CiConfig,
    reports: Vec<PathBuf>,
    out_dir: Option<PathBuf>,
    fail_on_mismatch: bool,
) -> Result<()> {
    let reports_dir = config.reports_dir();
    let reports = if reports.is_empty() {
        println!("Looking in {} for reports", reports_dir.display());
        discover_reports(&reports_dir)?
    } else {
        reports
    };
    if reports.is_empty() {
        println!("No reports found");
        return Ok(());
    }
    println!("Found reports:");
    for report in &reports {
        println!("  {}", file_name(report));
    }
    println!();

    let out_dir = out_dir.unwrap_or(reports_dir);
    let comparator = ReportComparator::new(Arc::new(GitDiff::new()), config.compare.clone());
    let results = comparator
        .compare_all(&reports, &out_dir)
        .await
        .context("Report comparison failed")?;
    if results.is_empty() {
        return Ok(());
    }

    print_comparisons(&results);

    let summary = out_dir.join(SUMMARY_FILE);
    write_summary_json(&summary, &results)
        .with_context(|| format!("Failed to write {}", summary.display()))?;
    info!(path = %summary.display(), "Wrote comparison summary");

    let divergent = results.iter().filter(|r| r.divergent).count();
    if fail_on_mismatch && divergent > 0 {
        anyhow::bail!("{} of {} report pairs diverged", divergent, results.len());
    }
    Ok(())
}

fn print_comparisons(results: &[ComparisonResult]) {
    println!("Results:");
    println!("Differences\tPaths");
    for result in results {
        let mark = if result.divergent { "✗" } else { "✓" };
        println!(
            "{} {}\t{} {}: {}",
            mark,
            result.mismatched_rows,
            file_name(&result.report_a),
            file_name(&result.report_b),
            result.verdict()
        );
        if !result.partitioned {
            println!("    (no hash-table header, compared whole files)");
        }
        println!("    diff: {}", result.diff_artifact_path.display());
    }
    let divergent = results.iter().filter(|r| r.divergent).count();
    println!();
    println!("Summary: {}/{} pairs matched", results.len() - divergent, results.len());
}

fn cmd_debug(config: &CiConfig) -> Result<()> {
    let diag = diagnostics::collect(config).context("Failed to collect diagnostics")?;

    for listing in &diag.listings {
        print_command(&format!("ls -la {}", listing.path.display()));
        if !listing.exists {
            println!("(missing)");
            continue;
        }
        for entry in &listing.entries {
            let kind = if entry.is_dir { "d" } else { "-" };
            println!("{} {:>12} {}", kind, entry.size, entry.name);
        }
    }

    print_command("sha256 ci/bin/*");
    if diag.archives.is_empty() {
        println!("(no cached archives)");
    }
    for archive in &diag.archives {
        println!("{}  {} ({} bytes)", archive.sha256, file_name(&archive.path), archive.size);
    }

    print_command(&format!("cat {}", diagnostics::EXTENSION_MANIFEST));
    match &diag.manifest {
        Some(manifest) => println!("{}", manifest),
        None => println!("(missing)"),
    }

    print_command("config");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn print_command(command: &str) {
    println!("\n---");
    println!("$ {}", command);
    println!("---");
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
