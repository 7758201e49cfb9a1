//! Per-target pipeline orchestration.
//!
//! Each target walks the same state machine:
//!
//! ```text
//! Idle -> DependenciesReady -> ProjectPrimed -> ArtifactBuilt
//!      -> TestsExecuted -> ReportCollected
//! ```
//!
//! with `Failed(reason)` reachable from any state. Several targets run
//! concurrently in one batch and a failure in one never touches the others.

use crate::cache::CacheStore;
use crate::config::CiConfig;
use crate::error::{CiError, Result};
use crate::reports::collect_reports;
use crate::runner::{StepResult, StepRunner};
use crate::step::StepConfig;
use crate::target::{OsFamily, Target, TargetProfile};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use walkdir::WalkDir;

/// Where a target's pipeline is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    DependenciesReady,
    ProjectPrimed,
    ArtifactBuilt,
    TestsExecuted,
    ReportCollected,
    Failed(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::ReportCollected | PipelineState::Failed(_))
    }
}

/// Outcome of one target's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRun {
    pub target: Target,
    pub state: PipelineState,
    /// Last state reached before failing, if the run failed.
    pub failed_after: Option<PipelineState>,
    pub steps: Vec<StepResult>,
    pub reports: Vec<PathBuf>,
    /// Non-zero exit of the test binary. Surfaced, but collection still ran.
    pub test_error: Option<String>,
    pub duration_ms: u64,
}

impl TargetRun {
    fn new(target: Target) -> Self {
        Self {
            target,
            state: PipelineState::Idle,
            failed_after: None,
            steps: Vec::new(),
            reports: Vec::new(),
            test_error: None,
            duration_ms: 0,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        info!(from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    fn fail(mut self, err: CiError, start: Instant) -> Self {
        error!(state = ?self.state, error = %err, "Target pipeline failed");
        self.failed_after = Some(self.state.clone());
        self.state = PipelineState::Failed(err.to_string());
        self.duration_ms = start.elapsed().as_millis() as u64;
        self
    }

    /// Reached `ReportCollected` and the test binary exited zero.
    pub fn passed(&self) -> bool {
        self.state == PipelineState::ReportCollected && self.test_error.is_none()
    }

    /// Failure reason, from either the state machine or the test run.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.state {
            PipelineState::Failed(reason) => Some(reason),
            _ => self.test_error.as_deref(),
        }
    }
}

/// Outcome of a batch of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    /// One run per requested target, in request order.
    pub runs: Vec<TargetRun>,
    pub duration_ms: u64,
}

impl BatchResult {
    pub fn passed_count(&self) -> usize {
        self.runs.iter().filter(|r| r.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.runs.iter().filter(|r| !r.passed()).count()
    }

    pub fn success(&self) -> bool {
        self.failed_count() == 0
    }

    /// Reports collected across all targets.
    pub fn reports(&self) -> Vec<PathBuf> {
        self.runs.iter().flat_map(|r| r.reports.iter().cloned()).collect()
    }
}

/// Result of running the test artifact and collecting its reports.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub step: StepResult,
    pub reports: Vec<PathBuf>,
}

impl TestOutcome {
    /// `TestExecution` when the test binary exited non-zero.
    pub fn error(&self, target: Target) -> Option<CiError> {
        (!self.step.passed()).then(|| CiError::TestExecution {
            target: target.to_string(),
            exit_code: self.step.exit_code,
        })
    }
}

/// Drives targets through the pipeline.
pub struct TargetPipeline {
    config: Arc<CiConfig>,
    cache: Arc<CacheStore>,
    /// Held from test start through report collection. Every target writes
    /// into the same reports dir, so a report is only attributable while
    /// one test binary runs at a time.
    reports_lock: Mutex<()>,
}

impl TargetPipeline {
    pub fn new(config: Arc<CiConfig>, cache: Arc<CacheStore>) -> Self {
        Self {
            config,
            cache,
            reports_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CiConfig {
        &self.config
    }

    pub fn profile(&self, target: Target) -> TargetProfile {
        TargetProfile::resolve(target, &self.config.engine, &self.config.addon)
    }

    /// Warn when the runner's OS family differs from the target's. Returns
    /// whether they differ.
    pub fn check_runner_os(&self, target: Target) -> bool {
        match self.config.runner_os {
            Some(runner) if runner != target.os_family() => {
                warn!(
                    triple = %target,
                    runner_os = %runner,
                    target_os = %target.os_family(),
                    "Target OS family differs from runner OS"
                );
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Download the runtime and export-templates archives into the cache.
    pub async fn download_dependencies(&self, profile: &TargetProfile) -> Result<()> {
        let cache_dir = self.config.cache_dir();
        self.cache
            .ensure(&profile.runtime_download_url, &cache_dir)
            .await?;
        self.cache
            .ensure(&profile.export_templates_url, &cache_dir)
            .await?;
        Ok(())
    }

    /// Extract cached archives: the runtime into the cache dir, the
    /// templates into the runtime's export-templates install path.
    pub async fn extract_dependencies(&self, profile: &TargetProfile) -> Result<()> {
        let cache_dir = self.config.cache_dir();
        let runtime_archive = self
            .cache
            .cached_path(&profile.runtime_download_url, &cache_dir)
            .await?;
        let templates_archive = self
            .cache
            .cached_path(&profile.export_templates_url, &cache_dir)
            .await?;

        self.cache.extract_once(&runtime_archive, &cache_dir).await?;

        let templates_dir = self.config.export_templates_dir(profile.os_family);
        self.cache
            .install_templates_once(&templates_archive, &templates_dir)
            .await
    }

    /// `Idle -> DependenciesReady`.
    pub async fn acquire_dependencies(&self, profile: &TargetProfile) -> Result<()> {
        self.download_dependencies(profile).await?;
        self.extract_dependencies(profile).await
    }

    /// Download the prebuilt addon package and unpack it into the project's
    /// addon bin dir. Returns the expected native library path.
    pub async fn fetch_addon(&self, profile: &TargetProfile) -> Result<PathBuf> {
        let cache_dir = self.config.cache_dir();
        self.cache
            .ensure(&profile.addon_download_url, &cache_dir)
            .await?;
        let package = self
            .cache
            .cached_path(&profile.addon_download_url, &cache_dir)
            .await?;
        let bin_dir = self.config.addon_bin_dir();
        self.cache.extract_into(&package, &bin_dir).await?;

        let library = bin_dir.join(&profile.addon_binary_name);
        if tokio::fs::try_exists(&library).await? {
            info!(path = %library.display(), "Addon library installed");
        } else {
            warn!(path = %library.display(), "Addon package did not contain the expected library");
        }
        Ok(library)
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    fn runtime(&self, profile: &TargetProfile) -> PathBuf {
        self.config.runtime_binary(&profile.runtime_binary_name)
    }

    /// Test artifact path in the build dir.
    pub fn artifact_path(&self, profile: &TargetProfile) -> PathBuf {
        self.config.build_dir().join(&profile.test_artifact_name)
    }

    /// `DependenciesReady -> ProjectPrimed`. Best effort: never fails.
    pub async fn prime_project(&self, profile: &TargetProfile) -> StepResult {
        let step = StepConfig::prime_project(
            &self.runtime(profile),
            &self.config.project_dir,
            self.config.prime_quit_after_frames,
        );
        match StepRunner::execute_step(&step).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Priming could not start, continuing");
                StepResult::not_started(&step, &e)
            }
        }
    }

    /// Grace period for the primed editor's writes to land on disk.
    pub async fn settle(&self) {
        let delay = self.config.settle_delay;
        if !delay.is_zero() {
            info!(delay_ms = delay.as_millis() as u64, "Settling");
            tokio::time::sleep(delay).await;
        }
    }

    /// Run the export step. A non-zero exit is returned as a step result;
    /// see [`verify_export`](Self::verify_export). A missing runtime or a
    /// spawn failure is a `Build` error for this target.
    async fn export(&self, profile: &TargetProfile) -> Result<StepResult> {
        self.spawn_export(profile).await.map_err(|e| match e {
            e @ CiError::Build { .. } => e,
            e => CiError::Build {
                target: profile.target.to_string(),
                reason: e.to_string(),
            },
        })
    }

    async fn spawn_export(&self, profile: &TargetProfile) -> Result<StepResult> {
        let runtime = self.runtime(profile);
        if !tokio::fs::try_exists(&runtime).await? {
            return Err(CiError::MissingDependency(runtime));
        }
        tokio::fs::create_dir_all(self.config.build_dir()).await?;
        let step = StepConfig::export_tests(
            &runtime,
            &self.config.project_dir,
            &profile.export_preset,
            &self.artifact_path(profile),
        );
        StepRunner::execute_step(&step).await
    }

    /// The export exited zero and left the artifact behind.
    fn verify_export(&self, profile: &TargetProfile, step: &StepResult) -> Result<PathBuf> {
        let build_error = |reason: String| CiError::Build {
            target: profile.target.to_string(),
            reason,
        };
        if !step.passed() {
            return Err(build_error(format!("export exited with code {}", step.exit_code)));
        }
        let artifact = self.artifact_path(profile);
        if !artifact.is_file() {
            return Err(build_error(format!(
                "export produced no artifact at {}",
                artifact.display()
            )));
        }
        Ok(artifact)
    }

    /// `ProjectPrimed -> ArtifactBuilt`. Any failure, including a runtime
    /// that is missing or cannot be spawned, is a `Build` error.
    pub async fn build_artifact(&self, profile: &TargetProfile) -> Result<PathBuf> {
        let step = self.export(profile).await?;
        self.verify_export(profile, &step)
    }

    /// Prime, settle and export.
    pub async fn build(&self, profile: &TargetProfile) -> Result<PathBuf> {
        self.prime_project(profile).await;
        self.settle().await;
        self.build_artifact(profile).await
    }

    // -----------------------------------------------------------------------
    // Test
    // -----------------------------------------------------------------------

    /// The runnable for an artifact. macOS artifacts are zipped app bundles
    /// and are unpacked into `<build>/<target>-bundle/` first.
    pub async fn runnable(&self, profile: &TargetProfile) -> Result<PathBuf> {
        let artifact = self.artifact_path(profile);
        if !tokio::fs::try_exists(&artifact).await? {
            return Err(CiError::MissingArtifact(artifact));
        }
        let runnable = match profile.os_family {
            OsFamily::Macos => {
                let bundle_dir = self
                    .config
                    .build_dir()
                    .join(format!("{}-bundle", profile.target));
                self.cache.extract_into(&artifact, &bundle_dir).await?;
                find_bundle_executable(&bundle_dir)?
            }
            _ => artifact,
        };
        // The test step runs from the build dir.
        Ok(tokio::fs::canonicalize(&runnable).await?)
    }

    /// `ArtifactBuilt -> TestsExecuted`. A non-zero exit is not an `Err`;
    /// check [`TestOutcome::error`].
    pub async fn execute_tests(&self, profile: &TargetProfile) -> Result<StepResult> {
        let runnable = self.runnable(profile).await?;
        tokio::fs::create_dir_all(self.config.reports_dir()).await?;
        let step = StepConfig::run_tests(&runnable, profile.target, &self.config.build_dir());
        StepRunner::execute_step(&step).await
    }

    /// `TestsExecuted -> ReportCollected`.
    pub fn collect_reports(&self, target: Target) -> Result<Vec<PathBuf>> {
        let stamp = chrono::Utc::now().timestamp_millis();
        let reports = collect_reports(&self.config.reports_dir(), target, stamp)?;
        info!(count = reports.len(), "Collected reports");
        Ok(reports)
    }

    /// Run the test artifact and collect what it wrote.
    pub async fn test(&self, profile: &TargetProfile) -> Result<TestOutcome> {
        let _guard = self.reports_lock.lock().await;
        let step = self.execute_tests(profile).await?;
        let reports = self.collect_reports(profile.target)?;
        Ok(TestOutcome { step, reports })
    }

    // -----------------------------------------------------------------------
    // Whole pipeline
    // -----------------------------------------------------------------------

    /// Run one target from `Idle` to a terminal state.
    pub async fn run(&self, target: Target) -> TargetRun {
        let span = info_span!("target", triple = %target);
        self.run_target(target).instrument(span).await
    }

    async fn run_target(&self, target: Target) -> TargetRun {
        let start = Instant::now();
        let profile = self.profile(target);
        let mut run = TargetRun::new(target);
        info!("Starting target pipeline");
        self.check_runner_os(target);

        if let Err(e) = self.acquire_dependencies(&profile).await {
            return run.fail(e, start);
        }
        run.advance(PipelineState::DependenciesReady);

        let primed = self.prime_project(&profile).await;
        run.steps.push(primed);
        run.advance(PipelineState::ProjectPrimed);
        self.settle().await;

        let exported = match self.export(&profile).await {
            Ok(step) => step,
            Err(e) => return run.fail(e, start),
        };
        let verified = self.verify_export(&profile, &exported);
        run.steps.push(exported);
        if let Err(e) = verified {
            return run.fail(e, start);
        }
        run.advance(PipelineState::ArtifactBuilt);

        let _guard = self.reports_lock.lock().await;
        let tested = match self.execute_tests(&profile).await {
            Ok(step) => step,
            Err(e) => return run.fail(e, start),
        };
        if !tested.passed() {
            let err = CiError::TestExecution {
                target: target.to_string(),
                exit_code: tested.exit_code,
            };
            warn!(error = %err, "Tests failed, collecting reports anyway");
            run.test_error = Some(err.to_string());
        }
        run.steps.push(tested);
        run.advance(PipelineState::TestsExecuted);

        match self.collect_reports(target) {
            Ok(reports) => run.reports = reports,
            Err(e) => return run.fail(e, start),
        }
        run.advance(PipelineState::ReportCollected);

        run.duration_ms = start.elapsed().as_millis() as u64;
        info!(duration_ms = run.duration_ms, passed = run.passed(), "Target pipeline finished");
        run
    }

    /// Run every target concurrently, at most `max_parallel` at a time.
    /// Results come back in request order.
    pub async fn run_batch(&self, targets: &[Target]) -> BatchResult {
        let start = Instant::now();
        let limit = self
            .config
            .max_parallel
            .unwrap_or(targets.len())
            .max(1);
        info!(targets = targets.len(), max_parallel = limit, "Starting batch");

        let runs: Vec<TargetRun> = stream::iter(targets.iter().copied())
            .map(|t| self.run(t))
            .buffered(limit)
            .collect()
            .await;

        let result = BatchResult {
            runs,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            passed = result.passed_count(),
            failed = result.failed_count(),
            duration_ms = result.duration_ms,
            "Batch finished"
        );
        result
    }
}

/// First file under `*.app/Contents/MacOS/` inside `dir`.
pub fn find_bundle_executable(dir: &Path) -> Result<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .find(|p| is_bundle_executable(p))
        .ok_or_else(|| CiError::MissingArtifact(dir.to_path_buf()))
}

fn is_bundle_executable(path: &Path) -> bool {
    let Some(macos) = path.parent() else {
        return false;
    };
    let Some(contents) = macos.parent() else {
        return false;
    };
    let Some(app) = contents.parent() else {
        return false;
    };
    macos.file_name().is_some_and(|n| n == "MacOS")
        && contents.file_name().is_some_and(|n| n == "Contents")
        && app.extension().is_some_and(|e| e == "app")
}

/// Bound `fut` by a wall-clock budget.
pub async fn with_watchdog<F: Future>(budget: Duration, fut: F) -> Result<F::Output> {
    tokio::time::timeout(budget, fut).await.map_err(|_| {
        error!(budget_secs = budget.as_secs(), "Watchdog expired");
        CiError::Watchdog(budget.as_secs())
    })
}
