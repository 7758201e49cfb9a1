//! Pipeline configuration.
//!
//! Built once at process start and passed down explicitly. Nothing below the
//! CLI reads the environment.

use crate::target::{export_templates_dir, OsFamily};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine runtime release the pipeline downloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineRelease {
    /// Release tag, e.g. `4.4-stable`
    pub version: String,
    /// Base of the release download URLs
    pub base_url: String,
}

impl Default for EngineRelease {
    fn default() -> Self {
        Self {
            version: "4.4-stable".to_string(),
            base_url: "https://github.com/godotengine/godot/releases/download".to_string(),
        }
    }
}

/// Prebuilt addon release the `addon` step downloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonRelease {
    pub version: String,
    pub base_url: String,
}

impl Default for AddonRelease {
    fn default() -> Self {
        Self {
            version: "latest".to_string(),
            base_url: "https://github.com/deltasiege/godot-rapier-3d/releases".to_string(),
        }
    }
}

/// What to do with a report that has no hash-table header line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Warn and compare the whole file as if it were the hash block.
    #[default]
    WholeFile,
    /// Fail the pair with `MalformedReport`.
    Strict,
}

/// Report comparison settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompareOptions {
    /// Literal column-header text that starts the hash block.
    pub header_marker: String,
    /// Unchanged lines of context around each hunk of the diff artifact.
    pub context_lines: usize,
    pub malformed: MalformedPolicy,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            header_marker: "Step\tHash".to_string(),
            context_lines: 100,
            malformed: MalformedPolicy::WholeFile,
        }
    }
}

/// Everything the pipeline needs to know about its surroundings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiConfig {
    /// Root of the engine project under test.
    pub project_dir: PathBuf,
    /// Home directory used to locate the export-templates install path.
    pub home_dir: PathBuf,
    /// OS family of the CI runner, when known.
    pub runner_os: Option<OsFamily>,

    pub engine: EngineRelease,
    pub addon: AddonRelease,

    /// Frames the editor runs before quitting during the priming step.
    pub prime_quit_after_frames: u32,
    /// Grace period between priming and exporting.
    pub settle_delay: Duration,
    /// Wall-clock budget for the whole invocation.
    pub watchdog: Duration,
    /// Upper bound on targets running at once. `None` runs all of them.
    pub max_parallel: Option<usize>,

    pub compare: CompareOptions,
}

impl CiConfig {
    /// Create a config with default timings for a project and home directory.
    pub fn new(project_dir: impl Into<PathBuf>, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            home_dir: home_dir.into(),
            runner_os: None,
            engine: EngineRelease::default(),
            addon: AddonRelease::default(),
            prime_quit_after_frames: 2,
            settle_delay: Duration::from_millis(1000),
            watchdog: Duration::from_secs(600),
            max_parallel: None,
            compare: CompareOptions::default(),
        }
    }

    /// Set the runner OS, typically mapped from the CI runner's OS label.
    pub fn with_runner_os(mut self, os: Option<OsFamily>) -> Self {
        self.runner_os = os;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_watchdog(mut self, budget: Duration) -> Self {
        self.watchdog = budget;
        self
    }

    pub fn with_max_parallel(mut self, limit: Option<usize>) -> Self {
        self.max_parallel = limit.filter(|n| *n > 0);
        self
    }

    pub fn with_compare(mut self, compare: CompareOptions) -> Self {
        self.compare = compare;
        self
    }

    pub fn build_dir(&self) -> PathBuf {
        self.project_dir.join("build")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.build_dir().join("reports")
    }

    pub fn ci_dir(&self) -> PathBuf {
        self.project_dir.join("ci")
    }

    /// Download cache for runtime, templates and addon archives.
    pub fn cache_dir(&self) -> PathBuf {
        self.ci_dir().join("bin")
    }

    /// Where the addon's native libraries are installed inside the project.
    pub fn addon_bin_dir(&self) -> PathBuf {
        self.project_dir
            .join("addons")
            .join("godot-rapier-3d")
            .join("bin")
    }

    /// Export-templates install path for an OS family.
    pub fn export_templates_dir(&self, os: OsFamily) -> PathBuf {
        export_templates_dir(os, &self.home_dir, &self.engine.version)
    }

    /// Runtime executable for an OS family, inside the cache dir.
    pub fn runtime_binary(&self, runtime_binary_name: &str) -> PathBuf {
        self.cache_dir().join(runtime_binary_name)
    }

    /// Directories worth listing when debugging a failed run.
    pub fn diagnostic_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.project_dir.clone(),
            self.cache_dir(),
            self.addon_bin_dir(),
            self.build_dir(),
            self.reports_dir(),
        ];
        if let Some(os) = self.runner_os {
            dirs.push(self.export_templates_dir(os));
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_derived_from_project_dir() {
        let config = CiConfig::new("/work/gr3d", "/home/runner");
        assert_eq!(config.build_dir(), PathBuf::from("/work/gr3d/build"));
        assert_eq!(config.reports_dir(), PathBuf::from("/work/gr3d/build/reports"));
        assert_eq!(config.cache_dir(), PathBuf::from("/work/gr3d/ci/bin"));
        assert_eq!(
            config.addon_bin_dir(),
            PathBuf::from("/work/gr3d/addons/godot-rapier-3d/bin")
        );
    }

    #[test]
    fn test_defaults() {
        let config = CiConfig::new(".", "/home/runner");
        assert_eq!(config.prime_quit_after_frames, 2);
        assert_eq!(config.settle_delay, Duration::from_millis(1000));
        assert_eq!(config.watchdog, Duration::from_secs(600));
        assert_eq!(config.compare.malformed, MalformedPolicy::WholeFile);
        assert!(config.runner_os.is_none());
    }

    #[test]
    fn test_diagnostic_dirs_include_templates_when_runner_known() {
        let config = CiConfig::new("/p", "/home/runner");
        assert_eq!(config.diagnostic_dirs().len(), 5);

        let config = config.with_runner_os(Some(OsFamily::Linux));
        let dirs = config.diagnostic_dirs();
        assert_eq!(dirs.len(), 6);
        assert_eq!(
            dirs[5],
            PathBuf::from("/home/runner/.local/share/godot/export_templates/4.4.stable")
        );
    }

    #[test]
    fn test_zero_parallel_means_unbounded() {
        let config = CiConfig::new(".", ".").with_max_parallel(Some(0));
        assert!(config.max_parallel.is_none());
    }
}
