//! Pipeline step definitions.
//!
//! Every external invocation is a [`StepConfig`] tagged with a [`StepKind`]
//! that decides what a failure means for the rest of the target's pipeline.

use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How a step's failure is treated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Best effort. Failure is captured in the step result and never escalated.
    Advisory,
    /// Failure is reported, but later steps still run.
    Surfaced,
    /// Failure aborts the pipeline for this target.
    Critical,
}

/// Well-known steps of a target pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStep {
    /// Open the project in the headless editor so it imports and caches assets.
    PrimeProject,

    /// Export the test artifact with the target's preset.
    ExportTests,

    /// Run the exported artifact's determinism test.
    RunTests,
}

impl BuiltinStep {
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStep::PrimeProject => "prime_project",
            BuiltinStep::ExportTests => "export_tests",
            BuiltinStep::RunTests => "run_tests",
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            BuiltinStep::PrimeProject => StepKind::Advisory,
            BuiltinStep::ExportTests => StepKind::Critical,
            BuiltinStep::RunTests => StepKind::Surfaced,
        }
    }
}

/// A single external command to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Human-readable step name.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Working directory, when it matters.
    pub cwd: Option<PathBuf>,

    pub kind: StepKind,
}

fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl StepConfig {
    /// Create a custom step.
    pub fn custom(name: String, command: Vec<String>, kind: StepKind) -> Self {
        Self {
            name,
            command,
            cwd: None,
            kind,
        }
    }

    /// Run in `dir`.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// `<runtime> --quit-after <frames> --headless -e --path <project>`
    ///
    /// The editor counts frames rather than wall-clock time, since import
    /// time depends on the project.
    pub fn prime_project(runtime: &Path, project_dir: &Path, quit_after_frames: u32) -> Self {
        let step = BuiltinStep::PrimeProject;
        Self::custom(
            step.name().to_string(),
            vec![
                arg(runtime),
                "--quit-after".to_string(),
                quit_after_frames.to_string(),
                "--headless".to_string(),
                "-e".to_string(),
                "--path".to_string(),
                arg(project_dir),
            ],
            step.kind(),
        )
    }

    /// `<runtime> --headless --path <project> --export-release <preset> <dest>`
    pub fn export_tests(runtime: &Path, project_dir: &Path, preset: &str, dest: &Path) -> Self {
        let step = BuiltinStep::ExportTests;
        Self::custom(
            step.name().to_string(),
            vec![
                arg(runtime),
                "--headless".to_string(),
                "--path".to_string(),
                arg(project_dir),
                "--export-release".to_string(),
                preset.to_string(),
                arg(dest),
            ],
            step.kind(),
        )
    }

    /// `<artifact> --headless --no-window ++ --test=determinism --target=<target>`
    pub fn run_tests(artifact: &Path, target: Target, build_dir: &Path) -> Self {
        let step = BuiltinStep::RunTests;
        Self::custom(
            step.name().to_string(),
            vec![
                arg(artifact),
                "--headless".to_string(),
                "--no-window".to_string(),
                "++".to_string(),
                "--test=determinism".to_string(),
                format!("--target={target}"),
            ],
            step.kind(),
        )
        .in_dir(build_dir)
    }

    /// The command line as it would be typed into a shell.
    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }
}
