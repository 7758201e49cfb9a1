//! GR3D CI - determinism test pipeline for the godot-rapier-3d addon
//!
//! Provides a pipeline coordinator that:
//! - Resolves per-target metadata (runtime, templates, artifact names)
//! - Downloads and caches the engine runtime and export templates
//! - Primes, exports and runs the determinism test project per target
//! - Compares hash reports pairwise and writes diff artifacts

pub mod archive;
pub mod cache;
pub mod compare;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fakes;
pub mod pipeline;
pub mod reports;
pub mod runner;
pub mod step;
pub mod target;
pub mod telemetry;

// Re-export key types
pub use archive::{ArchiveExtractor, Extractor};
pub use cache::{CacheStore, Fetcher, HttpFetcher};
pub use compare::{ComparisonResult, DiffTool, GitDiff, ReportComparator, Verdict};
pub use config::{CiConfig, CompareOptions, MalformedPolicy};
pub use error::{CiError, Result};
pub use pipeline::{BatchResult, PipelineState, TargetPipeline, TargetRun};
pub use runner::{StepResult, StepRunner};
pub use step::{BuiltinStep, StepConfig, StepKind};
pub use target::{OsFamily, Target, TargetProfile};
