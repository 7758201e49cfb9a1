//! Target identifiers and the per-target metadata derived from them.
//!
//! Resolution is a pure lookup: the OS family of a target independently
//! selects the runtime binary name, the runtime archive naming convention and
//! the export-templates install path. Adding a target means adding a row to
//! the tables below, never a new code path.

use crate::config::{AddonRelease, EngineRelease};
use crate::error::{CiError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;

/// Operating system family of a target or CI runner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Windows,
    Macos,
    Linux,
}

impl OsFamily {
    pub fn name(&self) -> &'static str {
        match self {
            OsFamily::Windows => "windows",
            OsFamily::Macos => "macos",
            OsFamily::Linux => "linux",
        }
    }

    /// Map a CI runner OS label (`Windows`, `macOS`, `Linux`) to a family.
    pub fn from_runner_label(label: &str) -> Option<Self> {
        match label {
            "Windows" => Some(OsFamily::Windows),
            "macOS" => Some(OsFamily::Macos),
            "Linux" => Some(OsFamily::Linux),
            _ => None,
        }
    }

    /// Runtime executable, relative to the directory the runtime archive is
    /// extracted into.
    pub fn runtime_binary_name(&self, engine_version: &str) -> String {
        match self {
            OsFamily::Windows => format!("Godot_v{engine_version}_win64_console.exe"),
            OsFamily::Macos => "Godot.app/Contents/MacOS/Godot".to_string(),
            OsFamily::Linux => format!("Godot_v{engine_version}_linux.x86_64"),
        }
    }

    /// Suffix of the runtime release archive.
    pub fn runtime_archive_suffix(&self) -> &'static str {
        match self {
            OsFamily::Windows => "win64.exe.zip",
            OsFamily::Macos => "macos.universal.zip",
            OsFamily::Linux => "linux.x86_64.zip",
        }
    }

    /// Where the runtime looks for installed export templates, relative to
    /// the home directory.
    pub fn export_templates_trail(&self) -> &'static str {
        match self {
            OsFamily::Windows => "AppData/Roaming/Godot/export_templates",
            OsFamily::Macos => "Library/Application Support/Godot/export_templates",
            OsFamily::Linux => ".local/share/godot/export_templates",
        }
    }

    /// Extension of the addon's native library.
    pub fn addon_library_extension(&self) -> &'static str {
        match self {
            OsFamily::Windows => "dll",
            OsFamily::Macos => "dylib",
            OsFamily::Linux => "so",
        }
    }

    /// Archive format of the released addon package.
    pub fn addon_package_extension(&self) -> &'static str {
        match self {
            OsFamily::Windows => "zip",
            _ => "tar.gz",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Export-templates install directory for `os` under `home`.
///
/// The runtime names the directory after its version with `-` replaced by
/// `.` (`4.4-stable` installs into `4.4.stable`).
pub fn export_templates_dir(os: OsFamily, home: &Path, engine_version: &str) -> PathBuf {
    home.join(os.export_templates_trail())
        .join(engine_version.replace('-', "."))
}

/// Supported build targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    #[serde(rename = "i686-pc-windows-msvc")]
    I686PcWindowsMsvc,
    #[serde(rename = "x86_64-pc-windows-msvc")]
    X86_64PcWindowsMsvc,
    #[serde(rename = "x86_64-apple-darwin")]
    X86_64AppleDarwin,
    #[serde(rename = "aarch64-apple-darwin")]
    Aarch64AppleDarwin,
    #[serde(rename = "i686-unknown-linux-gnu")]
    I686UnknownLinuxGnu,
    #[serde(rename = "x86_64-unknown-linux-gnu")]
    X86_64UnknownLinuxGnu,
    #[serde(rename = "aarch64-unknown-linux-gnu")]
    Aarch64UnknownLinuxGnu,
}

impl Target {
    /// Every target the pipeline knows about.
    pub const ALL: [Target; 7] = [
        Target::I686PcWindowsMsvc,
        Target::X86_64PcWindowsMsvc,
        Target::X86_64AppleDarwin,
        Target::Aarch64AppleDarwin,
        Target::I686UnknownLinuxGnu,
        Target::X86_64UnknownLinuxGnu,
        Target::Aarch64UnknownLinuxGnu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::I686PcWindowsMsvc => "i686-pc-windows-msvc",
            Target::X86_64PcWindowsMsvc => "x86_64-pc-windows-msvc",
            Target::X86_64AppleDarwin => "x86_64-apple-darwin",
            Target::Aarch64AppleDarwin => "aarch64-apple-darwin",
            Target::I686UnknownLinuxGnu => "i686-unknown-linux-gnu",
            Target::X86_64UnknownLinuxGnu => "x86_64-unknown-linux-gnu",
            Target::Aarch64UnknownLinuxGnu => "aarch64-unknown-linux-gnu",
        }
    }

    pub fn os_family(&self) -> OsFamily {
        match self {
            Target::I686PcWindowsMsvc | Target::X86_64PcWindowsMsvc => OsFamily::Windows,
            Target::X86_64AppleDarwin | Target::Aarch64AppleDarwin => OsFamily::Macos,
            Target::I686UnknownLinuxGnu
            | Target::X86_64UnknownLinuxGnu
            | Target::Aarch64UnknownLinuxGnu => OsFamily::Linux,
        }
    }

    /// Extension of the exported test artifact.
    pub fn test_artifact_extension(&self) -> &'static str {
        match self {
            Target::I686PcWindowsMsvc | Target::X86_64PcWindowsMsvc => "exe",
            Target::X86_64AppleDarwin | Target::Aarch64AppleDarwin => "zip",
            Target::I686UnknownLinuxGnu => "x86_32",
            Target::X86_64UnknownLinuxGnu => "x86_64",
            Target::Aarch64UnknownLinuxGnu => "arm64",
        }
    }

    /// Comma-separated list of every valid identifier.
    pub fn valid_list() -> String {
        Target::ALL
            .iter()
            .map(Target::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Validate a whole argument list before any I/O happens.
    ///
    /// An empty list is rejected the same way an unknown identifier is.
    pub fn parse_all<S: AsRef<str>>(args: &[S]) -> Result<Vec<Target>> {
        if args.is_empty() {
            error!(valid = %Target::valid_list(), "No target passed");
            return Err(CiError::InvalidTarget {
                target: String::new(),
                valid: Target::valid_list(),
            });
        }
        args.iter().map(|a| a.as_ref().parse()).collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = CiError;

    fn from_str(s: &str) -> Result<Self> {
        Target::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                error!(triple = %s, valid = %Target::valid_list(), "Invalid target passed");
                CiError::InvalidTarget {
                    target: s.to_string(),
                    valid: Target::valid_list(),
                }
            })
    }
}

/// Read-only metadata derived from a [`Target`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetProfile {
    pub target: Target,
    pub os_family: OsFamily,

    /// Runtime executable, relative to the cache directory.
    pub runtime_binary_name: String,
    pub runtime_download_url: String,
    pub export_templates_url: String,

    pub test_artifact_extension: String,
    /// File name of the exported test artifact inside the build directory.
    pub test_artifact_name: String,
    /// Export preset the runtime builds the test artifact with.
    pub export_preset: String,

    pub addon_binary_name: String,
    pub addon_download_url: String,
}

impl TargetProfile {
    /// Derive the profile for `target`. Pure: same input, same output.
    pub fn resolve(target: Target, engine: &EngineRelease, addon: &AddonRelease) -> Self {
        let os = target.os_family();
        let version = &engine.version;
        let ext = target.test_artifact_extension();
        let release_dir = format!("{}/{}", engine.base_url.trim_end_matches('/'), version);

        Self {
            target,
            os_family: os,
            runtime_binary_name: os.runtime_binary_name(version),
            runtime_download_url: format!(
                "{release_dir}/Godot_v{version}_{}",
                os.runtime_archive_suffix()
            ),
            export_templates_url: format!("{release_dir}/Godot_v{version}_export_templates.tpz"),
            test_artifact_extension: ext.to_string(),
            test_artifact_name: format!("gr3d-tests-{target}.{ext}"),
            export_preset: format!("tests--{target}"),
            addon_binary_name: format!("{target}-godot_rapier_3d.{}", os.addon_library_extension()),
            addon_download_url: format!(
                "{}/{}/download/godot-rapier-3d--{target}.{}",
                addon.base_url.trim_end_matches('/'),
                addon.version,
                os.addon_package_extension()
            ),
        }
    }

    /// Parse and resolve in one step.
    pub fn resolve_str(target: &str, engine: &EngineRelease, addon: &AddonRelease) -> Result<Self> {
        Ok(Self::resolve(target.parse()?, engine, addon))
    }
}
