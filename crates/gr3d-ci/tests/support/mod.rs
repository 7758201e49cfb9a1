//! Shared fixtures: a shell-script stand-in for the engine runtime, served
//! from an in-memory fetcher as a zip archive.

#![allow(dead_code)]

use gr3d_ci::fakes::MemoryFetcher;
use gr3d_ci::{ArchiveExtractor, CacheStore, CiConfig, Target, TargetPipeline, TargetProfile};
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

/// Fake runtime.
///
/// - `-e` (priming): prints and exits 0.
/// - `--export-release <preset> <dest>`: writes [`TEST_BINARY`] to `<dest>`,
///   unless the preset names a target listed in `$FAIL_EXPORT`. A `.zip`
///   destination gets the prebuilt macOS bundle copied there instead.
pub const FAKE_RUNTIME: &str = r#"#!/bin/sh
for a in "$@"; do last="$a"; done
case " $* " in
  *" --export-release "*)
    for f in __FAIL_EXPORT__ no-such-target; do
      case "$*" in *"tests--$f "*) echo "export failed for $f" >&2; exit 3;; esac
    done
    case "$last" in
      *.zip)
        cp "__BUNDLE_ZIP__" "$last"
        ;;
      *)
        cat > "$last" <<'EOS'
__TEST_BINARY__
EOS
        chmod +x "$last"
        ;;
    esac
    ;;
  *" -e "*)
    echo "editor primed"
    ;;
esac
exit 0
"#;

/// Exported test binary. Writes `reports/run-report.txt` relative to its
/// working directory with a fixed hash table, then exits with `$TEST_EXIT`.
pub const TEST_BINARY: &str = r#"#!/bin/sh
mkdir -p reports
printf 'Determinism report\nArgs: %s\nStep\tHash\n1\th1\n2\th2\n' "$*" > reports/run-report.txt
echo "determinism test done"
exit __TEST_EXIT__"#;

/// Executable inside the exported macOS bundle.
pub const BUNDLE_EXECUTABLE: &str = "gr3d-tests.app/Contents/MacOS/gr3d-tests";

/// Zip archive in memory, every entry with the given unix mode.
pub fn zip_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut zw = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data, mode) in entries {
        zw.start_file(*name, SimpleFileOptions::default().unix_permissions(*mode))
            .unwrap();
        zw.write_all(data).unwrap();
    }
    zw.finish().unwrap().into_inner()
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: Arc<CiConfig>,
    pub fetcher: Arc<MemoryFetcher>,
    pub pipeline: TargetPipeline,
}

/// Fake runtime behavior knobs.
#[derive(Default)]
pub struct RuntimeBehavior {
    /// Targets whose export exits non-zero.
    pub fail_export: Vec<Target>,
    /// Exit code of the exported test binary.
    pub test_exit: i32,
}

/// Project, home and cache in a fresh temp dir, with the runtime and export
/// templates served for every target in `targets`.
pub fn fixture(targets: &[Target], behavior: RuntimeBehavior, max_parallel: Option<usize>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(&project).unwrap();

    let config = CiConfig::new(&project, dir.path().join("home"))
        .with_settle_delay(Duration::ZERO)
        .with_max_parallel(max_parallel);

    let fail_list = behavior
        .fail_export
        .iter()
        .map(Target::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    let test_binary = TEST_BINARY.replace("__TEST_EXIT__", &behavior.test_exit.to_string());
    let bundle_zip = dir.path().join("bundle.zip");
    std::fs::write(
        &bundle_zip,
        zip_bytes(&[
            ("gr3d-tests.app/Contents/Info.plist", &b"<plist/>"[..], 0o644),
            (BUNDLE_EXECUTABLE, test_binary.as_bytes(), 0o755),
        ]),
    )
    .unwrap();
    let script = FAKE_RUNTIME
        .replace("__FAIL_EXPORT__", &fail_list)
        .replace("__BUNDLE_ZIP__", bundle_zip.to_str().unwrap())
        .replace("__TEST_BINARY__", &test_binary);

    let mut fetcher = MemoryFetcher::new();
    for target in targets {
        let profile = TargetProfile::resolve(*target, &config.engine, &config.addon);
        fetcher = fetcher
            .with_response(
                &profile.runtime_download_url,
                zip_bytes(&[(
                    profile.runtime_binary_name.as_str(),
                    script.as_bytes(),
                    0o755,
                )]),
            )
            .with_response(
                &profile.export_templates_url,
                zip_bytes(&[
                    ("templates/version.txt", &b"4.4.stable"[..], 0o644),
                    ("templates/linux_release.x86_64", &b"template"[..], 0o755),
                ]),
            );
    }
    let fetcher = Arc::new(fetcher);
    let config = Arc::new(config);
    let cache = CacheStore::new(fetcher.clone(), Arc::new(ArchiveExtractor));
    let pipeline = TargetPipeline::new(config.clone(), Arc::new(cache));

    Fixture {
        dir,
        config,
        fetcher,
        pipeline,
    }
}
