//! A non-zero test exit is surfaced but reports are still collected.
#![cfg(unix)]

mod support;

use gr3d_ci::{PipelineState, Target};
use support::{fixture, RuntimeBehavior};

/// Test: failing test binary still yields a collected report
#[tokio::test]
async fn test_non_zero_test_exit_still_collects_report() {
    let target = Target::Aarch64UnknownLinuxGnu;
    let fx = fixture(
        &[target],
        RuntimeBehavior {
            test_exit: 4,
            ..RuntimeBehavior::default()
        },
        None,
    );

    let run = fx.pipeline.run(target).await;

    assert_eq!(run.state, PipelineState::ReportCollected);
    assert!(!run.passed());
    let error = run.test_error.as_deref().expect("test error recorded");
    assert!(error.contains("aarch64-unknown-linux-gnu"));
    assert!(error.contains('4'));
    assert_eq!(run.failure_reason(), Some(error));

    assert_eq!(run.steps.last().unwrap().exit_code, 4);
    assert_eq!(run.reports.len(), 1);
    assert!(run.reports[0].is_file());
}
