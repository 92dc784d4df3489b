//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT park a runtime thread.
//! **Acceptable**: `tokio::time::sleep` for error back-off and retry delays,
//! `tokio::time::interval` for periodic checks.

use architectural_enforcement::{scan, SourceFile, Violation};

fn thread_sleep(_: &SourceFile, _: usize, code: &str) -> Option<&'static str> {
    (code.contains("thread::sleep") || code.contains("std::thread::park"))
        .then_some("Thread sleep")
}

fn blocking_wait(_: &SourceFile, _: usize, code: &str) -> Option<&'static str> {
    (code.contains("block_on(") || code.contains("blocking_lock()"))
        .then_some("Blocking wait on the runtime")
}

fn report(violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\nSleep calls found in production code:\n");
    for violation in violations {
        eprintln!("  {violation}");
    }
    eprintln!("\nACCEPTABLE:");
    eprintln!("  - tokio::time::sleep for back-off between failed attempts");
    eprintln!("  - tokio::time::interval for periodic tasks");
    eprintln!("\nFORBIDDEN:");
    eprintln!("  - std::thread::sleep anywhere in production code");
    eprintln!("  - block_on inside library code");

    panic!(
        "\nFound {} sleep violation(s) in production code.",
        violations.len()
    );
}

#[test]
fn test_no_thread_sleep_in_production_code() {
    report(&scan(thread_sleep));
}

#[test]
fn test_no_blocking_waits_in_production_code() {
    report(&scan(blocking_wait));
}

#[test]
fn test_detector_flags_thread_sleep() {
    let file = SourceFile::from_source(
        std::path::Path::new("bad.rs"),
        "fn retry() {\n    std::thread::sleep(Duration::from_millis(150));\n}\n",
    );
    assert_eq!(file.check(thread_sleep).len(), 1);

    let file = SourceFile::from_source(
        std::path::Path::new("good.rs"),
        "async fn retry() {\n    tokio::time::sleep(Duration::from_millis(150)).await;\n}\n",
    );
    assert!(file.check(thread_sleep).is_empty());
}
