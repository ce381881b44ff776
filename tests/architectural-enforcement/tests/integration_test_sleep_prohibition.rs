//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code never blocks a thread with `std::thread::sleep`.
//! Async sleeps are allowed only at the two sanctioned suspension points:
//! the retry backoff wait and the recovery settle wait before a re-probe.
//! Periodic work uses `tokio::time::interval`.

use architectural_enforcement::{rust_sources, SourceFile, PRODUCTION_ROOTS};

/// Files allowed to await `tokio::time::sleep`
const ASYNC_SLEEP_ALLOWED: [&str; 2] = ["core/src/retry/mod.rs", "core/src/monitoring/recovery.rs"];

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<String> = PRODUCTION_ROOTS
        .iter()
        .flat_map(|root| rust_sources(root))
        .flat_map(|file| sleep_violations(&file))
        .collect();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable: retry backoff, recovery settle, test code, tokio::time::interval");

        panic!("\nFound {} sleep violation(s) in production code.", violations.len());
    }
}

fn sleep_violations(file: &SourceFile) -> Vec<String> {
    let async_allowed = ASYNC_SLEEP_ALLOWED.iter().any(|suffix| file.path.ends_with(suffix));

    (0..file.lines.len())
        .filter(|&idx| !file.is_test_code(idx))
        .filter_map(|idx| {
            let code = file.code(idx);
            if code.contains("thread::sleep(") {
                Some(file.describe(idx, "Thread sleep"))
            } else if code.contains("::sleep(") && !async_allowed {
                Some(file.describe(idx, "Async sleep outside sanctioned wait"))
            } else {
                None
            }
        })
        .collect()
}

#[test]
fn test_detects_thread_sleep() {
    let file = SourceFile::from_lines(
        "resilience/core/src/health/mod.rs",
        &["fn poll() {", "    std::thread::sleep(Duration::from_millis(10));", "}"],
    );
    assert_eq!(sleep_violations(&file).len(), 1);
}

#[test]
fn test_backoff_wait_is_allowed() {
    let file = SourceFile::from_lines(
        "resilience/core/src/retry/mod.rs",
        &["async fn wait(delay: Duration) {", "    tokio::time::sleep(delay).await;", "}"],
    );
    assert!(sleep_violations(&file).is_empty());
}

#[test]
fn test_async_sleep_elsewhere_is_flagged() {
    let file = SourceFile::from_lines(
        "resilience/daemon/src/watcher.rs",
        &["async fn poll() {", "    tokio::time::sleep(Duration::from_secs(30)).await;", "}"],
    );
    assert_eq!(sleep_violations(&file).len(), 1);
}
