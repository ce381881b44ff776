//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions in production code use `tokio::fs`,
//! `tokio::net` and async `reqwest`. Blocking calls are fine in plain
//! functions that run before the runtime does work (configuration loading).

use architectural_enforcement::{rust_sources, SourceFile, PRODUCTION_ROOTS};

#[test]
fn test_no_blocking_io_in_async_code() {
    let violations: Vec<String> = PRODUCTION_ROOTS
        .iter()
        .flat_map(|root| rust_sources(root))
        .flat_map(|file| blocking_violations(&file))
        .collect();

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O found in async production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::fs / tokio::net / async reqwest instead.");

        panic!("\nFound {} blocking I/O violation(s).", violations.len());
    }
}

fn blocking_violations(file: &SourceFile) -> Vec<String> {
    let mut violations = Vec::new();
    for idx in 0..file.lines.len() {
        if file.is_test_code(idx) {
            continue;
        }
        let code = file.code(idx);

        // Never acceptable, sync context or not.
        if code.contains("reqwest::blocking") {
            violations.push(file.describe(idx, "Blocking HTTP client"));
            continue;
        }
        if code.contains("std::net::TcpStream") || code.contains("std::net::TcpListener") {
            violations.push(file.describe(idx, "Blocking socket"));
            continue;
        }

        if !file.in_async_fn(idx) {
            continue;
        }
        if code.contains("std::fs::") {
            violations.push(file.describe(idx, "Blocking file I/O in async fn"));
        } else if code.contains("std::process::Command") {
            violations.push(file.describe(idx, "Blocking process I/O in async fn"));
        } else if code.contains("std::io::stdin()") {
            violations.push(file.describe(idx, "Blocking stdin in async fn"));
        }
    }
    violations
}

#[test]
fn test_sync_config_loading_is_allowed() {
    let file = SourceFile::from_lines(
        "resilience/core/src/config/mod.rs",
        &[
            "pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ResilienceConfig, ConfigError> {",
            "    let content = std::fs::read_to_string(config_path)?;",
            "}",
        ],
    );
    assert!(blocking_violations(&file).is_empty());
}

#[test]
fn test_blocking_read_in_async_fn_is_flagged() {
    let file = SourceFile::from_lines(
        "resilience/daemon/src/status.rs",
        &[
            "pub async fn write_to(&self, path: &Path) -> Result<()> {",
            "    std::fs::write(path, json)?;",
            "}",
        ],
    );
    assert_eq!(blocking_violations(&file).len(), 1);
}

#[test]
fn test_blocking_client_always_flagged() {
    let file = SourceFile::from_lines("resilience/daemon/src/probes.rs", &["use reqwest::blocking::Client;"]);
    assert_eq!(blocking_violations(&file).len(), 1);
}
