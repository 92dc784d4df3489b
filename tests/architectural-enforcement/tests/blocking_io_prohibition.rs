//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: The transport runs inside tokio tasks and MUST NOT block them.
//! **Required**: `tokio::net` for sockets; `std::fs` only outside async functions.

use architectural_enforcement::{production_files, scan, FnKind, SourceFile};

const BLOCKING_SOCKETS: &[&str] = &[
    "std::net::TcpStream",
    "std::net::TcpListener",
    "std::net::UdpSocket",
    "std::net::{TcpStream",
    "std::net::{TcpListener",
];

fn blocking_socket(_: &SourceFile, _: usize, code: &str) -> Option<&'static str> {
    BLOCKING_SOCKETS
        .iter()
        .any(|pattern| code.contains(pattern))
        .then_some("Blocking socket type")
}

fn blocking_fs_in_async(file: &SourceFile, idx: usize, code: &str) -> Option<&'static str> {
    (code.contains("std::fs::") && file.enclosing_fn(idx) == Some(FnKind::Async))
        .then_some("Blocking file I/O in async function")
}

fn report(violations: &[architectural_enforcement::Violation]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\nBlocking I/O found in production code:\n");
    for violation in violations {
        eprintln!("  {violation}");
    }
    eprintln!("\nREQUIRED async I/O:");
    eprintln!("  - tokio::net::TcpStream::connect().await");
    eprintln!("  - tokio::net::TcpListener::bind().await");
    eprintln!("  - tokio::fs inside async functions");

    panic!(
        "\nFound {} blocking I/O violation(s) in production code.",
        violations.len()
    );
}

/// The scan must actually see the transport sources
#[test]
fn test_production_sources_found() {
    let files = production_files();
    assert!(
        files
            .iter()
            .any(|f| f.path.ends_with("transport/connection.rs")),
        "production sources not found; scanned {} files",
        files.len()
    );
}

#[test]
fn test_no_blocking_sockets_in_production_code() {
    report(&scan(blocking_socket));
}

#[test]
fn test_no_blocking_fs_in_async_code() {
    report(&scan(blocking_fs_in_async));
}

#[test]
fn test_detector_flags_blocking_socket() {
    let file = SourceFile::from_source(
        std::path::Path::new("bad.rs"),
        "async fn dial() {\n    let s = std::net::TcpStream::connect(addr)?;\n}\n",
    );
    assert_eq!(file.check(blocking_socket).len(), 1);
}

#[test]
fn test_detector_allows_sync_config_loading() {
    let file = SourceFile::from_source(
        std::path::Path::new("config.rs"),
        "pub fn load(path: &Path) {\n    let s = std::fs::read_to_string(path)?;\n}\n",
    );
    assert!(file.check(blocking_fs_in_async).is_empty());

    let file = SourceFile::from_source(
        std::path::Path::new("bad.rs"),
        "pub async fn load(path: &Path) {\n    let s = std::fs::read_to_string(path)?;\n}\n",
    );
    assert_eq!(file.check(blocking_fs_in_async).len(), 1);
}
