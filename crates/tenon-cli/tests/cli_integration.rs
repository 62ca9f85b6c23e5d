//! Integration tests for the `tenon` binary

use std::io::Write;
use std::process::Command;

fn tenon() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tenon"))
}

fn settings_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_check_config_prints_effective_settings() {
    let file = settings_file("[executor]\nworkers = 3\npolicy = \"work-stealing\"\n");
    let output = tenon()
        .args(["check-config"])
        .arg(file.path())
        .output()
        .unwrap();

    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("is valid (3 worker threads)"));
    assert!(stdout.contains("policy = \"work-stealing\""));
    assert!(stdout.contains("[server]"));
}

#[test]
fn test_check_config_rejects_bad_values() {
    let file = settings_file("[server]\nread_buffer_size = 0\n");
    let output = tenon()
        .args(["check-config"])
        .arg(file.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("read_buffer_size"), "stderr: {}", stderr);
}

#[test]
fn test_serve_runs_for_duration() {
    let output = tenon()
        .args([
            "serve",
            "--addr",
            "127.0.0.1:0",
            "--threads",
            "2",
            "--duration",
            "1",
        ])
        .output()
        .unwrap();

    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("tenon listening on http://127.0.0.1:"));
    assert!(stdout.contains("(2 workers)"));
}
