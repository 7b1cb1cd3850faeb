use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn assist_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("assist");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let docs = root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(
        docs.join("spec.txt"),
        "The system uses a token bucket for rate limiting.",
    )
    .unwrap();
    fs::write(
        docs.join("deploy.md"),
        "# Deploy\n\nReleases ship as Docker images to Kubernetes.",
    )
    .unwrap();
    fs::write(docs.join("image.bin"), [0u8, 159, 146, 150]).unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_path = config_dir.join("assist.toml");
    fs::write(
        &config_path,
        format!(
            r#"[retrieval]
provider = "local"

[retrieval.source]
root = "{}"
"#,
            docs.display().to_string().replace('\\', "/")
        ),
    )
    .unwrap();

    (tmp, config_path)
}

fn run_assist(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(assist_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run assist");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_index_reports_counts() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_assist(&config, &["index", "--progress", "off"]);
    assert!(ok, "index failed: {}", stderr);
    assert!(stdout.contains("index local"));
    assert!(stdout.contains("files: 2"));
    assert!(stdout.contains("chunks: 2"));
}

#[test]
fn test_query_prints_context() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_assist(&config, &["query", "rate limiting", "--progress", "json"]);
    assert!(ok, "query failed: {}", stderr);
    assert!(stdout.starts_with("Source: spec.txt (score "));
    assert!(stdout.contains("token bucket"));
    assert!(stderr.contains("\"event\":\"status\""));
}

#[test]
fn test_query_without_match() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _stderr, ok) = run_assist(&config, &["query", "quantum chromodynamics"]);
    assert!(ok);
    assert!(stdout.contains("No matching context."));
}

#[test]
fn test_disabled_retrieval_errors() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("assist.toml");
    fs::write(&config, "[retrieval]\nprovider = \"disabled\"\n").unwrap();
    let (_stdout, stderr, ok) = run_assist(&config, &["index"]);
    assert!(!ok);
    assert!(stderr.contains("Retrieval is disabled"));
}

#[test]
fn test_invalid_config_errors() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("assist.toml");
    fs::write(&config, "[retrieval]\nprovider = \"local\"\n").unwrap();
    let (_stdout, stderr, ok) = run_assist(&config, &["index"]);
    assert!(!ok);
    assert!(stderr.contains("source.root"));
}
