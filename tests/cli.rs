use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn civic_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("civic");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    fs::write(
        data_dir.join("places.csv"),
        "place_id,display_name,pop_estimate_2022,lat,long\n\
         p1,Springfield City,120000,39.78,-89.65\n\
         p2,Shelbyville,8000,39.40,-88.80\n\
         ,Nowhere,100,1.0,1.0\n",
    )
    .unwrap();
    fs::write(
        data_dir.join("contacts.csv"),
        "id,place_id,first_name,emails,title\n\
         c1,p1,Bob,bob@springfield.gov,Finance Director\n\
         c2,p2,Alice,alice@shelbyville.gov,City Clerk\n\
         c3,,Carol,carol@state.gov,Finance Analyst\n\
         c4,,,,\n",
    )
    .unwrap();
    fs::write(
        data_dir.join("techstacks.csv"),
        "place_id,name,category\np1,Accela,permitting\np2,Tyler,erp\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/civic.sqlite"

[sources]
dir = "{root}/data"

[loader]
chunk_size = 2

[query]
row_limit = 50
"#,
        root = root.display()
    );

    let config_path = config_dir.join("civic.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_civic(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = civic_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run civic binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_civic(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_civic(&config_path, &["init"]);
    assert!(success, "second init failed (not idempotent)");
}

#[test]
fn test_pipeline_reports_summary() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_civic(&config_path, &["pipeline", "--seed-mappings", "--progress", "off"]);
    assert!(success, "pipeline failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Created 2 ids in"));
    assert!(stdout.contains("snapshot: v1"));
    assert!(stdout.contains("records: 4"));
    assert!(stdout.contains("ok"));
    // The place without an id is rejected but does not fail the run
    assert!(stderr.contains("rejected: places line 4"));
}

#[test]
fn test_query_title() {
    let (_tmp, config_path) = setup_test_env();
    run_civic(&config_path, &["pipeline", "--progress", "off"]);

    let (stdout, stderr, success) = run_civic(&config_path, &["query", "title: finance"]);
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("1. c1 / springfield city"));
    assert!(stdout.contains("2. c3 / (no entity)"));
    assert!(stdout.contains("Returned 2 rows."));
}

#[test]
fn test_query_json_and_explain() {
    let (_tmp, config_path) = setup_test_env();
    run_civic(&config_path, &["pipeline", "--progress", "off"]);

    let (stdout, stderr, success) = run_civic(
        &config_path,
        &["query", "filter: bob accela >10000", "--json", "--explain"],
    );
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stderr.contains("r.population > ?"));

    let rows: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["contact_id"], "c1");
    assert_eq!(rows[0]["tech_names"], "accela");
    assert!(rows[0].get("document").is_none());
}

#[test]
fn test_query_syntax_error_exits_nonzero() {
    let (_tmp, config_path) = setup_test_env();
    run_civic(&config_path, &["pipeline", "--progress", "off"]);

    let (stdout, stderr, success) = run_civic(&config_path, &["query", "filter: >abc"]);
    assert!(!success, "syntax error should fail: stdout={}", stdout);
    assert!(stderr.contains(">abc"));
    assert!(!stdout.contains("Returned"));
}

#[test]
fn test_pipeline_missing_contacts_fails() {
    let (tmp, config_path) = setup_test_env();
    fs::remove_file(tmp.path().join("data/contacts.csv")).unwrap();

    let (_, stderr, success) = run_civic(&config_path, &["pipeline", "--progress", "off"]);
    assert!(!success);
    assert!(stderr.contains("contacts.csv"));
}

#[test]
fn test_get_and_stats() {
    let (_tmp, config_path) = setup_test_env();
    run_civic(&config_path, &["pipeline", "--progress", "off"]);

    let (stdout, _, success) = run_civic(&config_path, &["get", "c1"]);
    assert!(success);
    assert!(stdout.contains("place_id:      p1"));
    assert!(stdout.contains("tech_names:    accela"));

    let (_, _, success) = run_civic(&config_path, &["get", "nope"]);
    assert!(!success);

    let (stdout, _, success) = run_civic(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Contacts:    4 (2 without entity)"));
    assert!(stdout.contains("Snapshot:    v1"));
}

#[test]
fn test_shell_reads_stdin() {
    use std::io::Write;
    use std::process::Stdio;

    let (_tmp, config_path) = setup_test_env();
    run_civic(&config_path, &["pipeline", "--progress", "off"]);

    let mut child = Command::new(civic_binary())
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("shell")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"crm: a\nfinance\nquit\n")
        .unwrap();
    let output = child.wait_with_output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("Returned 0 rows."));
    assert!(stdout.contains("Returned 2 rows."));
}

#[test]
fn test_sources_lists_files() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_civic(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("contacts"));
    assert!(stdout.contains("customer_a"));
}
