use std::path::Path;

use predicates::prelude::*;

const PAGE: &str = r#"<!doctype html>
<html>
  <head><title>The Harbour Gates</title></head>
  <body>
    <nav><a href="/">Home</a> | <a href="/about">About</a></nav>
    <article>
      <h1>The Harbour Gates</h1>
      <p>The harbour gates opened at dawn, and the fishing boats slid out past the
      lighthouse one after another while the keeper logged the tide in his ledger.</p>
      <p>By noon the wind had turned. Gulls wheeled over the breakwater and the keeper
      climbed the tower stairs to trim the lamp before the weather closed in.</p>
      <p>When the boats returned at dusk the gates swung shut behind them, and the town
      settled into the long quiet of a winter evening by the sea.</p>
    </article>
  </body>
</html>
"#;

fn chapterflow(data_dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("chapterflow");
    cmd.env_remove("CHAPTERFLOW_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--data-dir")
        .arg(data_dir)
        .args(["--engine", "noop"]);
    cmd
}

fn page_url(dir: &Path) -> String {
    let page = dir.join("harbour.html");
    std::fs::write(&page, PAGE).expect("write page");
    url::Url::from_file_path(&page)
        .expect("file url")
        .to_string()
}

fn pending_request_id(data_dir: &Path) -> String {
    let output = chapterflow(data_dir)
        .args(["reviews", "--json"])
        .output()
        .expect("run reviews");
    assert!(output.status.success());
    let pending: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("reviews json");
    pending[0]["id"]
        .as_str()
        .expect("pending request id")
        .to_owned()
}

#[test]
fn process_review_and_publish_a_local_page() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let data_dir = temp.path().join("data");
    let url = page_url(temp.path());

    chapterflow(&data_dir)
        .args(["process", "--url", &url])
        .assert()
        .success()
        .stdout(predicate::str::contains("HUMAN_REVIEW_PENDING"))
        .stdout(predicate::str::contains("review request: "));

    let request_id = pending_request_id(&data_dir);

    chapterflow(&data_dir)
        .args(["review", "approve", "--request", &request_id, "--reviewer", "editor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FINALIZED"));

    // Resolved requests cannot be decided twice.
    chapterflow(&data_dir)
        .args(["review", "approve", "--request", &request_id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already resolved"));

    chapterflow(&data_dir)
        .args(["publication", "view"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# Untitled"))
        .stdout(predicate::str::contains("lighthouse"));

    let out = temp.path().join("publication");
    chapterflow(&data_dir)
        .args(["publication", "export", "--zip", "--out"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("publication.zip"));
    assert!(out.join("book.md").is_file());
    assert!(out.join("book.json").is_file());
    assert!(out.join("publication.zip").is_file());

    chapterflow(&data_dir)
        .args(["publication", "export", "--out"])
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    let output = chapterflow(&data_dir)
        .args(["status", "--json"])
        .output()
        .expect("run status");
    assert!(output.status.success());
    let chapters: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status json");
    let chapter_id = chapters[0]["id"].as_str().expect("chapter id").to_owned();

    chapterflow(&data_dir)
        .args(["history", "show", "--chapter", &chapter_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("RAW"))
        .stdout(predicate::str::contains("AI_REVIEWED"))
        .stdout(predicate::str::contains("FINALIZED"));

    chapterflow(&data_dir)
        .args(["search", "--query", "lighthouse keeper tide", "--k", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains(chapter_id.as_str()));

    chapterflow(&data_dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total_versions\": 5"));

    chapterflow(&data_dir)
        .arg("reindex")
        .assert()
        .success()
        .stdout("indexed 5 version(s)\n");
}

#[test]
fn unknown_request_fails_with_not_found() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    chapterflow(temp.path())
        .args(["review", "reject", "--request", "missing", "--feedback", "no"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn scrape_only_stops_at_raw() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    let data_dir = temp.path().join("data");
    let url = page_url(temp.path());

    chapterflow(&data_dir)
        .args(["process", "--scrape-only", "--url", &url])
        .assert()
        .success()
        .stdout(predicate::str::contains("\tRAW\t"));

    chapterflow(&data_dir)
        .args(["reviews"])
        .assert()
        .success()
        .stdout("");
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() {
    let temp = tempfile::TempDir::new().expect("tempdir");
    chapterflow(temp.path())
        .env("RUST_LOG", "debug")
        .arg("stats")
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}
