//! End-to-end tests for the `ragtune` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn ragtune() -> Command {
    Command::cargo_bin("ragtune").unwrap()
}

fn write_local_job(dir: &Path) {
    let records = [
        r#"{"instruction":"Who wrote it?","context":"It was written by Ann.","response":"Ann.","category":"closed_qa"}"#,
        r#"{"instruction":"List the colors.","context":"Red and blue.","response":"red, blue","category":"information_extraction"}"#,
        r#"{"instruction":"Write a poem.","context":"","response":"Roses.","category":"creative_writing"}"#,
    ];
    std::fs::write(dir.join("data.jsonl"), records.join("\n")).unwrap();
    std::fs::write(
        dir.join("ragtune.toml"),
        format!(
            r#"
[model]
model_id = "local/model"

[dataset]
type = "jsonl"
path = "{}"

[training]
output_dir = "{}"
"#,
            dir.join("data.jsonl").display(),
            dir.join("outputs").display()
        ),
    )
    .unwrap();
}

#[test]
fn test_help_lists_commands() {
    ragtune()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("prepare"))
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("list"));
}

#[test]
fn test_init_writes_job_file_once() {
    let temp = TempDir::new().unwrap();
    ragtune().current_dir(temp.path()).arg("init").assert().success();
    let contents = std::fs::read_to_string(temp.path().join("ragtune.toml")).unwrap();
    assert!(contents.contains("databricks/databricks-dolly-15k"));

    ragtune()
        .current_dir(temp.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    ragtune().current_dir(temp.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn test_prepare_filters_local_dataset() {
    let temp = TempDir::new().unwrap();
    write_local_job(temp.path());

    let assert = ragtune()
        .current_dir(temp.path())
        .args(["prepare", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["stats"]["total"], 3);
    assert_eq!(value["stats"]["kept"], 2);
    assert_eq!(value["stats"]["dropped"], 1);

    let written = std::fs::read_to_string(temp.path().join("outputs").join("dataset.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 2);
}

#[test]
fn test_train_help_offers_dry_run() {
    ragtune()
        .args(["train", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_prepare_without_job_file_fails() {
    let temp = TempDir::new().unwrap();
    ragtune()
        .current_dir(temp.path())
        .arg("prepare")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ragtune init"));
}

#[test]
fn test_list_empty_root() {
    let temp = TempDir::new().unwrap();
    ragtune()
        .args(["list", "--json"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));

    ragtune()
        .arg("list")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs found"));
}
