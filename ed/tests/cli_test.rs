//! CLI tests against a throwaway database

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(templates.join("img.html"), "<img src=\"{{url}}\" data-id=\"{{measurementId}}\">").unwrap();

        let config = dir.path().join("encore.yml");
        fs::write(
            &config,
            format!(
                "storage:\n  database: {}\nserver:\n  templates-path: {}\n",
                dir.path().join("encore.db").display(),
                templates.display()
            ),
        )
        .unwrap();
        Self { dir, config }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn encore(&self) -> Command {
        let mut cmd = Command::cargo_bin("encore").unwrap();
        cmd.current_dir(self.path())
            .arg("--config")
            .arg(&self.config)
            .arg("--log-file")
            .arg(self.path().join("encore.log"));
        cmd
    }

    fn definitions(&self) -> PathBuf {
        let path = self.path().join("definitions.yml");
        fs::write(
            &path,
            "tasks:\n  - taskType: img\n    url: http://a.example/x.png\n\
             schedules:\n  - priority: 1\n    max-duration-secs: 3600\n",
        )
        .unwrap();
        path
    }
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("encore")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("promote"))
        .stdout(predicate::str::contains("stats"));
}

#[test]
fn test_load_promote_status() {
    let ws = Workspace::new();

    ws.encore()
        .arg("load")
        .arg(ws.definitions())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 tasks and 1 schedules"));

    ws.encore()
        .arg("promote")
        .assert()
        .success()
        .stdout(predicate::str::contains("Promoted"));

    ws.encore()
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tasks\": 1"))
        .stdout(predicate::str::contains("\"schedule_id\": 1"));

    assert!(ws.path().join("encore.log").exists());
}

#[test]
fn test_select_renders_task() {
    let ws = Workspace::new();
    ws.encore().arg("load").arg(ws.definitions()).assert().success();
    ws.encore().arg("promote").assert().success();

    ws.encore()
        .args(["select", "--path", "/task.html"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("<img src=\"http://a.example/x.png\""));

    ws.encore()
        .args(["select", "--hint", "disable=true"])
        .assert()
        .success()
        .stderr(predicate::str::contains("opted out"));
}

#[test]
fn test_select_without_active_schedules_fails() {
    let ws = Workspace::new();
    ws.encore()
        .args(["select", "--path", "/task.html"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No task served"));
}

#[test]
fn test_stats_for_unknown_site() {
    let ws = Workspace::new();
    ws.encore().arg("parse").assert().success();
    ws.encore()
        .args(["stats", "http://site.example/page?x=1", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"site\": \"http://site.example/page\""))
        .stdout(predicate::str::contains("\"total_results\": 0"));
}

#[test]
fn test_stats_rejects_invalid_referer() {
    let ws = Workspace::new();
    ws.encore()
        .args(["stats", "not a url"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid referer"));
}
