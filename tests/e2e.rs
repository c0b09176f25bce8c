//! End-to-end tests that invoke the compiled `migrate` binary as a subprocess.
//!
//! These tests exercise the full path from CLI argument parsing and config
//! loading through to the SQLite database, reports and exit codes.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Locate the compiled binary built by `cargo test`.
fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_migrate"))
}

/// Root of the school fixture.
fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/school")
}

/// A scratch project: a copy of the fixture migrations and an empty database path.
struct Project {
    dir: TempDir,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrations = dir.path().join("migrations");
        std::fs::create_dir_all(&migrations).expect("create migrations dir");
        for entry in std::fs::read_dir(fixture_dir().join("migrations")).expect("read fixture") {
            let path = entry.expect("dir entry").path();
            let name = path.file_name().expect("file name");
            std::fs::copy(&path, migrations.join(name)).expect("copy migration");
        }
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn migrations(&self) -> PathBuf {
        self.path().join("migrations")
    }

    /// Run the binary inside the project with explicit database and migrations paths.
    fn run(&self, args: &[&str]) -> Output {
        let database = self.path().join("school.db");
        let migrations = self.migrations();
        Command::new(binary_path())
            .current_dir(self.path())
            .env_remove("RUST_LOG")
            .env_remove("MIGRATE_DATABASE")
            .arg("--database")
            .arg(&database)
            .arg("--migrations")
            .arg(&migrations)
            .args(args)
            .output()
            .expect("failed to execute migrate binary")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_up_applies_all_migrations() {
    let project = Project::new();
    let output = project.run(&["up"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("applied 20240101000000_InitialCreate"));
    assert!(text.contains("applied 20240103000000_AddCurricula"));
    assert!(text.contains("up: 3 of 3 migration(s) applied, state committed"));

    let again = project.run(&["up"]);
    assert_eq!(again.status.code(), Some(0));
    assert_eq!(stdout(&again), "up: nothing to do\n");
}

#[test]
fn test_status_json_after_partial_up() {
    let project = Project::new();
    let up = project.run(&["up", "--to", "20240102000000_AddClasses"]);
    assert_eq!(up.status.code(), Some(0), "stderr: {}", stderr(&up));

    let output = project.run(&["--format", "json", "status"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(value["applied"].as_array().map(Vec::len), Some(2));
    assert_eq!(value["pending"][0], "20240103000000_AddCurricula");
    assert_eq!(value["checksum_mismatches"].as_array().map(Vec::len), Some(0));
}

#[test]
fn test_down_reverts_one_step_by_default() {
    let project = Project::new();
    assert_eq!(project.run(&["up"]).status.code(), Some(0));

    let output = project.run(&["down"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("reverted 20240103000000_AddCurricula"));
    assert!(!text.contains("reverted 20240102000000_AddClasses"));

    let all = project.run(&["down", "--all"]);
    assert_eq!(all.status.code(), Some(0), "stderr: {}", stderr(&all));
    assert!(stdout(&all).contains("down: 2 of 2 migration(s) reverted"));
}

#[test]
fn test_unknown_target_exits_2() {
    let project = Project::new();
    let output = project.run(&["up", "--to", "20991231000000_Nope"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("unknown target migration"));
}

#[test]
fn test_missing_explicit_config_exits_2() {
    let project = Project::new();
    let output = project.run(&["--config", "nonexistent.toml", "status"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("Config file not found"));
}

#[test]
fn test_missing_default_config_is_fine() {
    let project = Project::new();
    let output = project.run(&["status"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("0 applied, 3 pending"));
}

#[test]
fn test_config_file_supplies_defaults() {
    let project = Project::new();
    std::fs::write(
        project.path().join("migrate.toml"),
        "[migrations]\nhistory_table = \"schema_history\"\n\n[output]\nformat = \"json\"\n",
    )
    .expect("write config");

    let output = project.run(&["up"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(value["state"], "committed");

    let conn = rusqlite::Connection::open(project.path().join("school.db")).expect("open db");
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM \"schema_history\"", [], |row| row.get(0))
        .expect("count ledger rows");
    assert_eq!(count, 3);
}

#[test]
fn test_edited_migration_is_refused() {
    let project = Project::new();
    assert_eq!(project.run(&["up"]).status.code(), Some(0));

    let path = project.migrations().join("20240103000000_AddCurricula.toml");
    let edited = std::fs::read_to_string(&path)
        .expect("read migration")
        .replace("max_length = 100", "max_length = 150");
    std::fs::write(&path, edited).expect("edit migration");

    let output = project.run(&["up"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("changed after it was applied"));

    let status = project.run(&["status"]);
    assert_eq!(status.status.code(), Some(1));
    assert!(stdout(&status).contains("changed  20240103000000_AddCurricula"));
}

#[test]
fn test_create_scaffolds_a_migration() {
    let project = Project::new();
    let output = project.run(&["create", "AddStudents"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let created: Vec<PathBuf> = std::fs::read_dir(project.migrations())
        .expect("read migrations")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with("_AddStudents.toml"))
        .collect();
    assert_eq!(created.len(), 1);
    assert!(stdout(&output).contains("_AddStudents.toml (0 operation(s))"));

    let bad = project.run(&["create", "add students"]);
    assert_eq!(bad.status.code(), Some(2));
}

#[test]
fn test_script_for_postgres_needs_no_database() {
    let project = Project::new();
    let output = project.run(&["script", "--dialect", "postgres", "--to", "20240101000000_InitialCreate"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let sql = stdout(&output);
    assert!(sql.starts_with("-- up 1 migration(s) for postgres\n"));
    assert!(sql.contains("CREATE TABLE \"Branches\""));
    assert!(sql.contains("\"__migration_history\""));
    assert!(sql.contains("COMMIT;"));
    assert!(!project.path().join("school.db").exists());
}

#[test]
fn test_postgres_dialect_cannot_run_directly() {
    let project = Project::new();
    std::fs::write(
        project.path().join("migrate.toml"),
        "[database]\ndialect = \"postgres\"\n",
    )
    .expect("write config");

    let output = project.run(&["up"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("no driver for dialect 'postgres'"));
}

#[test]
fn test_diff_writes_migration_that_applies() {
    let project = Project::new();
    let schema = fixture_dir().join("schema.toml");
    let output = project.run(&["diff", "--schema", schema.to_str().expect("utf8 path"), "RenameCurricula"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("_RenameCurricula.toml (2 operation(s))"));

    let up = project.run(&["up"]);
    assert_eq!(up.status.code(), Some(0), "stderr: {}", stderr(&up));
    assert!(stdout(&up).contains("up: 4 of 4 migration(s) applied"));

    let again = project.run(&["diff", "--schema", schema.to_str().expect("utf8 path"), "Nothing"]);
    assert_eq!(again.status.code(), Some(0));
    assert!(stderr(&again).contains("schema is up to date"));
}

#[test]
fn test_unlock_without_lock() {
    let project = Project::new();
    let output = project.run(&["unlock"]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "lock was not held\n");
}
