//! CLI subprocess integration tests.
//!
//! These tests invoke the `spackle` binary as a subprocess against a scratch
//! install tree and check exit codes, stdout content, and JSON output.

use spackle_schema::{parse_one_or_raise, ConcreteSpec};
use spackle_store::{Database, StoreLayout};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

struct Env {
    dir: tempfile::TempDir,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = format!(
            "install_tree = {:?}\n",
            dir.path().join("opt").to_str().unwrap()
        );
        std::fs::write(dir.path().join("config.toml"), config).unwrap();
        Self { dir }
    }

    fn install_tree(&self) -> PathBuf {
        self.dir.path().join("opt")
    }

    fn db(&self) -> Database {
        Database::open(StoreLayout::new(self.install_tree())).unwrap()
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_spackle"))
            .env("SPACKLE_CONFIG", self.dir.path().join("config.toml"))
            .env_remove("SPACKLE_LOG")
            .args(args)
            .output()
            .unwrap()
    }
}

fn concrete(text: &str) -> Arc<ConcreteSpec> {
    ConcreteSpec::freeze(&parse_one_or_raise(text, None).unwrap()).unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|e| panic!("invalid JSON ({e}): {}", stdout(output)))
}

fn make_prefix(path: &Path) {
    std::fs::create_dir_all(path).unwrap();
}

#[test]
fn cli_version_exits_zero() {
    let output = Env::new().run(&["--version"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("spackle"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Env::new().run(&["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["parse", "lookup", "find", "gc", "verify"] {
        assert!(text.contains(command), "help must list '{command}'");
    }
}

#[test]
fn parse_prints_one_line_per_spec() {
    let output = Env::new().run(&["parse", "zlib@1.3", "openssl@3.1"]);
    assert!(output.status.success());
    let text = stdout(&output);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["zlib@1.3", "openssl@3.1"]);
}

#[test]
fn parse_json_is_canonical_strings() {
    let output = Env::new().run(&["--json", "parse", "hdf5 ^zlib@1.3"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value.as_array().unwrap().len(), 1);
    assert!(value[0].as_str().unwrap().contains("^zlib@1.3"));
}

#[test]
fn parse_tokens_json_lists_kinds() {
    let output = Env::new().run(&["--json", "parse", "--tokens", "zlib@1.3"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    let tokens = value.as_array().unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0]["text"], "zlib");
    assert_eq!(tokens[1]["kind"], "VERSION");
}

#[test]
fn parse_error_exits_two_with_caret() {
    let output = Env::new().run(&["parse", "zlib ^"]);
    assert_eq!(output.status.code(), Some(2));
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.contains("parse error"));
    assert!(err.contains('^'));
}

#[test]
fn find_on_empty_tree_is_empty() {
    let output = Env::new().run(&["--json", "find"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), serde_json::json!([]));
}

#[test]
fn find_groups_by_query_spec() {
    let env = Env::new();
    let db = env.db();
    db.add(&concrete("hdf5@1.14 ^zlib@1.3"), true).unwrap();
    db.add(&concrete("zlib@1.2"), true).unwrap();

    let output = env.run(&["--json", "find", "zlib", "hdf5"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    let zlib: Vec<_> = value["zlib"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["version"].as_str().unwrap().to_owned())
        .collect();
    // zlib@1.3 was recorded as a dependency without a prefix, so it is missing.
    assert_eq!(zlib, vec!["1.2"]);
    assert_eq!(value["hdf5"].as_array().unwrap().len(), 1);

    let output = env.run(&["--json", "find", "--installed", "any", "zlib"]);
    assert_eq!(stdout_json(&output)["zlib"].as_array().unwrap().len(), 2);

    let output = env.run(&["--json", "find", "--implicit", "--installed", "any"]);
    let implicit = stdout_json(&output);
    assert_eq!(implicit.as_array().unwrap().len(), 1);
    assert_eq!(implicit[0]["version"], "1.3");
}

#[test]
fn find_rejects_unknown_status() {
    let output = Env::new().run(&["find", "--installed", "sometimes"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn lookup_by_prefix() {
    let env = Env::new();
    let zlib = concrete("zlib@1.3");
    env.db().add(&zlib, true).unwrap();

    let hash = zlib.dag_hash().to_string();
    let output = env.run(&["--json", "lookup", &format!("/{}", &hash[..7])]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["hash"], hash.as_str());
    assert_eq!(value["status"], "installed");
    assert_eq!(value["explicit"], true);
}

#[test]
fn lookup_unknown_hash_fails() {
    let env = Env::new();
    env.db().add(&concrete("zlib@1.3"), true).unwrap();
    let unused = if concrete("zlib@1.3").dag_hash().to_string().starts_with("ffff") {
        "0000"
    } else {
        "ffff"
    };
    let output = env.run(&["lookup", unused]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no installed or cached spec"));
}

#[test]
fn lookup_rejects_non_hex_prefix() {
    let output = Env::new().run(&["lookup", "not-a-hash"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn gc_removes_released_dependencies() {
    let env = Env::new();
    let db = env.db();
    let hdf5 = concrete("hdf5@1.14 ^zlib@1.3");
    db.add(&hdf5, true).unwrap();

    let output = env.run(&["--json", "gc", "--dry-run"]);
    assert!(output.status.success());
    assert!(stdout_json(&output)["orphaned"].as_array().unwrap().is_empty());

    db.write_transaction(|records| {
        if let Some(record) = records.get_mut(hdf5.dag_hash()) {
            record.installed = false;
        }
        Ok(())
    })
    .unwrap();

    let output = env.run(&["--json", "gc", "--dry-run"]);
    let value = stdout_json(&output);
    assert_eq!(value["orphaned"].as_array().unwrap().len(), 2);
    assert_eq!(value["removed_records"], 0);
    assert_eq!(db.records().unwrap().len(), 2);

    let output = env.run(&["--json", "gc"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["removed_records"], 2);
    assert!(db.records().unwrap().is_empty());
}

#[test]
fn verify_reports_missing_prefix() {
    let env = Env::new();
    let db = env.db();
    let zlib = concrete("zlib@1.3");
    db.add(&zlib, true).unwrap();

    let output = env.run(&["--json", "verify"]);
    assert_eq!(output.status.code(), Some(3));
    let value = stdout_json(&output);
    assert_eq!(value["checked"], 1);
    assert_eq!(value["failed"][0]["reason"], "installed prefix is missing");

    make_prefix(&db.layout().prefix_for(&zlib));
    let output = env.run(&["verify"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("1/1 records passed"));
}

#[test]
fn corrupt_config_fails() {
    let env = Env::new();
    std::fs::write(env.dir.path().join("config.toml"), "install_tree = [").unwrap();
    let output = env.run(&["find"]);
    assert_eq!(output.status.code(), Some(1));
}
