use std::fs;
use std::path::Path;

use httpmock::prelude::*;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::tempdir;

fn bin() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("batchwise").expect("binary");
    cmd.env("BATCHWISE_BATCH_CHUNK_DELAY_MS", "0")
        .env("BATCHWISE_RETRY_DELAY_MS", "0")
        .env("BATCHWISE_CACHE_CLEANUP_MS", "0")
        .env_remove("BATCHWISE_ORACLE_TOKEN")
        .env_remove("BATCHWISE_CACHE_STORE")
        .env_remove("BATCHWISE_LOG_DIR");
    cmd
}

fn write_items(path: &Path, items: Value) {
    fs::write(path, serde_json::to_string(&items).unwrap()).expect("write items");
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json on stdout")
}

#[test]
fn config_schema_lists_sections() {
    bin()
        .args(["config", "schema"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrency"))
        .stdout(predicate::str::contains("capacity_bytes"));
}

#[test]
fn config_show_reads_toml() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("batchwise.toml");
    fs::write(&path, "[scheduler]\nmax_concurrency = 7\n").unwrap();
    bin()
        .env_remove("BATCHWISE_MAX_CONCURRENCY")
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_concurrency\": 7"));
}

#[test]
fn config_show_rejects_bad_types() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("bad.toml");
    fs::write(&path, "[cache]\nttl_ms = \"soon\"\n").unwrap();
    bin()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn run_caches_results_across_invocations() {
    let server = MockServer::start();
    let oracle = server.mock(|when, then| {
        when.method(POST).path("/oracle");
        then.status(200).json_body(json!({"verdict": "ok"}));
    });

    let tmp = tempdir().unwrap();
    let items = tmp.path().join("items.json");
    let snapshot = tmp.path().join("cache.json");
    write_items(
        &items,
        json!([
            {"id": "a", "source": "a.rs", "payload": {"text": "alpha"}},
            {"id": "b", "source": "b.rs", "payload": {"text": "beta"}}
        ]),
    );

    let run = |expected_hits: u64| {
        let output = bin()
            .args(["run", "--endpoint", &server.url("/oracle"), "--items"])
            .arg(&items)
            .arg("--snapshot")
            .arg(&snapshot)
            .output()
            .expect("run batchwise");
        assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
        let out = stdout_json(&output);
        assert_eq!(out["metrics"]["succeeded"], json!(2));
        assert_eq!(out["metrics"]["cache_hits"], json!(expected_hits));
        out
    };

    run(0);
    assert!(snapshot.exists());
    let second = run(2);
    assert_eq!(second["metrics"]["oracle_calls"], json!(0));
    oracle.assert_hits(2);

    bin()
        .args(["cache", "stats", "--snapshot"])
        .arg(&snapshot)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"stored_entries\":2"));

    bin()
        .args(["cache", "clear", "--snapshot"])
        .arg(&snapshot)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\":2"));
    bin()
        .args(["cache", "stats", "--snapshot"])
        .arg(&snapshot)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"live_entries\":0"));
}

#[test]
fn run_batches_items_from_the_same_source() {
    let server = MockServer::start();
    let oracle = server.mock(|when, then| {
        when.method(POST)
            .path("/oracle")
            .body_contains("\"batch_id\"");
        then.status(200)
            .json_body(json!({"results": {"f1": {"score": 1}, "f2": {"score": 2}}}));
    });

    let tmp = tempdir().unwrap();
    let items = tmp.path().join("items.jsonl");
    fs::write(
        &items,
        "{\"id\":\"f1\",\"source\":\"lib.rs\",\"payload\":1}\n{\"id\":\"f2\",\"source\":\"lib.rs\",\"payload\":2}\n",
    )
    .unwrap();

    let output = bin()
        .args(["run", "--no-cache", "--endpoint", &server.url("/oracle"), "--items"])
        .arg(&items)
        .output()
        .expect("run batchwise");
    assert!(output.status.success());
    let out = stdout_json(&output);
    assert_eq!(out["metrics"]["batches"], json!(1));
    assert_eq!(out["metrics"]["oracle_calls"], json!(1));
    let results = out["results"].as_array().unwrap();
    assert!(results.iter().all(|r| r["source"] == json!("oracle")));
    oracle.assert_hits(1);
}

#[test]
fn strict_run_fails_when_items_fail() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/oracle");
        then.status(500).body("boom");
    });
    let tmp = tempdir().unwrap();
    let items = tmp.path().join("items.json");
    write_items(&items, json!([{"id": "x", "source": "x.rs", "payload": "x"}]));

    bin()
        .env("BATCHWISE_RETRY_ATTEMPTS", "1")
        .args(["run", "--strict", "--no-cache", "--endpoint", &server.url("/oracle"), "--items"])
        .arg(&items)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("status 500"));
}

#[test]
fn duplicate_item_ids_are_rejected() {
    let tmp = tempdir().unwrap();
    let items = tmp.path().join("items.json");
    write_items(
        &items,
        json!([
            {"id": "x", "source": "x.rs", "payload": 1},
            {"id": "x", "source": "y.rs", "payload": 2}
        ]),
    );
    bin()
        .args(["run", "--endpoint", "http://127.0.0.1:9/none", "--items"])
        .arg(&items)
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate item id"));
}

#[test]
fn completions_for_bash() {
    bin()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("batchwise"));
}
