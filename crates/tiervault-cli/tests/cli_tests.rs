//! Integration tests for the `tiervault` CLI binary.
//!
//! These tests exercise the CLI as a subprocess, verifying exit codes,
//! stdout output and the JSON documents it reads and writes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};

use serde_json::Value;

const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

fn command(args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tiervault"));
    cmd.args(args)
        .env("TIERVAULT_MASTER_KEY", MASTER_KEY)
        .env("TIERVAULT_SCRYPT_LOG_N", "4")
        .env("TIERVAULT_LOG_LEVEL", "warn")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper: run tiervault with args and return (`exit_code`, stdout, stderr).
fn run(args: &[&str]) -> (i32, String, String) {
    let output = command(args).output().expect("failed to execute tiervault");
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

fn run_with_stdin(args: &[&str], input: &str) -> (i32, String, String) {
    let mut child = command(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn tiervault");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

fn write(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path.to_str().unwrap().to_owned()
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn test_version_flag() {
    let (code, stdout, _) = run(&["--version"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("tiervault"), "version output: {stdout}");
}

#[test]
fn test_help_lists_commands() {
    let (code, stdout, _) = run(&["--help"]);
    assert_eq!(code, 0);
    for cmd in ["classify", "encrypt", "decrypt", "validate", "evaluate", "keygen"] {
        assert!(stdout.contains(cmd), "help should list {cmd}");
    }
}

// ── keygen ───────────────────────────────────────────────────────────

#[test]
fn test_keygen_prints_hex_key() {
    let (code, stdout, _) = run(&["keygen"]);
    assert_eq!(code, 0);
    let key = stdout.trim();
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
}

// ── classify ─────────────────────────────────────────────────────────

#[test]
fn test_classify_password() {
    let (code, stdout, _) = run(&["classify", "password", "--value", "abc123"]);
    assert_eq!(code, 0);
    let meta: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(meta["securityLevel"], "secret");
    assert_eq!(meta["category"], "user_credentials");
    assert_eq!(meta["riskScore"], 92);
    assert_eq!(meta["businessImpact"], "high");
}

#[test]
fn test_classify_explicit_level_and_stdin() {
    let (code, stdout, _) = run_with_stdin(&["classify", "notes", "--level", "top_secret"], "x\n");
    assert_eq!(code, 0);
    let meta: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(meta["securityLevel"], "top_secret");
}

#[test]
fn test_classify_rejects_unknown_level() {
    let (code, _, stderr) = run(&["classify", "x", "--value", "y", "--level", "ultra"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("ultra"), "stderr: {stderr}");
}

// ── encrypt / decrypt / validate ─────────────────────────────────────

#[test]
fn test_encrypt_then_decrypt() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, stderr) = run(&[
        "encrypt", "--key-id", "app/token", "--level", "secret", "--value", "hello-secret",
    ]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let payload: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["metadata"]["algorithm"], "aes-256-gcm");
    let file = write(dir.path(), "payload.json", &stdout);

    let (code, stdout, _) = run(&["decrypt", &file]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim_end(), "hello-secret");

    let (code, stdout, _) = run(&["validate", &file]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "valid");
}

#[test]
fn test_decrypt_detects_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let (_, stdout, _) = run(&[
        "encrypt", "--key-id", "k", "--level", "public", "--value", "hello",
    ]);
    let mut payload: Value = serde_json::from_str(&stdout).unwrap();
    let encrypted = payload["encrypted"].as_str().unwrap().to_owned();
    let last = if encrypted.ends_with('0') { '1' } else { '0' };
    let tampered = format!("{}{last}", &encrypted[..encrypted.len() - 1]);
    payload["encrypted"] = Value::String(tampered);
    let file = write(dir.path(), "payload.json", &payload.to_string());

    let (code, _, stderr) = run(&["decrypt", &file]);
    assert_ne!(code, 0);
    assert!(stderr.contains("integrity"), "stderr: {stderr}");
}

#[test]
fn test_decrypt_with_wrong_aad_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (_, stdout, _) = run(&[
        "encrypt", "--key-id", "k", "--level", "confidential", "--value", "v", "--aad", "ctx-a",
    ]);
    let file = write(dir.path(), "payload.json", &stdout);

    let (code, _, _) = run(&["decrypt", &file, "--aad", "ctx-b"]);
    assert_ne!(code, 0);
    let (code, stdout, _) = run(&["decrypt", &file, "--aad", "ctx-a"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim_end(), "v");
}

#[test]
fn test_encrypt_requires_master_key() {
    let output = command(&["encrypt", "--key-id", "k", "--level", "public", "--value", "v"])
        .env_remove("TIERVAULT_MASTER_KEY")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TIERVAULT_MASTER_KEY"), "stderr: {stderr}");
}

#[test]
fn test_bad_master_key_is_reported() {
    let output = command(&["keygen"])
        .env("TIERVAULT_MASTER_KEY", "nothex")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TIERVAULT_MASTER_KEY"), "stderr: {stderr}");
}

#[test]
fn test_validate_rejects_short_iv() {
    let dir = tempfile::tempdir().unwrap();
    let (_, stdout, _) = run(&[
        "encrypt", "--key-id", "k", "--level", "internal", "--value", "v",
    ]);
    let mut payload: Value = serde_json::from_str(&stdout).unwrap();
    payload["metadata"]["iv"] = Value::String("00".to_owned());
    let file = write(dir.path(), "payload.json", &payload.to_string());

    let (code, _, _) = run(&["validate", &file]);
    assert_ne!(code, 0);
}

// ── evaluate ─────────────────────────────────────────────────────────

const POLICY: &str = r#"{
    "id": "p1",
    "name": "block user-42",
    "defaultEffect": "allow",
    "rules": [{
        "id": "r1",
        "name": "R1",
        "effect": "deny",
        "priority": 10,
        "conditions": [{"type": "StringEquals", "key": "userId", "values": ["user-42"]}]
    }]
}"#;

fn context(user: &str) -> String {
    format!(
        r#"{{"userId": "{user}", "sourceIp": "10.0.0.1", "timestamp": "2026-03-04T12:00:00+00:00"}}"#
    )
}

#[test]
fn test_evaluate_deny_and_default_allow() {
    let dir = tempfile::tempdir().unwrap();
    let policies = write(dir.path(), "policies.json", POLICY);

    let ctx = write(dir.path(), "ctx42.json", &context("user-42"));
    let (code, stdout, stderr) = run(&[
        "evaluate", "--policies", &policies, "--context", &ctx, "--secret-id", "s1", "--value",
        "abc123",
    ]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let decision: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(decision["granted"], false);
    assert_eq!(decision["reason"], "Rule \"R1\" matched with effect \"deny\"");

    let ctx = write(dir.path(), "ctx99.json", &context("user-99"));
    let (_, stdout, _) = run(&[
        "evaluate", "--policies", &policies, "--context", &ctx, "--secret-id", "s1", "--value",
        "abc123",
    ]);
    let decision: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(decision["granted"], true);
    assert_eq!(
        decision["reason"],
        "No rules matched, using default effect \"allow\""
    );
}

#[test]
fn test_evaluate_requires_metadata_or_value() {
    let dir = tempfile::tempdir().unwrap();
    let policies = write(dir.path(), "policies.json", &format!("[{POLICY}]"));
    let ctx = write(dir.path(), "ctx.json", &context("u"));
    let (code, _, stderr) = run(&[
        "evaluate", "--policies", &policies, "--context", &ctx, "--secret-id", "s1",
    ]);
    assert_ne!(code, 0);
    assert!(stderr.contains("--metadata"), "stderr: {stderr}");
}

#[test]
fn test_evaluate_reads_metadata_file() {
    let dir = tempfile::tempdir().unwrap();
    let policies = write(dir.path(), "policies.json", POLICY);
    let ctx = write(dir.path(), "ctx.json", &context("user-99"));

    let (_, meta, _) = run(&["classify", "password", "--value", "abc123"]);
    let meta = write(dir.path(), "meta.json", &meta);
    let (code, stdout, _) = run(&[
        "evaluate", "--policies", &policies, "--context", &ctx, "--secret-id", "s1",
        "--metadata", &meta,
    ]);
    assert_eq!(code, 0);
    let decision: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(decision["granted"], true);
}
