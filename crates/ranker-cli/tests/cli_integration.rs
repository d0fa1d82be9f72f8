use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rk<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rk"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("RANKER_DB")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rk binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(as_str(&value, "contract_version"), "cli.v1");
    value
}

fn run_failure<I, S>(db: &Path, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(db, args);
    assert!(
        !output.status.success(),
        "rk command unexpectedly succeeded:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn seed(db: &Path, items: &[&str], users: &[&str]) {
    for item in items {
        run_json(db, ["item", "add", "--name", item]);
    }
    for user in users {
        run_json(db, ["user", "add", "--name", user, "--password", "pw"]);
    }
}

fn vote_args<'a>(user: &'a str, item1: &'a str, item2: &'a str, winner: &'a str) -> [&'a str; 10] {
    [
        "compare", "vote", "--user", user, "--item1", item1, "--item2", item2, "--winner", winner,
    ]
}

#[test]
fn db_migrate_dry_run_then_apply_reports_versions() {
    let dir = unique_temp_dir("rk-cli-migrate");
    let db = dir.join("ranker.sqlite3");

    let status = run_json(&db, ["db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(status["up_to_date"], Value::Bool(false));

    let dry_run = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(dry_run["dry_run"], Value::Bool(true));
    assert_eq!(dry_run["would_apply_versions"], serde_json::json!([1, 2]));

    let still_pending = run_json(&db, ["db", "schema-version"]);
    assert_eq!(as_i64(&still_pending, "current_version"), 0);

    let applied = run_json(&db, ["db", "migrate"]);
    assert_eq!(applied["applied_versions"], serde_json::json!([1, 2]));
    assert_eq!(as_i64(&applied, "after_version"), 2);
    assert_eq!(applied["up_to_date"], Value::Bool(true));

    let again = run_json(&db, ["db", "migrate"]);
    assert_eq!(again["applied_versions"], serde_json::json!([]));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn compare_vote_and_score_flow_updates_both_ladders() {
    let dir = unique_temp_dir("rk-cli-flow");
    let db = dir.join("ranker.sqlite3");
    seed(&db, &["tea", "coffee"], &["alice"]);

    let items = run_json(&db, ["item", "list"]);
    let names: Vec<&str> =
        as_array(&items, "items").iter().map(|item| as_str(item, "name")).collect();
    assert_eq!(names, vec!["tea", "coffee"]);

    let pair = run_json(&db, ["compare", "next", "--user", "alice", "--seed", "7"]);
    let mut offered = vec![as_str(&pair, "item1"), as_str(&pair, "item2")];
    offered.sort_unstable();
    assert_eq!(offered, vec!["coffee", "tea"]);

    let ack = run_json(&db, vote_args("alice", "tea", "coffee", "tea"));
    assert_eq!(as_str(&ack, "user"), "alice");
    assert_eq!(ack["recorded"], Value::Bool(true));
    assert!(ack.get("user_scores").is_none() && ack.get("global_scores").is_none());

    let tea = run_json(&db, ["score", "global", "--item", "tea"]);
    assert_eq!(as_i64(&tea, "rating"), 1032);
    assert_eq!(as_i64(&tea, "numVotes"), 1);

    let coffee = run_json(&db, ["score", "user", "--item", "coffee", "--user", "alice"]);
    assert_eq!(as_i64(&coffee, "rating"), 968);
    assert_eq!(as_str(&coffee, "userName"), "alice");

    let rankings = run_json(&db, ["score", "rankings"]);
    let order: Vec<&str> =
        as_array(&rankings, "rankings").iter().map(|score| as_str(score, "itemName")).collect();
    assert_eq!(order, vec!["tea", "coffee"]);

    let user_rankings = run_json(&db, ["score", "rankings", "--user", "alice"]);
    assert_eq!(as_str(&user_rankings, "user"), "alice");
    assert_eq!(as_array(&user_rankings, "rankings").len(), 2);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn vote_for_an_item_outside_the_pair_fails_without_writing() {
    let dir = unique_temp_dir("rk-cli-invalid-vote");
    let db = dir.join("ranker.sqlite3");
    seed(&db, &["tea", "coffee", "water"], &["alice"]);

    let stderr = run_failure(&db, vote_args("alice", "tea", "coffee", "water"));
    assert!(stderr.contains("invalid choice"), "unexpected stderr: {stderr}");

    let missing = run_failure(&db, ["score", "global", "--item", "tea"]);
    assert!(missing.contains("no votes recorded"), "unexpected stderr: {missing}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn vote_rejects_unknown_users_and_items() {
    let dir = unique_temp_dir("rk-cli-unknown");
    let db = dir.join("ranker.sqlite3");
    seed(&db, &["tea", "coffee"], &["alice"]);

    let unknown_user = run_failure(&db, vote_args("bob", "tea", "coffee", "tea"));
    assert!(unknown_user.contains("user not found: bob"), "unexpected stderr: {unknown_user}");

    let unknown_item = run_failure(&db, vote_args("alice", "tea", "cocoa", "tea"));
    assert!(unknown_item.contains("item not found: cocoa"), "unexpected stderr: {unknown_item}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn compare_next_needs_two_items() {
    let dir = unique_temp_dir("rk-cli-insufficient");
    let db = dir.join("ranker.sqlite3");
    seed(&db, &["tea"], &["alice"]);

    let stderr = run_failure(&db, ["compare", "next", "--user", "alice"]);
    assert!(stderr.contains("not enough items"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn user_commands_never_print_password_hashes() {
    let dir = unique_temp_dir("rk-cli-users");
    let db = dir.join("ranker.sqlite3");

    let added = run_json(&db, ["user", "add", "--name", "alice", "--password", "secret"]);
    assert_eq!(as_str(&added, "name"), "alice");

    let duplicate = run_failure(&db, ["user", "add", "--name", "alice", "--password", "other"]);
    assert!(duplicate.contains("user already exists"), "unexpected stderr: {duplicate}");

    let listed = run_json(&db, ["user", "list"]);
    let rendered = listed.to_string();
    assert!(!rendered.contains("argon2"), "hash leaked: {rendered}");
    assert_eq!(as_array(&listed, "users").len(), 1);

    let reserved = run_failure(&db, ["user", "add", "--name", "admin", "--password", "takeover"]);
    assert!(reserved.contains("reserved"), "unexpected stderr: {reserved}");
    let listed = run_json(&db, ["user", "list"]);
    assert_eq!(as_array(&listed, "users").len(), 1);

    let removed = run_json(&db, ["user", "remove", "--name", "alice"]);
    assert_eq!(as_str(&removed, "deleted"), "alice");
    let again = run_failure(&db, ["user", "remove", "--name", "alice"]);
    assert!(again.contains("user not found"), "unexpected stderr: {again}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn item_remove_drops_its_scores_and_reset_empties_the_database() {
    let dir = unique_temp_dir("rk-cli-reset");
    let db = dir.join("ranker.sqlite3");
    seed(&db, &["tea", "coffee", "water"], &["alice"]);
    run_json(&db, vote_args("alice", "tea", "coffee", "coffee"));

    let shown = run_json(&db, ["item", "show", "--name", "coffee"]);
    assert_eq!(as_str(&shown, "description"), "");

    run_json(&db, ["item", "remove", "--name", "coffee"]);
    let rankings = run_json(&db, ["score", "rankings"]);
    let order: Vec<&str> =
        as_array(&rankings, "rankings").iter().map(|score| as_str(score, "itemName")).collect();
    assert_eq!(order, vec!["tea"]);

    let reset = run_json(&db, ["db", "reset"]);
    assert_eq!(reset["reset"], Value::Bool(true));
    assert_eq!(as_i64(&reset, "current_version"), 2);

    let items = run_json(&db, ["item", "list"]);
    assert!(as_array(&items, "items").is_empty());
    let users = run_json(&db, ["user", "list"]);
    assert!(as_array(&users, "users").is_empty());

    let _ = fs::remove_dir_all(&dir);
}
