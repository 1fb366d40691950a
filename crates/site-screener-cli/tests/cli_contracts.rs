#![allow(clippy::single_match_else)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn repo_file(relative: &str) -> String {
    repo_root().join(relative).display().to_string()
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("site-screener-{label}-{}.sqlite3", Ulid::new()))
}

fn cli(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_site-screener"));
    command.arg("--db").arg(db_path).arg("--log-level").arg("warn");
    command.args(args);
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run site-screener {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: status={:?}\nstderr={}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = repo_root().join("contracts").join(schema_name);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = jsonschema::validator_for(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    let errors = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    if !errors.is_empty() {
        panic!("{schema_name} validation failed:\n{}", errors.join("\n"));
    }
}

fn run_phase(db_path: &Path, phase: &str, input: &Value) -> Value {
    let input = input.to_string();
    let output = cli(
        db_path,
        &["phase", "run", "--phase", &repo_file(phase), "--input-json", &input],
    );
    assert_success(&output);
    let record = stdout_json(&output);
    assert_schema("run-record.schema.json", &record);
    record
}

fn run_id_of(record: &Value) -> String {
    match record["run_id"].as_str() {
        Some(run_id) => run_id.to_string(),
        None => panic!("record has no run_id: {record}"),
    }
}

#[test]
fn help_lists_command_groups() {
    let output = match Command::new(env!("CARGO_BIN_EXE_site-screener"))
        .arg("--help")
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["phase", "gate", "run", "card"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn bundled_phases_validate() {
    let db_path = temp_db("validate");
    for phase in ["pass0", "pass1", "pass2", "pass3"] {
        let output = cli(
            &db_path,
            &["phase", "validate", "--phase", &repo_file(&format!("phases/{phase}.yaml"))],
        );
        assert_success(&output);
        let summary = stdout_json(&output);
        assert_eq!(summary["phase_tag"], json!(phase));
        assert_eq!(summary["normalized_hash"].as_str().map(str::len), Some(64));
    }
}

#[test]
fn low_population_warns_without_blocking() {
    let db_path = temp_db("low-population");
    let record = run_phase(
        &db_path,
        "phases/pass0.yaml",
        &json!({"zip": "99999", "state": "TX", "county": "Travis", "requiredPopulation": 10000}),
    );
    assert_eq!(record["aggregate_status"], json!("complete"));
    assert_eq!(
        record["stage_results"]["identity"]["payload"],
        json!({"zip": "99999", "state": "TX", "county": "Travis"})
    );
    let run_id = run_id_of(&record);

    let output = cli(
        &db_path,
        &["gate", "check", "--gate", &repo_file("gates/pass0_to_pass1.yaml"), "--run-id", &run_id],
    );
    assert_success(&output);
    let result = stdout_json(&output);
    assert_schema("validation-result.schema.json", &result);
    assert_eq!(result["ok"], json!(true));
    assert_eq!(result["warnings"], json!(["LOW_POPULATION:population=8000<10000"]));
    assert_eq!(result["score"], json!(100));
    assert_eq!(result["meta"]["upstream_run_id"], json!(run_id));

    let shown = stdout_json(&cli(&db_path, &["run", "show", "--run-id", &run_id]));
    assert_eq!(shown, record);
    let listed = stdout_json(&cli(&db_path, &["run", "list"]));
    assert_eq!(listed[0]["run_id"], json!(run_id));
    assert_eq!(listed[0]["stages_total"], json!(3));
}

#[test]
fn missing_identity_blocks_with_exit_status_two() {
    let db_path = temp_db("missing-identity");
    let record = run_phase(&db_path, "phases/pass0.yaml", &json!({}));
    assert_eq!(record["aggregate_status"], json!("failed"));
    assert_eq!(
        record["stage_results"]["population"]["error_kind"],
        json!("missing_dependency")
    );

    let output = cli(
        &db_path,
        &[
            "gate",
            "check",
            "--gate",
            &repo_file("gates/pass0_to_pass1.yaml"),
            "--run-id",
            &run_id_of(&record),
        ],
    );
    assert_eq!(output.status.code(), Some(2));
    let result = stdout_json(&output);
    assert_schema("validation-result.schema.json", &result);
    assert_eq!(result["ok"], json!(false));
    let blockers = result["blockers"].as_array().cloned().unwrap_or_default();
    for field in ["zip", "state", "county"] {
        assert!(
            blockers.contains(&json!(format!("MISSING_REQUIRED_FIELD:{field}"))),
            "missing blocker for {field}: {blockers:?}"
        );
    }
    assert!(blockers.contains(&json!("UPSTREAM_RUN_FAILED")));
    assert!(result["score"].as_u64().is_some_and(|score| score < 100));
}

#[test]
fn gated_phase_run_threads_upstream_summary() {
    let db_path = temp_db("gated");
    let pass0 = run_phase(
        &db_path,
        "phases/pass0.yaml",
        &json!({"zip": "10001", "state": "NY", "county": "New York", "requiredPopulation": 5000}),
    );
    let pass0_id = run_id_of(&pass0);

    let output = cli(
        &db_path,
        &[
            "phase",
            "run",
            "--phase",
            &repo_file("phases/pass1.yaml"),
            "--upstream-run-id",
            &pass0_id,
            "--gate",
            &repo_file("gates/pass0_to_pass1.yaml"),
            "--policy",
            &repo_file("config/run-policy.yaml"),
        ],
    );
    assert_success(&output);
    let gated = stdout_json(&output);
    assert_eq!(gated["validation"]["ok"], json!(true));
    let record = gated["record"].clone();
    assert_schema("run-record.schema.json", &record);
    assert_eq!(record["input"]["upstream"]["run_id"], json!(pass0_id));
    assert_eq!(record["input"]["upstream"]["phase_tag"], json!("pass0"));
    assert_eq!(record["aggregate_status"], json!("complete"));

    let next = cli(
        &db_path,
        &[
            "gate",
            "check",
            "--gate",
            &repo_file("gates/pass1_to_pass2.yaml"),
            "--run-id",
            &run_id_of(&record),
        ],
    );
    assert_success(&next);
    assert_eq!(stdout_json(&next)["ok"], json!(true));

    let failed = run_phase(&db_path, "phases/pass0.yaml", &json!({}));
    let blocked = cli(
        &db_path,
        &[
            "phase",
            "run",
            "--phase",
            &repo_file("phases/pass1.yaml"),
            "--upstream-run-id",
            &run_id_of(&failed),
            "--gate",
            &repo_file("gates/pass0_to_pass1.yaml"),
        ],
    );
    assert_eq!(blocked.status.code(), Some(2));
    let blocked = stdout_json(&blocked);
    assert_eq!(blocked["validation"]["ok"], json!(false));
    assert_eq!(blocked["record"], Value::Null);
    let listed = stdout_json(&cli(&db_path, &["run", "list"]));
    assert_eq!(listed.as_array().map(Vec::len), Some(3));
}

fn assert_field(db_path: &Path, subject: &str, args: &[&str]) -> Value {
    let mut full = vec!["card", "assert", "--subject", subject];
    full.extend_from_slice(args);
    let output = cli(db_path, &full);
    assert_success(&output);
    stdout_json(&output)
}

#[test]
fn card_conflicts_block_until_resolved() {
    let db_path = temp_db("card");
    let subject = "travis-county-tx::self_storage";
    let schema = repo_file("config/card-schema.yaml");
    let precedence = repo_file("config/precedence.yaml");

    let init = cli(&db_path, &["card", "init", "--subject", subject, "--schema", &schema]);
    assert_success(&init);
    assert_eq!(stdout_json(&init)["card"]["version"], json!(1));
    assert_eq!(
        cli(&db_path, &["card", "init", "--subject", subject, "--schema", &schema])
            .status
            .code(),
        Some(1)
    );

    let county = [
        "--source-type",
        "ordinance",
        "--source-reference",
        "Travis County Code 82.201",
        "--authority-scope",
        "county",
    ];
    let municipal = [
        "--source-type",
        "ordinance",
        "--source-reference",
        "Austin LDC 25-2-492",
        "--authority-scope",
        "municipality",
    ];

    let mut args = vec!["--field", "side_setback_ft", "--value", "10"];
    args.extend_from_slice(&county);
    assert_field(&db_path, subject, &args);

    let mut args = vec!["--field", "side_setback_ft", "--value", "15", "--precedence", &precedence];
    args.extend_from_slice(&municipal);
    let conflicted = assert_field(&db_path, subject, &args);
    assert_eq!(conflicted["report"]["findings"][0]["resolution"], json!("conflict"));
    assert_eq!(conflicted["card"]["fields"]["side_setback_ft"]["value"], json!(10));

    let mut args = vec!["--field", "front_setback_ft", "--value", "25"];
    args.extend_from_slice(&county);
    assert_field(&db_path, subject, &args);
    let mut args = vec!["--field", "front_setback_ft", "--value", "30", "--precedence", &precedence];
    args.extend_from_slice(&municipal);
    let accepted = assert_field(&db_path, subject, &args);
    assert_eq!(accepted["report"]["findings"][0]["resolution"], json!("accepted"));
    assert_eq!(accepted["card"]["fields"]["front_setback_ft"]["value"], json!(30));

    let pass2 = run_phase(&db_path, "phases/pass2.yaml", &json!({"parcel_id": "0123-45"}));
    let gate_args = [
        "gate",
        "check",
        "--gate",
        &repo_file("gates/pass2_to_pass3.yaml"),
        "--run-id",
        &run_id_of(&pass2),
        "--subject",
        subject,
    ];
    let blocked = cli(&db_path, &gate_args);
    assert_eq!(blocked.status.code(), Some(2));
    let result = stdout_json(&blocked);
    assert_schema("validation-result.schema.json", &result);
    let blockers = result["blockers"].as_array().cloned().unwrap_or_default();
    assert!(blockers.contains(&json!("CONFLICT_DETECTED:side_setback_ft")));
    assert!(blockers.contains(&json!("ENVELOPE_INCOMPLETE")));
    assert_eq!(result["meta"]["card_subject"], json!(subject));

    let mut args = vec!["card", "resolve", "--subject", subject, "--field", "side_setback_ft", "--value", "15"];
    args.extend_from_slice(&municipal);
    let resolved = cli(&db_path, &args);
    assert_success(&resolved);
    let resolved = stdout_json(&resolved);
    assert_eq!(resolved["card"]["conflicts"], json!({}));
    assert_eq!(resolved["card"]["fields"]["side_setback_ft"]["value"], json!(15));

    let recheck = stdout_json(&cli(&db_path, &gate_args));
    let blockers = recheck["blockers"].as_array().cloned().unwrap_or_default();
    assert!(!blockers.contains(&json!("CONFLICT_DETECTED:side_setback_ft")));

    let shown = stdout_json(&cli(&db_path, &["card", "show", "--subject", subject]));
    assert_eq!(shown["completeness"]["envelope_complete"], json!(false));
    assert_eq!(shown["completeness"]["card_complete"], json!(false));
    assert!(shown["completeness"]["missing_for_envelope"]
        .as_array()
        .is_some_and(|missing| missing.contains(&json!("zoning_district"))));

    let history = stdout_json(&cli(&db_path, &["card", "show", "--subject", subject, "--history"]));
    assert!(history.as_array().is_some_and(|versions| versions.len() >= 5));
}

#[test]
fn prohibitions_block_until_lifted() {
    let db_path = temp_db("prohibition");
    let subject = "round-rock-tx::self_storage";
    assert_success(&cli(
        &db_path,
        &["card", "init", "--subject", subject, "--schema", &repo_file("config/card-schema.yaml")],
    ));
    assert_success(&cli(
        &db_path,
        &[
            "card",
            "prohibit",
            "--subject",
            subject,
            "--code",
            "MORATORIUM",
            "--description",
            "180-day moratorium on new storage permits",
            "--authority-scope",
            "municipality",
        ],
    ));

    let pass2 = run_phase(&db_path, "phases/pass2.yaml", &json!({}));
    let gate_args = [
        "gate",
        "check",
        "--gate",
        &repo_file("gates/pass2_to_pass3.yaml"),
        "--run-id",
        &run_id_of(&pass2),
        "--subject",
        subject,
    ];
    let result = stdout_json(&cli(&db_path, &gate_args));
    assert!(result["blockers"]
        .as_array()
        .is_some_and(|blockers| blockers.contains(&json!("OPEN_PROHIBITION:MORATORIUM"))));

    assert_success(&cli(
        &db_path,
        &["card", "lift", "--subject", subject, "--code", "MORATORIUM"],
    ));
    let result = stdout_json(&cli(&db_path, &gate_args));
    assert!(result["blockers"]
        .as_array()
        .is_some_and(|blockers| !blockers.contains(&json!("OPEN_PROHIBITION:MORATORIUM"))));
    assert_eq!(
        cli(&db_path, &["card", "lift", "--subject", subject, "--code", "MORATORIUM"])
            .status
            .code(),
        Some(1)
    );
}
