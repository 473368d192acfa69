//! CLI tests for `crewline init`, `validate`, `tool`, `.env` loading, and `run` setup errors.
//!
//! Spawns the binary in a temp directory and checks exit codes and output.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use crewline::exit_codes;
use crewline::io::config::{CONFIG_FILE, load_config};
use crewline::io::pipeline::PIPELINE_FILE;

fn crewline(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_crewline"))
        .current_dir(dir)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("CREWLINE_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .output()
        .expect("spawn crewline")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn init_writes_config_and_sample_pipeline() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = crewline(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let cfg = load_config(&temp.path().join(CONFIG_FILE)).expect("load config");
    assert_eq!(cfg.max_attempts, 3);
    assert_eq!(cfg.max_tool_rounds, 5);
    assert!(temp.path().join(PIPELINE_FILE).is_file());
}

#[test]
fn init_keeps_existing_files_unless_forced() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pipeline = temp.path().join(PIPELINE_FILE);
    fs::write(&pipeline, "# custom\n").expect("write");

    let output = crewline(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(fs::read_to_string(&pipeline).expect("read"), "# custom\n");

    let output = crewline(temp.path(), &["init", "--force"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(fs::read_to_string(&pipeline).expect("read").contains("[[tasks]]"));
}

#[test]
fn validate_prints_task_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    crewline(temp.path(), &["init"]);

    let output = crewline(temp.path(), &["validate", "--input", "project_name=Bookstore"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
    let lines: Vec<String> = stdout(&output).lines().map(str::to_string).collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("1. requirements (Requirements Analyst)"));
    assert!(lines[4].starts_with("5. security (Security Specialist)"));
    assert!(lines[2].contains("research_database_solutions"));
}

#[test]
fn validate_rejects_unknown_role() {
    let temp = tempfile::tempdir().expect("tempdir");
    let contents = r#"
[[roles]]
name = "Writer"
objective = "write"
persona = "writes"

[[tasks]]
id = "draft"
role = "Editor"
description = "Draft"
expected_output = "A draft"
"#;
    fs::write(temp.path().join(PIPELINE_FILE), contents).expect("write");

    let output = crewline(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&output).contains("unknown role 'Editor'"));
}

#[test]
fn validate_rejects_missing_input() {
    let temp = tempfile::tempdir().expect("tempdir");
    let contents = r#"
[[roles]]
name = "Writer"
objective = "write"
persona = "writes"

[[tasks]]
id = "draft"
role = "Writer"
description = "Draft about {{ topic }}"
expected_output = "A draft"
"#;
    fs::write(temp.path().join(PIPELINE_FILE), contents).expect("write");

    let output = crewline(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&output).contains("invalid task 'draft'"));

    let output = crewline(temp.path(), &["validate", "-i", "topic=queues"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
}

#[test]
fn tool_command_renders_template() {
    let temp = tempfile::tempdir().expect("tempdir");
    crewline(temp.path(), &["init"]);

    let output = crewline(
        temp.path(),
        &["tool", "research_database_solutions", "a bookstore"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
    assert!(stdout(&output).starts_with("Research task: analyze database solutions for a bookstore."));

    let output = crewline(temp.path(), &["tool", "missing", "x"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&output).contains("unknown tool: missing"));
}

#[test]
fn run_without_api_key_is_a_setup_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    crewline(temp.path(), &["init"]);

    let output = crewline(temp.path(), &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stderr(&output).contains("missing API key"));
    assert!(!temp.path().join("results").exists());
}

#[test]
fn dotenv_is_loaded_before_logging() {
    let temp = tempfile::tempdir().expect("tempdir");
    crewline(temp.path(), &["init"]);
    fs::write(temp.path().join(".env"), "RUST_LOG=crewline=debug\n").expect("write");

    let output = crewline(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
    assert!(stderr(&output).contains("resolved pipeline"), "{}", stderr(&output));
}

#[test]
fn malformed_dotenv_is_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    crewline(temp.path(), &["init"]);
    fs::write(temp.path().join(".env"), "NOT A VALID LINE\n").expect("write");

    let output = crewline(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{}", stderr(&output));
    assert!(stderr(&output).contains("failed to load .env"), "{}", stderr(&output));
}
