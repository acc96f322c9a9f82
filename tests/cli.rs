use assert_cmd::Command;
use predicates::prelude::*;

fn zeitwork() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("zeitwork").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    zeitwork().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    zeitwork()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("zeitwork"));
}

#[test]
fn test_no_args_shows_usage() {
    zeitwork()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    zeitwork()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_deploy_help_lists_flags() {
    let assert = zeitwork().args(["deploy", "--help"]).assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for flag in ["--env-file", "--config", "--services"] {
        assert!(output.contains(flag), "missing {} in help", flag);
    }
    assert!(output.contains(".env.prod"));
    assert!(output.contains("config/deploy.yaml"));
}

#[test]
fn test_deploy_missing_config_exits_nonzero() {
    zeitwork()
        .args(["deploy", "--config", "/definitely/missing/deploy.yaml"])
        .assert()
        .failure();
}
