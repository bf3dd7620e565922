//! Thin CLI-bootstrap smoke tests.
//!
//! Anything that would actually bind a socket and serve forever is out of scope here —
//! these only exercise argument parsing and the fail-fast paths that exit before the
//! HTTP listener or worker loop ever start.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn conductor() -> Command {
    cargo_bin_cmd!("conductor")
}

mod cli_basics {
    use super::*;

    #[test]
    fn help_lists_the_serve_and_worker_subcommands() {
        conductor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("worker"));
    }

    #[test]
    fn version_flag_succeeds() {
        conductor().arg("--version").assert().success();
    }

    #[test]
    fn serve_help_lists_with_worker_flag() {
        conductor()
            .arg("serve")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--with-worker"));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        conductor()
            .arg("not-a-real-subcommand")
            .assert()
            .failure();
    }
}

mod startup_failure_paths {
    use super::*;

    #[test]
    fn serve_fails_fast_when_the_database_path_directory_does_not_exist() {
        let missing_parent = TempDir::new().unwrap().path().join("does-not-exist").join("conductor.db");

        conductor()
            .arg("--database-path")
            .arg(&missing_parent)
            .arg("serve")
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn worker_fails_fast_when_the_database_path_directory_does_not_exist() {
        let missing_parent = TempDir::new().unwrap().path().join("does-not-exist").join("conductor.db");

        conductor()
            .arg("--database-path")
            .arg(&missing_parent)
            .arg("worker")
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn production_environment_without_a_session_secret_fails_before_opening_the_store() {
        let dir = TempDir::new().unwrap();
        conductor()
            .env("ENVIRONMENT", "production")
            .env_remove("SESSION_SECRET")
            .arg("--database-path")
            .arg(dir.path().join("conductor.db"))
            .arg("worker")
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn worker_concurrency_out_of_range_in_the_environment_is_rejected() {
        let dir = TempDir::new().unwrap();
        conductor()
            .env("WORKER_CONCURRENCY", "0")
            .arg("--database-path")
            .arg(dir.path().join("conductor.db"))
            .arg("worker")
            .assert()
            .failure()
            .code(1);
    }
}
