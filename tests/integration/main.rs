//! Integration tests for stagebuild

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "id": "org.example.Hello",
        "runtime": "org.example.Platform",
        "sdk": "org.example.Sdk",
        "command": "hello",
        "cleanup": ["*.a"],
        "finish-args": ["--share=network"],
        "modules": [
            {
                "name": "hello",
                "sources": [
                    { "type": "inline", "contents": "echo hello\n", "dest-filename": "hello.sh" }
                ],
                "build-commands": [
                    "mkdir -p \"$PREFIX/bin\" \"$PREFIX/lib\"",
                    "cp hello.sh \"$PREFIX/bin/hello\"",
                    "touch \"$PREFIX/lib/libhello.a\""
                ]
            }
        ]
    }"#;

    /// Temp project with an isolated config file
    struct Project {
        temp: TempDir,
    }

    impl Project {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            std::fs::create_dir_all(temp.path().join("src")).unwrap();
            std::fs::write(temp.path().join("src/app.json"), MANIFEST).unwrap();
            Self { temp }
        }

        fn manifest(&self) -> PathBuf {
            self.temp.path().join("src/app.json")
        }

        fn app_dir(&self) -> PathBuf {
            self.temp.path().join("app")
        }

        fn state_dir(&self) -> PathBuf {
            self.temp.path().join("src/.stagebuild")
        }

        fn cmd(&self) -> Command {
            let mut cmd = stagebuild();
            cmd.env("STAGEBUILD_CONFIG", self.temp.path().join("config.toml"));
            cmd
        }

        fn build(&self, extra: &[&str]) -> Command {
            let mut cmd = self.cmd();
            cmd.arg("build").args(extra).arg(self.manifest()).arg(self.app_dir());
            cmd
        }
    }

    fn stagebuild() -> Command {
        cargo_bin_cmd!("stagebuild")
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn help_displays() {
        stagebuild()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("manifest-driven application builder"));
    }

    #[test]
    fn version_displays() {
        stagebuild()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("stagebuild"));
    }

    #[test]
    fn config_path() {
        let project = Project::new();
        project
            .cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let project = Project::new();
        project
            .cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[build]"));
    }

    #[test]
    fn build_produces_app_dir() {
        let project = Project::new();
        project
            .build(&["--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("init built"))
            .stdout(predicate::str::contains("build-hello built"))
            .stdout(predicate::str::contains("finish built"));

        let app = project.app_dir();
        assert_eq!(read(&app.join("files/bin/hello")), "echo hello\n");
        assert!(!app.join("files/lib/libhello.a").exists());

        let metadata = read(&app.join("metadata"));
        assert!(metadata.contains("name=org.example.Hello"));
        assert!(metadata.contains("command=hello"));
        assert!(project.state_dir().join("cache").exists());
    }

    #[test]
    fn rebuild_restores_every_stage_from_cache() {
        let project = Project::new();
        project.build(&[]).assert().success();

        project
            .build(&["--force-clean", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("init cached"))
            .stdout(predicate::str::contains("build-hello cached"))
            .stdout(predicate::str::contains("cleanup cached"))
            .stdout(predicate::str::contains("finish cached"));

        assert_eq!(
            read(&project.app_dir().join("files/bin/hello")),
            "echo hello\n"
        );
    }

    #[test]
    fn non_empty_app_dir_needs_force_clean() {
        let project = Project::new();
        std::fs::create_dir_all(project.app_dir()).unwrap();
        std::fs::write(project.app_dir().join("stray"), "x").unwrap();

        project
            .build(&[])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force-clean"));
    }

    #[test]
    fn stop_at_unknown_module_fails() {
        let project = Project::new();
        project
            .build(&["--stop-at", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope"));
    }

    #[test]
    fn failing_command_fails_build() {
        let project = Project::new();
        std::fs::write(
            project.manifest(),
            r#"{ "id": "org.example.Broken", "modules": [ { "name": "bad", "build-commands": ["exit 3"] } ] }"#,
        )
        .unwrap();

        project.build(&[]).assert().failure().stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn cache_list_and_log_show_branch() {
        let project = Project::new();
        project.build(&["--arch", "x86_64"]).assert().success();

        let state = project.state_dir();
        project
            .cmd()
            .args(["cache", "list", "--format", "plain", "--state-dir"])
            .arg(&state)
            .assert()
            .success()
            .stdout(predicate::str::contains("x86_64-org.example.Hello"));

        project
            .cmd()
            .args(["cache", "log", "x86_64-org.example.Hello", "--state-dir"])
            .arg(&state)
            .assert()
            .success()
            .stdout(predicate::str::contains("build-hello"));
    }

    #[test]
    fn cache_gc_prunes_other_branches() {
        let project = Project::new();
        project.build(&["--arch", "x86_64"]).assert().success();
        project
            .build(&["--arch", "aarch64", "--force-clean", "--keep-other-branches"])
            .assert()
            .success();

        let state = project.state_dir();
        project
            .cmd()
            .args(["cache", "gc", "--prune-others", "--keep-branch", "aarch64-org.example.Hello", "--state-dir"])
            .arg(&state)
            .assert()
            .success()
            .stdout(predicate::str::contains("x86_64-org.example.Hello"));

        project
            .cmd()
            .args(["cache", "list", "--format", "plain", "--state-dir"])
            .arg(&state)
            .assert()
            .success()
            .stdout(predicate::str::contains("aarch64-org.example.Hello"))
            .stdout(predicate::str::contains("x86_64").not());
    }

    #[test]
    fn cache_list_without_cache_fails() {
        let project = Project::new();
        project
            .cmd()
            .args(["cache", "list", "--state-dir"])
            .arg(project.temp.path().join("missing"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("No stage cache"));
    }

    #[test]
    fn manifest_prints_branch_key() {
        let project = Project::new();
        project
            .cmd()
            .args(["manifest", "--branch-key", "x86_64"])
            .arg(project.manifest())
            .assert()
            .success()
            .stdout(predicate::str::contains("x86_64-org.example.Hello"));
    }
}
