//! Sandboxed execution of a script pair.
//!
//! The [`ScriptRunner`] trait decouples the pipeline from process spawning.
//! [`SandboxExecutor`] is the real implementation: deny-list check, fresh
//! private temp directory, strict shell, deadline-bounded wait.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetError, RunBudget};
use crate::core::denylist::check_pair;
use crate::core::shell::ShellConfig;
use crate::core::types::{ExecutionResult, ExecutionStatus, ScriptPair, ScriptRole};
use crate::io::process::{StopReason, run_command_with_deadline};
use crate::report::{Event, Reporter};

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 100_000;

/// Environment variable pointing the test script at the main script.
pub const SCRIPT_PATH_VAR: &str = "SCRIPT_PATH";

/// Abstraction over sandbox backends.
pub trait ScriptRunner {
    /// Run `pair.test_script` against `pair.main_script`. Never fails: every
    /// problem is folded into the returned status.
    fn run(
        &self,
        pair: &ScriptPair,
        timeout: Duration,
        budget: &RunBudget,
        reporter: &dyn Reporter,
    ) -> ExecutionResult;
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub shell: ShellConfig,
    /// Overlaid on the inherited environment.
    pub env: BTreeMap<String, String>,
    pub output_limit_bytes: usize,
    /// Parent for per-run directories; the system temp dir when `None`.
    pub temp_root: Option<PathBuf>,
}

impl SandboxConfig {
    /// Shell from `$SHELL`, no overrides, default limits.
    pub fn from_env() -> Self {
        Self::with_shell(ShellConfig::detect(std::env::var_os("SHELL").as_deref()))
    }

    pub fn with_shell(shell: ShellConfig) -> Self {
        Self {
            shell,
            env: BTreeMap::new(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            temp_root: None,
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn output_limit_bytes(mut self, limit: usize) -> Self {
        self.output_limit_bytes = limit;
        self
    }

    pub fn temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }
}

/// Runs script pairs in throwaway directories.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn execute(&self, pair: &ScriptPair, timeout: Duration, budget: &RunBudget) -> ExecutionResult {
        let workspace = match Workspace::create(self.config.temp_root.as_deref(), pair) {
            Ok(ws) => ws,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to prepare sandbox");
                return ExecutionResult::new(
                    ExecutionStatus::Errored {
                        message: format!("{err:#}"),
                    },
                    "",
                );
            }
        };

        let mut cmd = Command::new(&self.config.shell.path);
        cmd.args(self.config.shell.argv_for(&workspace.script_path(ScriptRole::Test)))
            .current_dir(workspace.path())
            .envs(&self.config.env)
            .env(SCRIPT_PATH_VAR, workspace.script_path(ScriptRole::Main));

        let result = match run_command_with_deadline(
            cmd,
            timeout,
            budget.cancel_token(),
            self.config.output_limit_bytes,
        ) {
            Ok(out) => {
                let status = match out.stop {
                    StopReason::TimedOut => ExecutionStatus::TimedOut { after: timeout },
                    StopReason::Cancelled => ExecutionStatus::Cancelled,
                    StopReason::Exited if out.status.success() => ExecutionStatus::Passed,
                    StopReason::Exited => ExecutionStatus::Failed {
                        exit_code: out.status.code(),
                    },
                };
                ExecutionResult::new(status, out.text("test"))
            }
            Err(err) => ExecutionResult::new(
                ExecutionStatus::Errored {
                    message: format!("{err:#}"),
                },
                "",
            ),
        };

        workspace.close();
        result
    }
}

impl ScriptRunner for SandboxExecutor {
    #[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, shell = %self.config.shell.path.display()))]
    fn run(
        &self,
        pair: &ScriptPair,
        timeout: Duration,
        budget: &RunBudget,
        reporter: &dyn Reporter,
    ) -> ExecutionResult {
        if let Some((script, violation)) = check_pair(pair) {
            info!(%script, rule = violation.rule, "script rejected by deny-list");
            reporter.report(&Event::Rejected {
                script,
                rule: violation.rule,
            });
            return ExecutionResult::new(
                ExecutionStatus::Rejected {
                    script,
                    rule: violation.rule,
                    matched: violation.matched,
                },
                "",
            );
        }

        let result = match budget.clamp(timeout) {
            Ok(effective) => self.execute(pair, effective, budget),
            Err(BudgetError::Cancelled) => ExecutionResult::new(ExecutionStatus::Cancelled, ""),
            Err(BudgetError::Expired) => ExecutionResult::new(
                ExecutionStatus::TimedOut {
                    after: Duration::ZERO,
                },
                "",
            ),
        };

        debug!(status = ?result.status, "sandbox run finished");
        reporter.report(&Event::TestFinished {
            passed: result.passed(),
            summary: result.summary(),
        });
        result
    }
}

/// Private directory holding one run's scripts. Removed on drop.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn create(root: Option<&Path>, pair: &ScriptPair) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("scriptgen-");
        let dir = match root {
            Some(root) => builder
                .tempdir_in(root)
                .with_context(|| format!("create sandbox dir in {}", root.display()))?,
            None => builder.tempdir().context("create sandbox dir")?,
        };
        restrict_dir(dir.path())?;

        let workspace = Self { dir };
        for role in ScriptRole::ALL {
            write_executable(&workspace.script_path(role), pair.script(role))
                .with_context(|| format!("write {role} script"))?;
        }
        debug!(dir = %workspace.path().display(), "sandbox prepared");
        Ok(workspace)
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn script_path(&self, role: ScriptRole) -> PathBuf {
        self.dir.path().join(role.file_name())
    }

    fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            warn!(dir = %path.display(), err = %err, "failed to remove sandbox dir");
        }
    }
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// Write `contents` to a new owner-only executable file.
pub fn write_executable(path: &Path, contents: &str) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o700);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    if !contents.ends_with('\n') {
        file.write_all(b"\n")
            .with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::test_support::{RecordingReporter, failing_pair, passing_pair};

    fn executor(root: &Path) -> SandboxExecutor {
        SandboxExecutor::new(SandboxConfig::with_shell(ShellConfig::default_shell()).temp_root(root))
    }

    fn run(exec: &SandboxExecutor, pair: &ScriptPair, timeout: Duration) -> ExecutionResult {
        exec.run(
            pair,
            timeout,
            &RunBudget::new(Duration::from_secs(60)),
            &RecordingReporter::default(),
        )
    }

    fn is_empty_dir(path: &Path) -> bool {
        fs::read_dir(path).expect("read_dir").next().is_none()
    }

    #[test]
    fn passing_pair_passes_and_cleans_up() {
        let root = tempfile::tempdir().expect("tempdir");
        let exec = executor(root.path());
        let reporter = RecordingReporter::default();

        let result = exec.run(
            &passing_pair("hello world"),
            Duration::from_secs(10),
            &RunBudget::new(Duration::from_secs(60)),
            &reporter,
        );

        assert_eq!(result.status, ExecutionStatus::Passed, "{}", result.output);
        assert!(is_empty_dir(root.path()));
        assert_eq!(
            reporter.events(),
            vec![Event::TestFinished {
                passed: true,
                summary: "test script passed".to_string()
            }]
        );
    }

    #[test]
    fn failing_pair_reports_exit_code_and_output() {
        let root = tempfile::tempdir().expect("tempdir");
        let result = run(
            &executor(root.path()),
            &failing_pair("hello"),
            Duration::from_secs(10),
        );

        assert!(matches!(
            result.status,
            ExecutionStatus::Failed { exit_code: Some(1) }
        ));
        assert!(result.output.contains("unexpected output"), "{}", result.output);
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn scripts_are_owner_only_and_script_path_is_set() {
        let root = tempfile::tempdir().expect("tempdir");
        let pair = ScriptPair::new(
            "#!/bin/sh\necho main",
            r#"[ "$(stat -c %a "$SCRIPT_PATH" 2>/dev/null || stat -f %Lp "$SCRIPT_PATH")" = 700 ]
[ "$(stat -c %a . 2>/dev/null || stat -f %Lp .)" = 700 ]
[ "$SCRIPT_PATH" = "$(pwd -P)/script.sh" ] || [ "$SCRIPT_PATH" = "$(pwd)/script.sh" ]
"#,
        );
        let result = run(&executor(root.path()), &pair, Duration::from_secs(10));
        assert_eq!(result.status, ExecutionStatus::Passed, "{}", result.output);
    }

    #[test]
    fn unset_variables_abort_the_test() {
        let root = tempfile::tempdir().expect("tempdir");
        let pair = ScriptPair::new("echo ok", "echo \"$SCRIPTGEN_DEFINITELY_UNSET\"\nexit 0\n");
        let result = run(&executor(root.path()), &pair, Duration::from_secs(10));
        assert!(!result.passed());
    }

    #[test]
    fn env_overrides_reach_the_child() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut env = BTreeMap::new();
        env.insert("SCRIPTGEN_GREETING".to_string(), "hi there".to_string());
        let exec = SandboxExecutor::new(
            SandboxConfig::with_shell(ShellConfig::default_shell())
                .temp_root(root.path())
                .env(env),
        );
        let pair = ScriptPair::new("echo ok", "[ \"$SCRIPTGEN_GREETING\" = \"hi there\" ]\n");
        let result = run(&exec, &pair, Duration::from_secs(10));
        assert_eq!(result.status, ExecutionStatus::Passed, "{}", result.output);
    }

    #[test]
    fn deny_listed_pair_is_rejected_without_a_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        let marker = root.path().join("ran");
        let pair = ScriptPair::new(
            format!("touch {}\nrm -rf /\n", marker.display()),
            "./script.sh",
        );
        let reporter = RecordingReporter::default();
        let result = executor(root.path()).run(
            &pair,
            Duration::from_secs(10),
            &RunBudget::new(Duration::from_secs(60)),
            &reporter,
        );

        assert!(matches!(
            result.status,
            ExecutionStatus::Rejected {
                script: ScriptRole::Main,
                rule: "recursive-delete-root",
                ..
            }
        ));
        assert!(is_empty_dir(root.path()));
        assert_eq!(
            reporter.events(),
            vec![Event::Rejected {
                script: ScriptRole::Main,
                rule: "recursive-delete-root"
            }]
        );
    }

    #[test]
    fn timeout_kills_background_children() {
        let root = tempfile::tempdir().expect("tempdir");
        let marker_dir = tempfile::tempdir().expect("marker dir");
        let marker = marker_dir.path().join("survived");
        let pair = ScriptPair::new(
            "echo ok",
            format!(
                "(sleep 1; touch {}) &\nsleep 30\n",
                marker.display()
            ),
        );

        let started = Instant::now();
        let result = run(&executor(root.path()), &pair, Duration::from_millis(300));

        assert!(matches!(result.status, ExecutionStatus::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(is_empty_dir(root.path()));
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "background job outlived the sandbox");
    }

    #[test]
    fn exited_test_does_not_leave_background_jobs() {
        let root = tempfile::tempdir().expect("tempdir");
        let marker_dir = tempfile::tempdir().expect("marker dir");
        let marker = marker_dir.path().join("survived");
        let pair = ScriptPair::new(
            "echo ok",
            format!("(sleep 1; touch {}) &\nexit 0\n", marker.display()),
        );

        let result = run(&executor(root.path()), &pair, Duration::from_secs(10));
        assert!(result.passed(), "{}", result.output);
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "background job outlived the sandbox");
    }

    #[test]
    fn cancellation_stops_a_running_test() {
        let root = tempfile::tempdir().expect("tempdir");
        let budget = RunBudget::new(Duration::from_secs(60));
        let token = budget.cancel_token().clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            token.cancel();
        });

        let started = Instant::now();
        let result = executor(root.path()).run(
            &ScriptPair::new("echo ok", "sleep 30\n"),
            Duration::from_secs(30),
            &budget,
            &RecordingReporter::default(),
        );
        handle.join().expect("join");

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn run_timeout_is_clamped_to_overall_budget() {
        let root = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let result = executor(root.path()).run(
            &ScriptPair::new("echo ok", "sleep 30\n"),
            Duration::from_secs(30),
            &RunBudget::new(Duration::from_millis(300)),
            &RecordingReporter::default(),
        );
        assert!(matches!(result.status, ExecutionStatus::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_shell_is_an_execution_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let shell = ShellConfig::for_path("/nonexistent/bin/sh").expect("posix family");
        let exec = SandboxExecutor::new(SandboxConfig::with_shell(shell).temp_root(root.path()));
        let result = run(&exec, &passing_pair("x"), Duration::from_secs(5));
        assert!(matches!(result.status, ExecutionStatus::Errored { .. }));
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn write_executable_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x.sh");
        write_executable(&path, "echo hi").expect("write");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert_eq!(fs::read_to_string(&path).expect("read"), "echo hi\n");
    }
}
