//! Core data types shared by the pipeline, sandbox, and cache.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A generated main script together with the test script that exercises it.
///
/// Pairs are replaced wholesale; nothing mutates a pair in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPair {
    pub main_script: String,
    pub test_script: String,
}

impl ScriptPair {
    pub fn new(main_script: impl Into<String>, test_script: impl Into<String>) -> Self {
        Self {
            main_script: main_script.into(),
            test_script: test_script.into(),
        }
    }

    /// New pair with `main_script` swapped in and the same test script.
    pub fn with_main_script(&self, main_script: impl Into<String>) -> Self {
        Self {
            main_script: main_script.into(),
            test_script: self.test_script.clone(),
        }
    }

    pub fn script(&self, role: ScriptRole) -> &str {
        match role {
            ScriptRole::Main => &self.main_script,
            ScriptRole::Test => &self.test_script,
        }
    }
}

/// Which half of a [`ScriptPair`] something refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptRole {
    Main,
    Test,
}

impl ScriptRole {
    pub const ALL: [ScriptRole; 2] = [ScriptRole::Main, ScriptRole::Test];

    /// File name used when the script is materialized in a sandbox.
    pub fn file_name(self) -> &'static str {
        match self {
            ScriptRole::Main => "script.sh",
            ScriptRole::Test => "test.sh",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptRole::Main => "main",
            ScriptRole::Test => "test",
        }
    }
}

impl fmt::Display for ScriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a description before it is hashed: surrounding whitespace is
/// not significant.
pub fn normalize_description(description: &str) -> &str {
    description.trim()
}

/// Hex-encoded SHA-256 of a normalized description.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_description(description: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_description(description).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a sandbox run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Test script exited with status 0.
    Passed,
    /// Test script exited non-zero. `None` means it was killed by a signal.
    Failed { exit_code: Option<i32> },
    /// A script matched the deny-list; nothing was executed.
    Rejected {
        script: ScriptRole,
        rule: &'static str,
        matched: String,
    },
    /// The sandbox could not be prepared or the shell could not be run.
    Errored { message: String },
    /// The deadline fired and the process tree was killed.
    TimedOut { after: Duration },
    /// The run's cancellation token fired and the process tree was killed.
    Cancelled,
}

/// Outcome of one sandbox run, with the captured output (stdout and stderr
/// interleaved) for the next repair prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: String,
}

impl ExecutionResult {
    pub fn new(status: ExecutionStatus, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == ExecutionStatus::Passed
    }

    /// True when the test script itself tripped the deny-list.
    pub fn test_rejected(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Rejected {
                script: ScriptRole::Test,
                ..
            }
        )
    }

    /// One-line description of the outcome.
    pub fn summary(&self) -> String {
        match &self.status {
            ExecutionStatus::Passed => "test script passed".to_string(),
            ExecutionStatus::Failed {
                exit_code: Some(code),
            } => format!("test script exited with status {code}"),
            ExecutionStatus::Failed { exit_code: None } => {
                "test script was terminated by a signal".to_string()
            }
            ExecutionStatus::Rejected {
                script,
                rule,
                matched,
            } => format!(
                "{script} script rejected before execution: matched deny-list rule `{rule}` in `{matched}`"
            ),
            ExecutionStatus::Errored { message } => format!("could not run test script: {message}"),
            ExecutionStatus::TimedOut { after } => {
                format!("test script timed out after {:.1}s", after.as_secs_f64())
            }
            ExecutionStatus::Cancelled => "run cancelled before the test script finished".to_string(),
        }
    }

    /// Summary plus captured output, formatted for a repair prompt.
    pub fn failure_detail(&self) -> String {
        let summary = self.summary();
        let output = self.output.trim_end();
        if output.is_empty() {
            summary
        } else {
            format!("{summary}\n\nOutput:\n{output}")
        }
    }
}
