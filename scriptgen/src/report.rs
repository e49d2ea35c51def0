//! Progress events emitted while a description is turned into a script.
//!
//! Reporters are passed by reference into each run, so two concurrent runs
//! can report to different sinks.

use std::fmt;
use std::io::Write;

use tracing::{info, warn};

use crate::core::types::ScriptRole;

/// One observable step of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CacheHit,
    CacheMiss,
    CacheVerified,
    /// A cached pair no longer passes its test and was discarded.
    CacheStale { summary: String },
    CacheWriteFailed { error: String },
    Generating { attempt: u32, max_attempts: u32 },
    GenerationFailed { attempt: u32, error: String },
    Fixing { attempt: u32, fix: u32, max_fixes: u32 },
    Rejected { script: ScriptRole, rule: &'static str },
    TestFinished { passed: bool, summary: String },
    Succeeded { attempt: u32, fixes: u32 },
}

impl Event {
    /// Events that indicate something went wrong but the run continues.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Event::CacheStale { .. }
                | Event::CacheWriteFailed { .. }
                | Event::GenerationFailed { .. }
                | Event::Rejected { .. }
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::CacheHit => f.write_str("found cached script, verifying"),
            Event::CacheMiss => f.write_str("no cached script"),
            Event::CacheVerified => f.write_str("cached script still passes its test"),
            Event::CacheStale { summary } => write!(f, "cached script is stale: {summary}"),
            Event::CacheWriteFailed { error } => write!(f, "could not cache script: {error}"),
            Event::Generating {
                attempt,
                max_attempts,
            } => write!(f, "generating scripts (attempt {attempt}/{max_attempts})"),
            Event::GenerationFailed { attempt, error } => {
                write!(f, "generation failed on attempt {attempt}: {error}")
            }
            Event::Fixing {
                attempt,
                fix,
                max_fixes,
            } => write!(
                f,
                "fixing script (attempt {attempt}, fix {fix}/{max_fixes})"
            ),
            Event::Rejected { script, rule } => {
                write!(f, "{script} script rejected by deny-list rule `{rule}`")
            }
            Event::TestFinished { passed: true, .. } => f.write_str("test passed"),
            Event::TestFinished {
                passed: false,
                summary,
            } => write!(f, "test failed: {summary}"),
            Event::Succeeded { attempt, fixes } => write!(
                f,
                "script verified (attempt {attempt}, {fixes} fix{})",
                if *fixes == 1 { "" } else { "es" }
            ),
        }
    }
}

/// Sink for progress events.
pub trait Reporter {
    fn report(&self, event: &Event);
}

/// Reporter that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: &Event) {
        if event.is_warning() {
            warn!(event = ?event, "{event}");
        } else {
            info!(event = ?event, "{event}");
        }
    }
}

/// Reporter that prints one line per event to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn report(&self, event: &Event) {
        let mut stderr = std::io::stderr().lock();
        // Progress output is best-effort.
        let _ = writeln!(stderr, "scriptgen: {event}");
    }
}
