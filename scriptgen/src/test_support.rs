//! Test-only helpers: canned script pairs and scripted fakes for every seam.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::budget::RunBudget;
use crate::core::shell::ShellConfig;
use crate::core::types::{ExecutionResult, ScriptPair};
use crate::io::generator::Generator;
use crate::io::sandbox::{SandboxConfig, SandboxExecutor, ScriptRunner};
use crate::report::{Event, Reporter};

/// Pair whose main script prints `label` and whose test checks for it.
pub fn passing_pair(label: &str) -> ScriptPair {
    ScriptPair::new(format!("#!/bin/sh\necho '{label}'\n"), expect_output(label))
}

/// Pair whose main script prints the wrong thing for the same test.
pub fn failing_pair(label: &str) -> ScriptPair {
    ScriptPair::new("#!/bin/sh\necho 'wrong'\n", expect_output(label))
}

fn expect_output(label: &str) -> String {
    format!(
        "out=\"$(./script.sh)\"\nif [ \"$out\" != '{label}' ]; then\n  echo \"unexpected output: $out\"\n  exit 1\nfi\n"
    )
}

/// Real sandbox on `/bin/sh` with run directories under `temp_root`.
pub fn sh_sandbox(temp_root: &Path) -> SandboxExecutor {
    SandboxExecutor::new(SandboxConfig::with_shell(ShellConfig::default_shell()).temp_root(temp_root))
}

/// Pops the next scripted reply; the last one repeats forever.
fn next_reply(queue: &RefCell<VecDeque<Result<ScriptPair, String>>>) -> Result<ScriptPair> {
    let mut queue = queue.borrow_mut();
    let reply = if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    };
    match reply {
        Some(Ok(pair)) => Ok(pair),
        Some(Err(message)) => Err(anyhow!(message)),
        None => Err(anyhow!("no scripted reply")),
    }
}

/// Generator that replays canned pairs and errors.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    generations: RefCell<VecDeque<Result<ScriptPair, String>>>,
    fixes: RefCell<VecDeque<Result<ScriptPair, String>>>,
    generate_calls: Cell<u32>,
    fix_inputs: RefCell<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(
        generations: Vec<Result<ScriptPair, String>>,
        fixes: Vec<Result<ScriptPair, String>>,
    ) -> Self {
        Self {
            generations: RefCell::new(generations.into()),
            fixes: RefCell::new(fixes.into()),
            ..Self::default()
        }
    }

    pub fn generate_calls(&self) -> u32 {
        self.generate_calls.get()
    }

    pub fn fix_calls(&self) -> u32 {
        self.fix_inputs.borrow().len() as u32
    }

    /// Failure details passed to each `fix_scripts` call, in order.
    pub fn fix_inputs(&self) -> Vec<String> {
        self.fix_inputs.borrow().clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate_scripts(&self, _description: &str, budget: &RunBudget) -> Result<ScriptPair> {
        budget.check()?;
        self.generate_calls.set(self.generate_calls.get() + 1);
        next_reply(&self.generations)
    }

    fn fix_scripts(&self, _pair: &ScriptPair, failure: &str, budget: &RunBudget) -> Result<ScriptPair> {
        budget.check()?;
        self.fix_inputs.borrow_mut().push(failure.to_string());
        next_reply(&self.fixes)
    }
}

type Judge = Box<dyn Fn(&ScriptPair) -> ExecutionResult>;

/// Runner that decides each outcome with a closure instead of spawning.
pub struct ScriptedRunner {
    judge: Judge,
    runs: RefCell<Vec<ScriptPair>>,
}

impl ScriptedRunner {
    pub fn new(judge: impl Fn(&ScriptPair) -> ExecutionResult + 'static) -> Self {
        Self {
            judge: Box::new(judge),
            runs: RefCell::new(Vec::new()),
        }
    }

    /// Every pair run so far, in order.
    pub fn runs(&self) -> Vec<ScriptPair> {
        self.runs.borrow().clone()
    }
}

impl ScriptRunner for ScriptedRunner {
    fn run(
        &self,
        pair: &ScriptPair,
        _timeout: Duration,
        _budget: &RunBudget,
        reporter: &dyn Reporter,
    ) -> ExecutionResult {
        self.runs.borrow_mut().push(pair.clone());
        let result = (self.judge)(pair);
        reporter.report(&Event::TestFinished {
            passed: result.passed(),
            summary: result.summary(),
        });
        result
    }
}

/// Reporter that keeps every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: RefCell<Vec<Event>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, event: &Event) {
        self.events.borrow_mut().push(event.clone());
    }
}
