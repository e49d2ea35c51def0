//! The bounded generate, test, fix loop.
//!
//! One call to [`Pipeline::generate_and_test`]:
//!
//! 1. Re-verifies a cached pair, if there is one, and returns it on success.
//! 2. Otherwise runs up to `max_attempts` attempts. Each attempt generates a
//!    fresh pair and runs it up to `max_fixes` times, asking for a repaired
//!    main script between runs. The test script stays fixed for the attempt,
//!    so a deny-listed test script ends the attempt without repairs.
//! 3. Caches the first pair whose test passes.
//!
//! A generator error ends the attempt it happened in. Deadline expiry and
//! cancellation end the whole run.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetError, RunBudget};
use crate::core::types::ScriptPair;
use crate::exit_codes;
use crate::io::cache::ResultCache;
use crate::io::generator::Generator;
use crate::io::sandbox::ScriptRunner;
use crate::report::{Event, Reporter};

/// Loop limits for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Full regenerations.
    pub max_attempts: u32,
    /// Sandbox runs per attempt; at most `max_fixes - 1` repairs.
    pub max_fixes: u32,
    /// Wall-clock limit for one sandbox run.
    pub run_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_fixes: 10,
            run_timeout: Duration::from_secs(30),
        }
    }
}

/// Where a returned script came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// A cached pair that passed its test again.
    Cache,
    /// Generated on `attempt` (1-based) after `fixes` repairs.
    Generated { attempt: u32, fixes: u32 },
}

/// A verified main script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub main_script: String,
    pub provenance: Provenance,
}

/// Why a run produced no script.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("script generation failed on attempt {attempt}: {message}")]
    Generation { attempt: u32, message: String },
    #[error("no passing script after {attempts} attempt(s)")]
    Exhausted { attempts: u32, last_failure: String },
    #[error("overall deadline exceeded before a passing script was found")]
    DeadlineExceeded { last_failure: Option<String> },
    #[error("run cancelled before a passing script was found")]
    Cancelled { last_failure: Option<String> },
}

impl PipelineError {
    /// Detail of the last failed test run, if any run failed.
    pub fn last_failure(&self) -> Option<&str> {
        match self {
            PipelineError::Generation { .. } => None,
            PipelineError::Exhausted { last_failure, .. } => Some(last_failure),
            PipelineError::DeadlineExceeded { last_failure }
            | PipelineError::Cancelled { last_failure } => last_failure.as_deref(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Generation { .. } => exit_codes::GENERATION,
            PipelineError::Exhausted { .. } => exit_codes::EXHAUSTED,
            PipelineError::DeadlineExceeded { .. } | PipelineError::Cancelled { .. } => {
                exit_codes::BUDGET
            }
        }
    }

    fn from_budget(err: BudgetError, last_failure: Option<String>) -> Self {
        match err {
            BudgetError::Expired => PipelineError::DeadlineExceeded { last_failure },
            BudgetError::Cancelled => PipelineError::Cancelled { last_failure },
        }
    }
}

/// Orchestrates a [`Generator`], a [`ScriptRunner`] and an optional cache.
pub struct Pipeline<G: Generator, S: ScriptRunner> {
    generator: G,
    runner: S,
    cache: Option<ResultCache>,
    config: PipelineConfig,
}

impl<G: Generator, S: ScriptRunner> Pipeline<G, S> {
    pub fn new(generator: G, runner: S, config: PipelineConfig) -> Self {
        Self {
            generator,
            runner,
            cache: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn runner(&self) -> &S {
        &self.runner
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Produce a main script whose test passes, or explain why none was found.
    #[instrument(skip_all, fields(max_attempts = self.config.max_attempts, max_fixes = self.config.max_fixes))]
    pub fn generate_and_test(
        &self,
        description: &str,
        budget: &RunBudget,
        reporter: &dyn Reporter,
    ) -> Result<PipelineOutcome, PipelineError> {
        if let Some(outcome) = self.verify_cached(description, budget, reporter)? {
            return Ok(outcome);
        }

        let max_attempts = self.config.max_attempts;
        let max_fixes = self.config.max_fixes;
        let mut last_failure: Option<String> = None;

        for attempt in 1..=max_attempts {
            budget
                .check()
                .map_err(|err| PipelineError::from_budget(err, last_failure.clone()))?;

            reporter.report(&Event::Generating {
                attempt,
                max_attempts,
            });
            let mut pair = match self.generator.generate_scripts(description, budget) {
                Ok(pair) => pair,
                Err(err) => {
                    self.generator_failed(err, attempt, budget, &last_failure, reporter)?;
                    continue;
                }
            };

            for run in 1..=max_fixes {
                let result = self
                    .runner
                    .run(&pair, self.config.run_timeout, budget, reporter);
                if result.passed() {
                    let fixes = run - 1;
                    self.store(description, &pair, reporter);
                    reporter.report(&Event::Succeeded { attempt, fixes });
                    info!(attempt, fixes, "script verified");
                    return Ok(PipelineOutcome {
                        main_script: pair.main_script,
                        provenance: Provenance::Generated { attempt, fixes },
                    });
                }

                let detail = result.failure_detail();
                debug!(attempt, run, summary = %result.summary(), "test run failed");
                last_failure = Some(detail);
                budget
                    .check()
                    .map_err(|err| PipelineError::from_budget(err, last_failure.clone()))?;

                if run == max_fixes {
                    break;
                }
                if result.test_rejected() {
                    // Fixes only touch the main script.
                    debug!(attempt, run, "test script rejected, regenerating pair");
                    break;
                }

                reporter.report(&Event::Fixing {
                    attempt,
                    fix: run,
                    max_fixes: max_fixes - 1,
                });
                let failure = last_failure.as_deref().unwrap_or_default();
                match self.generator.fix_scripts(&pair, failure, budget) {
                    Ok(fixed) => {
                        if fixed.test_script != pair.test_script {
                            debug!(attempt, run, "ignoring test script change from fix");
                        }
                        pair = pair.with_main_script(fixed.main_script);
                    }
                    Err(err) => {
                        self.generator_failed(err, attempt, budget, &last_failure, reporter)?;
                        break;
                    }
                }
            }
        }

        warn!(attempts = max_attempts, "all attempts exhausted");
        Err(PipelineError::Exhausted {
            attempts: max_attempts,
            last_failure: last_failure.unwrap_or_default(),
        })
    }

    /// Re-run a cached pair. `Some` only if it still passes.
    fn verify_cached(
        &self,
        description: &str,
        budget: &RunBudget,
        reporter: &dyn Reporter,
    ) -> Result<Option<PipelineOutcome>, PipelineError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let Some(pair) = cache.get(description) else {
            reporter.report(&Event::CacheMiss);
            return Ok(None);
        };

        reporter.report(&Event::CacheHit);
        let result = self
            .runner
            .run(&pair, self.config.run_timeout, budget, reporter);
        if result.passed() {
            reporter.report(&Event::CacheVerified);
            return Ok(Some(PipelineOutcome {
                main_script: pair.main_script,
                provenance: Provenance::Cache,
            }));
        }

        reporter.report(&Event::CacheStale {
            summary: result.summary(),
        });
        budget
            .check()
            .map_err(|err| PipelineError::from_budget(err, Some(result.failure_detail())))?;
        Ok(None)
    }

    /// Record a generator error. Budget errors end the run, and so does any
    /// error on the last attempt.
    fn generator_failed(
        &self,
        err: anyhow::Error,
        attempt: u32,
        budget: &RunBudget,
        last_failure: &Option<String>,
        reporter: &dyn Reporter,
    ) -> Result<(), PipelineError> {
        if let Some(budget_err) = err.downcast_ref::<BudgetError>() {
            return Err(PipelineError::from_budget(*budget_err, last_failure.clone()));
        }
        // A request cut short by the deadline reports as a transport error.
        budget
            .check()
            .map_err(|budget_err| PipelineError::from_budget(budget_err, last_failure.clone()))?;

        let message = format!("{err:#}");
        warn!(attempt, err = %message, "generator failed");
        reporter.report(&Event::GenerationFailed {
            attempt,
            error: message.clone(),
        });
        if attempt >= self.config.max_attempts {
            return Err(PipelineError::Generation { attempt, message });
        }
        Ok(())
    }

    fn store(&self, description: &str, pair: &ScriptPair, reporter: &dyn Reporter) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(err) = cache.set(description, pair) {
            let error = format!("{err:#}");
            warn!(err = %error, "failed to cache verified script");
            reporter.report(&Event::CacheWriteFailed { error });
        }
    }
}
