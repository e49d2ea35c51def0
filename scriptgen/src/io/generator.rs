//! Script generation and repair.
//!
//! The [`Generator`] trait is what the pipeline talks to. [`LlmGenerator`]
//! renders prompts and sends them through a [`Completion`] backend.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::budget::RunBudget;
use crate::core::types::ScriptPair;
use crate::io::completion::Completion;
use crate::io::prompt::PromptEngine;

/// Produces and repairs script pairs.
pub trait Generator {
    /// Fresh main script plus a test script for it.
    fn generate_scripts(&self, description: &str, budget: &RunBudget) -> Result<ScriptPair>;

    /// Replacement pair addressing `failure`, the detail of the last failed
    /// test run of `pair`.
    fn fix_scripts(&self, pair: &ScriptPair, failure: &str, budget: &RunBudget) -> Result<ScriptPair>;
}

/// Generator backed by a text-completion model.
pub struct LlmGenerator<C: Completion> {
    completion: C,
    prompts: PromptEngine,
}

impl<C: Completion> LlmGenerator<C> {
    pub fn new(completion: C, prompts: PromptEngine) -> Self {
        Self {
            completion,
            prompts,
        }
    }

    /// Send `prompt` within the run's budget and extract the script from the
    /// reply.
    fn ask(&self, prompt: &str, budget: &RunBudget, what: &str) -> Result<String> {
        budget.check()?;
        let reply = self.completion.complete(prompt, budget)?;
        let script = extract_script(&reply);
        if script.is_empty() {
            return Err(anyhow!("model returned an empty {what}"));
        }
        debug!(what, script_len = script.len(), "received script");
        Ok(script.to_string())
    }
}

impl<C: Completion> Generator for LlmGenerator<C> {
    #[instrument(skip_all)]
    fn generate_scripts(&self, description: &str, budget: &RunBudget) -> Result<ScriptPair> {
        let main_prompt = self.prompts.render_main_script(description)?;
        let main_script = self.ask(&main_prompt, budget, "main script")?;

        let test_prompt = self.prompts.render_test_script(description, &main_script)?;
        let test_script = self.ask(&test_prompt, budget, "test script")?;

        Ok(ScriptPair::new(main_script, test_script))
    }

    #[instrument(skip_all, fields(failure_len = failure.len()))]
    fn fix_scripts(&self, pair: &ScriptPair, failure: &str, budget: &RunBudget) -> Result<ScriptPair> {
        let prompt = self
            .prompts
            .render_fix_script(&pair.main_script, &pair.test_script, failure)?;
        let main_script = self.ask(&prompt, budget, "fixed script")?;
        Ok(pair.with_main_script(main_script))
    }
}

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<script>(.*?)</script>").expect("script block pattern should compile")
});

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\A```[A-Za-z0-9_-]*[ \t]*\n(.*?)\n?```\z")
        .expect("code fence pattern should compile")
});

/// Script body from a model reply: the first `<script>` block if present,
/// otherwise the whole reply. A surrounding markdown fence is dropped.
pub fn extract_script(reply: &str) -> &str {
    let body = SCRIPT_BLOCK
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map_or(reply, |m| m.as_str())
        .trim();
    CODE_FENCE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map_or(body, |m| m.as_str())
        .trim()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;
    use crate::core::budget::{BudgetError, CancelToken};
    use crate::io::prompt::PlatformInfo;

    struct CannedCompletion {
        replies: RefCell<VecDeque<String>>,
        prompts: RefCell<Vec<String>>,
    }

    impl CannedCompletion {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: RefCell::new(replies.iter().map(|r| r.to_string()).collect()),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl Completion for &CannedCompletion {
        fn complete(&self, prompt: &str, _budget: &RunBudget) -> Result<String> {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.replies
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| anyhow!("no canned reply left"))
        }
    }

    fn generator(completion: &CannedCompletion) -> LlmGenerator<&CannedCompletion> {
        let platform = PlatformInfo::current("/bin/sh");
        LlmGenerator::new(completion, PromptEngine::new(&platform, ""))
    }

    fn budget() -> RunBudget {
        RunBudget::new(Duration::from_secs(60))
    }

    #[test]
    fn extract_script_prefers_tagged_block() {
        assert_eq!(
            extract_script("Sure!\n<script>\n#!/bin/sh\necho hi\n</script>\nDone."),
            "#!/bin/sh\necho hi"
        );
        assert_eq!(extract_script("  echo raw  \n"), "echo raw");
        assert_eq!(extract_script("```sh\necho fenced\n```"), "echo fenced");
        assert_eq!(
            extract_script("<script>\n```bash\necho both\n```\n</script>"),
            "echo both"
        );
    }

    #[test]
    fn generate_asks_for_main_then_test() {
        let canned = CannedCompletion::new(&[
            "<script>#!/bin/sh\necho hello</script>",
            "<script>[ \"$(./script.sh)\" = hello ]</script>",
        ]);
        let pair = generator(&canned)
            .generate_scripts("print hello", &budget())
            .expect("generate");

        assert_eq!(pair.main_script, "#!/bin/sh\necho hello");
        assert_eq!(pair.test_script, "[ \"$(./script.sh)\" = hello ]");
        let prompts = canned.prompts.borrow();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("#!/bin/sh\necho hello"));
    }

    #[test]
    fn fix_replaces_only_the_main_script() {
        let canned = CannedCompletion::new(&["<script>echo fixed</script>"]);
        let pair = ScriptPair::new("echo broken", "test body");
        let fixed = generator(&canned)
            .fix_scripts(&pair, "exit status 1", &budget())
            .expect("fix");

        assert_eq!(fixed, ScriptPair::new("echo fixed", "test body"));
        assert!(canned.prompts.borrow()[0].contains("exit status 1"));
    }

    #[test]
    fn empty_reply_is_an_error() {
        let canned = CannedCompletion::new(&["<script>  </script>"]);
        let err = generator(&canned)
            .generate_scripts("x", &budget())
            .unwrap_err();
        assert!(err.to_string().contains("empty main script"));
    }

    #[test]
    fn cancelled_budget_stops_before_calling_the_model() {
        let canned = CannedCompletion::new(&["<script>echo hi</script>"]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let budget = RunBudget::with_deadline(budget().deadline(), cancel);

        let err = generator(&canned)
            .generate_scripts("x", &budget)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<BudgetError>(),
            Some(&BudgetError::Cancelled)
        );
        assert!(canned.prompts.borrow().is_empty());
    }
}
