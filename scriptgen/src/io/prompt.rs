//! Prompt rendering for script generation and repair.

use anyhow::Result;
use minijinja::{Environment, context};
use tracing::debug;

const MAIN_SCRIPT_TEMPLATE: &str = include_str!("prompts/main_script.md");
const TEST_SCRIPT_TEMPLATE: &str = include_str!("prompts/test_script.md");
const FIX_SCRIPT_TEMPLATE: &str = include_str!("prompts/fix_script.md");

/// Failure output beyond this many bytes is cut from the front; the end of a
/// log is where the error usually is.
pub const DEFAULT_FAILURE_BUDGET_BYTES: usize = 8_000;

/// Host details the model needs to pick the right tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub shell: String,
}

impl PlatformInfo {
    pub fn current(shell: impl Into<String>) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            shell: shell.into(),
        }
    }

    fn render(&self) -> String {
        format!(
            "OS: {}\nArchitecture: {}\nShell: {}",
            self.os, self.arch, self.shell
        )
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    platform: String,
    additional_prompt: Option<String>,
    failure_budget_bytes: usize,
}

impl PromptEngine {
    pub fn new(platform: &PlatformInfo, additional_prompt: &str) -> Self {
        let mut env = Environment::new();
        env.add_template("main_script", MAIN_SCRIPT_TEMPLATE)
            .expect("main_script template should be valid");
        env.add_template("test_script", TEST_SCRIPT_TEMPLATE)
            .expect("test_script template should be valid");
        env.add_template("fix_script", FIX_SCRIPT_TEMPLATE)
            .expect("fix_script template should be valid");
        let additional_prompt = additional_prompt.trim();
        Self {
            env,
            platform: platform.render(),
            additional_prompt: (!additional_prompt.is_empty()).then(|| additional_prompt.to_string()),
            failure_budget_bytes: DEFAULT_FAILURE_BUDGET_BYTES,
        }
    }

    pub fn failure_budget_bytes(mut self, budget: usize) -> Self {
        self.failure_budget_bytes = budget;
        self
    }

    pub fn render_main_script(&self, description: &str) -> Result<String> {
        let template = self.env.get_template("main_script")?;
        let rendered = template.render(context! {
            description => description.trim(),
            platform => &self.platform,
            additional_prompt => self.additional_prompt.as_deref(),
        })?;
        Ok(rendered)
    }

    pub fn render_test_script(&self, description: &str, main_script: &str) -> Result<String> {
        let template = self.env.get_template("test_script")?;
        let rendered = template.render(context! {
            description => description.trim(),
            main_script => main_script.trim(),
            platform => &self.platform,
            additional_prompt => self.additional_prompt.as_deref(),
        })?;
        Ok(rendered)
    }

    pub fn render_fix_script(
        &self,
        main_script: &str,
        test_script: &str,
        failure: &str,
    ) -> Result<String> {
        let template = self.env.get_template("fix_script")?;
        let failure = keep_tail(failure.trim(), self.failure_budget_bytes);
        let rendered = template.render(context! {
            main_script => main_script.trim(),
            test_script => test_script.trim(),
            failure => failure,
            platform => &self.platform,
            additional_prompt => self.additional_prompt.as_deref(),
        })?;
        Ok(rendered)
    }
}

/// Keep the last `budget` bytes of `text`, on a char boundary, marking the cut.
fn keep_tail(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let mut start = text.len() - budget;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    debug!(
        before_len = text.len(),
        after_len = text.len() - start,
        "truncated failure output for prompt"
    );
    format!("[truncated {start} bytes]\n{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(additional: &str) -> PromptEngine {
        PromptEngine::new(
            &PlatformInfo {
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
                shell: "/bin/sh".to_string(),
            },
            additional,
        )
    }

    #[test]
    fn main_prompt_includes_description_and_platform() {
        let prompt = engine("").render_main_script("  count lines in a file \n").expect("render");
        assert!(prompt.contains("<description>\ncount lines in a file\n</description>"));
        assert!(prompt.contains("OS: linux\nArchitecture: x86_64\nShell: /bin/sh"));
        assert!(!prompt.contains("Additional instructions"));
        assert!(prompt.contains("<script>"));
    }

    #[test]
    fn additional_prompt_is_rendered_when_set() {
        let prompt = engine("  avoid GNU-only flags ")
            .render_main_script("x")
            .expect("render");
        assert!(prompt.contains("Additional instructions:\navoid GNU-only flags"));
    }

    #[test]
    fn test_prompt_describes_sandbox_contract() {
        let prompt = engine("")
            .render_test_script("print hello", "#!/bin/sh\necho hello\n")
            .expect("render");
        assert!(prompt.contains("<script>\n#!/bin/sh\necho hello\n</script>"));
        assert!(prompt.contains("./script.sh"));
        assert!(prompt.contains("$SCRIPT_PATH"));
    }

    #[test]
    fn fix_prompt_carries_failure_and_test() {
        let prompt = engine("")
            .render_fix_script("echo helo", "[ \"$(./script.sh)\" = hello ]", "exit status 1")
            .expect("render");
        assert!(prompt.contains("<failure>\nexit status 1\n</failure>"));
        assert!(prompt.contains("<test>\n[ \"$(./script.sh)\" = hello ]\n</test>"));
    }

    #[test]
    fn long_failure_output_keeps_the_tail() {
        let failure = format!("{}\nfinal error", "noise ".repeat(100));
        let prompt = engine("")
            .failure_budget_bytes(20)
            .render_fix_script("echo", "true", &failure)
            .expect("render");
        assert!(prompt.contains("final error"));
        assert!(prompt.contains("[truncated "));
        assert!(!prompt.contains(&"noise ".repeat(10)));
    }

    #[test]
    fn keep_tail_respects_char_boundaries() {
        let text = "ééééé";
        let kept = keep_tail(text, 3);
        assert!(kept.ends_with('é'));
    }
}
