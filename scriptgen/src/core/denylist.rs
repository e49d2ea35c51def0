//! Deny-list of destructive shell idioms, checked before any script runs.
//!
//! This is a coarse filter against a handful of well-known ways to wreck a
//! machine, not a sandbox. Matching is purely textual, so a pattern inside a
//! comment or string literal is rejected too.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::core::types::{ScriptPair, ScriptRole};

/// A deny-list match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Stable rule identifier (e.g. `recursive-delete-root`).
    pub rule: &'static str,
    /// The offending text as it appeared in the script.
    pub matched: String,
}

struct DenyRule {
    name: &'static str,
    pattern: Regex,
    /// Second-stage check for what the regex alone cannot express.
    accept: fn(&Captures<'_>) -> bool,
}

const BLOCK_DEVICE: &str = r"/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d|disk\d)";

static RULES: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    vec![
        rule(
            "recursive-delete-root",
            r#"(?m)\brm\s+((?:-{1,2}[A-Za-z][A-Za-z-]*\s+)+)(?:--\s+)?["']?(?:/\*?|~/?\*?|\$HOME/?\*?|\$\{HOME\}/?\*?)["']?(?:[\s;&|)]|$)"#,
            has_recursive_flag,
        ),
        rule("format-filesystem", r"\bmkfs(?:\.[A-Za-z0-9]+)?\b", always),
        rule(
            "raw-device-redirect",
            &format!(r">\s*{BLOCK_DEVICE}"),
            always,
        ),
        rule(
            "raw-device-dd",
            &format!(r"\bdd\b[^\n]*\bof={BLOCK_DEVICE}"),
            always,
        ),
        rule(
            "fork-bomb",
            r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            always,
        ),
        rule(
            "fetch-and-execute",
            r#"\b(?:curl|wget)\b[^\n|;]*\|\s*(?:sudo\s+)?(?:ba|da|k|z|fi)?sh\b|\b(?:ba|da|k|z)?sh\s+(?:-c\s+)?["']?(?:\$\(|<\()\s*(?:curl|wget)\b"#,
            always,
        ),
        rule(
            "recursive-chmod-root",
            r"(?m)\b(?:chmod|chown)\s+(?:-[A-Za-z]*R[A-Za-z]*\s+|--recursive\s+)+\S+\s+/(?:[\s;&|)]|$)",
            always,
        ),
    ]
});

fn rule(name: &'static str, pattern: &str, accept: fn(&Captures<'_>) -> bool) -> DenyRule {
    DenyRule {
        name,
        pattern: Regex::new(pattern).expect("deny-list pattern should compile"),
        accept,
    }
}

fn always(_: &Captures<'_>) -> bool {
    true
}

/// `rm` only counts as destructive here when it recurses.
fn has_recursive_flag(caps: &Captures<'_>) -> bool {
    caps.get(1).is_some_and(|flags| {
        flags.as_str().split_whitespace().any(|flag| {
            flag == "--recursive"
                || (flag.starts_with('-') && !flag.starts_with("--") && flag.contains(['r', 'R']))
        })
    })
}

/// Identifiers of every rule, in evaluation order.
pub fn rule_names() -> impl Iterator<Item = &'static str> {
    RULES.iter().map(|rule| rule.name)
}

/// First deny-list match in `script`, if any.
pub fn find_violation(script: &str) -> Option<Violation> {
    for rule in RULES.iter() {
        for caps in rule.pattern.captures_iter(script) {
            if (rule.accept)(&caps) {
                return Some(Violation {
                    rule: rule.name,
                    matched: caps[0].trim().to_string(),
                });
            }
        }
    }
    None
}

/// Check both halves of a pair, main script first.
pub fn check_pair(pair: &ScriptPair) -> Option<(ScriptRole, Violation)> {
    ScriptRole::ALL
        .into_iter()
        .find_map(|role| find_violation(pair.script(role)).map(|violation| (role, violation)))
}
