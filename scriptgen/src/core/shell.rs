//! Shell resolution and strict-mode flag selection.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Shell used when `$SHELL` is unset, empty, or not sh-compatible.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Shell families we know how to run hermetically and strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFamily {
    Bash,
    Zsh,
    Ksh,
    /// `sh`, `dash`, `ash`, busybox and anything else POSIX-shaped.
    Posix,
}

impl ShellFamily {
    /// Classify by executable name. `None` for shells that cannot run a
    /// POSIX test script at all (fish, csh, nushell, ...).
    pub fn from_executable(name: &str) -> Option<Self> {
        match name {
            "bash" => Some(Self::Bash),
            "zsh" => Some(Self::Zsh),
            "ksh" | "ksh93" | "mksh" | "pdksh" => Some(Self::Ksh),
            "sh" | "dash" | "ash" | "busybox" | "posh" => Some(Self::Posix),
            _ => None,
        }
    }

    /// Flags that make unset variables and failing commands (including
    /// pipeline members, where supported) abort, and skip startup files.
    pub fn strict_flags(self) -> &'static [&'static str] {
        match self {
            Self::Bash => &["--noprofile", "--norc", "-e", "-u", "-o", "pipefail"],
            Self::Zsh => &["--no-rcs", "--no-globalrcs", "-e", "-u", "-o", "pipefail"],
            Self::Ksh => &["-e", "-u", "-o", "pipefail"],
            // Non-interactive POSIX shells read no startup files; pipefail
            // is not portable across them.
            Self::Posix => &["-e", "-u"],
        }
    }
}

/// Resolved shell: executable plus the flags placed before the script path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    pub path: PathBuf,
    pub family: ShellFamily,
    pub args: Vec<String>,
}

impl ShellConfig {
    /// Resolve from the value of `$SHELL`, falling back to [`DEFAULT_SHELL`].
    pub fn detect(shell_env: Option<&OsStr>) -> Self {
        shell_env
            .filter(|value| !value.is_empty())
            .and_then(Self::for_path)
            .unwrap_or_else(Self::default_shell)
    }

    /// Shell config for an explicit path, or `None` if its family is unknown.
    pub fn for_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let name = path.file_name()?.to_str()?;
        let family = ShellFamily::from_executable(name)?;
        Some(Self {
            path: path.to_path_buf(),
            family,
            args: family.strict_flags().iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn default_shell() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SHELL),
            family: ShellFamily::Posix,
            args: ShellFamily::Posix
                .strict_flags()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Argument vector after the shell path: `[flags..., script]`.
    pub fn argv_for(&self, script: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(OsString::from)
            .chain(std::iter::once(script.as_os_str().to_owned()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_prefers_declared_shell() {
        let shell = ShellConfig::detect(Some(OsStr::new("/usr/local/bin/bash")));
        assert_eq!(shell.path, PathBuf::from("/usr/local/bin/bash"));
        assert_eq!(shell.family, ShellFamily::Bash);
        assert_eq!(
            shell.args,
            vec!["--noprofile", "--norc", "-e", "-u", "-o", "pipefail"]
        );
    }

    #[test]
    fn detect_falls_back_when_unset_or_empty() {
        assert_eq!(ShellConfig::detect(None), ShellConfig::default_shell());
        assert_eq!(
            ShellConfig::detect(Some(OsStr::new(""))),
            ShellConfig::default_shell()
        );
        assert_eq!(ShellConfig::default_shell().path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn detect_falls_back_for_non_posix_shells() {
        for shell in ["/usr/bin/fish", "/bin/tcsh", "/usr/bin/nu"] {
            assert_eq!(
                ShellConfig::detect(Some(OsStr::new(shell))),
                ShellConfig::default_shell(),
                "{shell} should fall back"
            );
        }
    }

    #[test]
    fn every_family_is_strict_about_errors_and_unset_vars() {
        for family in [
            ShellFamily::Bash,
            ShellFamily::Zsh,
            ShellFamily::Ksh,
            ShellFamily::Posix,
        ] {
            let flags = family.strict_flags();
            assert!(flags.contains(&"-e"), "{family:?} missing -e");
            assert!(flags.contains(&"-u"), "{family:?} missing -u");
        }
        assert!(ShellFamily::Zsh.strict_flags().contains(&"pipefail"));
    }

    #[test]
    fn argv_places_script_last() {
        let shell = ShellConfig::for_path("/bin/dash").expect("dash");
        let argv = shell.argv_for(Path::new("/tmp/x/test.sh"));
        assert_eq!(
            argv,
            vec![
                OsString::from("-e"),
                OsString::from("-u"),
                OsString::from("/tmp/x/test.sh"),
            ]
        );
    }
}
