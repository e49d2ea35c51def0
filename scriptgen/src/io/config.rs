//! User configuration stored at `$XDG_CONFIG_HOME/scriptgen/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// scriptgen configuration (TOML).
///
/// Missing fields default to the values below. String values may reference
/// environment variables as `${NAME}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Sandbox runs per attempt (the first run plus up to `max_fixes - 1`
    /// repairs).
    pub max_fixes: u32,

    /// Full regenerations before giving up.
    pub max_attempts: u32,

    /// Wall-clock limit for one sandbox run, in seconds.
    pub run_timeout_secs: u64,

    /// Wall-clock limit for the whole run, generator calls included.
    pub total_timeout_secs: u64,

    /// Truncate captured test output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Extra instructions appended to every prompt.
    pub additional_prompt: String,

    /// Overrides the platform cache directory.
    pub cache_dir: Option<PathBuf>,

    pub sandbox: SandboxSection,

    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxSection {
    /// Variables set for every test run, on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

/// Text-generation backend, selected once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Ollama {
        host: String,
        model: String,
    },
    Claude {
        api_key: String,
        model: String,
    },
    #[serde(rename = "openai")]
    OpenAi {
        api_key: String,
        model: String,
    },
}

/// Provider names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    Ollama,
    Claude,
    #[value(name = "openai")]
    OpenAi,
}

impl ProviderConfig {
    pub fn default_for(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Ollama => ProviderConfig::Ollama {
                host: "http://localhost:11434".to_string(),
                model: "llama3.2".to_string(),
            },
            ProviderKind::Claude => ProviderConfig::Claude {
                api_key: "${CLAUDE_API_KEY}".to_string(),
                model: "claude-3-opus-20240229".to_string(),
            },
            ProviderKind::OpenAi => ProviderConfig::OpenAi {
                api_key: "${OPENAI_API_KEY}".to_string(),
                model: "gpt-4-turbo-preview".to_string(),
            },
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Ollama { .. } => ProviderKind::Ollama,
            ProviderConfig::Claude { .. } => ProviderKind::Claude,
            ProviderConfig::OpenAi { .. } => ProviderKind::OpenAi,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderConfig::Ollama { model, .. }
            | ProviderConfig::Claude { model, .. }
            | ProviderConfig::OpenAi { model, .. } => model,
        }
    }

    pub fn set_model(&mut self, new_model: impl Into<String>) {
        match self {
            ProviderConfig::Ollama { model, .. }
            | ProviderConfig::Claude { model, .. }
            | ProviderConfig::OpenAi { model, .. } => *model = new_model.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.model().trim().is_empty() {
            return Err(anyhow!("provider.model must be non-empty"));
        }
        match self {
            ProviderConfig::Ollama { host, .. } if host.trim().is_empty() => {
                Err(anyhow!("provider.host must be non-empty"))
            }
            ProviderConfig::Claude { api_key, .. } | ProviderConfig::OpenAi { api_key, .. }
                if api_key.trim().is_empty() =>
            {
                Err(anyhow!(
                    "provider.api_key must be non-empty for {}",
                    self.kind().as_str()
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::default_for(ProviderKind::Ollama)
    }
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Claude => "claude",
            ProviderKind::OpenAi => "openai",
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_fixes: 10,
            max_attempts: 3,
            run_timeout_secs: 30,
            total_timeout_secs: 600,
            output_limit_bytes: 100_000,
            additional_prompt: String::new(),
            cache_dir: None,
            sandbox: SandboxSection::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_fixes == 0 {
            return Err(anyhow!("max_fixes must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.total_timeout_secs == 0 {
            return Err(anyhow!("total_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        self.provider.validate()
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub run_timeout_secs: Option<u64>,
    pub max_fixes: Option<u32>,
    pub max_attempts: Option<u32>,
    pub additional_prompt: Option<String>,
}

/// Merge overrides into a loaded config and re-validate.
///
/// Switching provider kind starts from that provider's defaults; a model
/// override then applies to whichever provider is selected.
pub fn apply_overrides(base: AppConfig, overrides: &ConfigOverrides) -> Result<AppConfig> {
    let mut cfg = base;
    let current = cfg.provider.kind();
    if let Some(kind) = overrides.provider.filter(|kind| *kind != current) {
        cfg.provider = interpolate_provider(&ProviderConfig::default_for(kind));
    }
    if let Some(model) = &overrides.model {
        cfg.provider.set_model(model.clone());
    }
    if let Some(secs) = overrides.run_timeout_secs {
        cfg.run_timeout_secs = secs;
    }
    if let Some(max_fixes) = overrides.max_fixes {
        cfg.max_fixes = max_fixes;
    }
    if let Some(max_attempts) = overrides.max_attempts {
        cfg.max_attempts = max_attempts;
    }
    if let Some(prompt) = &overrides.additional_prompt {
        cfg.additional_prompt = prompt.clone();
    }
    cfg.validate().context("invalid configuration after overrides")?;
    Ok(cfg)
}

/// `$XDG_CONFIG_HOME/scriptgen/config.toml` or the platform equivalent.
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("no configuration directory for this platform")?;
    Ok(dir.join("scriptgen").join("config.toml"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns the defaults with environment references
/// resolved. Validation is left to [`apply_overrides`], since a command-line
/// override may repair an otherwise invalid file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let mut cfg = AppConfig::default();
        cfg.provider = interpolate_provider(&cfg.provider);
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("parse {}", path.display()))
}

fn parse_config(contents: &str) -> Result<AppConfig> {
    let resolved = interpolate_env(contents, |name| std::env::var(name).ok());
    let cfg: AppConfig = toml::from_str(&resolved)?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
///
/// `${NAME}` references are written as-is so secrets stay out of the file.
pub fn write_config(path: &Path, cfg: &AppConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env reference pattern should compile")
});

/// Replace `${NAME}` with `lookup(NAME)`, or the empty string when unset.
pub fn interpolate_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

fn interpolate_provider(provider: &ProviderConfig) -> ProviderConfig {
    let resolve = |value: &str| interpolate_env(value, |name| std::env::var(name).ok());
    match provider {
        ProviderConfig::Ollama { host, model } => ProviderConfig::Ollama {
            host: resolve(host),
            model: resolve(model),
        },
        ProviderConfig::Claude { api_key, model } => ProviderConfig::Claude {
            api_key: resolve(api_key),
            model: resolve(model),
        },
        ProviderConfig::OpenAi { api_key, model } => ProviderConfig::OpenAi {
            api_key: resolve(api_key),
            model: resolve(model),
        },
    }
}
