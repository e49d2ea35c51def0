//! Turn a plain-language description into a shell script that has passed a
//! generated test, then run it.
//!
//! Verified scripts are cached by description under the platform cache
//! directory, so repeated runs skip generation as long as the cached test
//! still passes.

use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, ExitStatus};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use scriptgen::core::budget::{BudgetError, CancelToken, RunBudget};
use scriptgen::exit_codes;
use scriptgen::io::cache::ResultCache;
use scriptgen::io::completion::HttpCompletion;
use scriptgen::io::config::{
    AppConfig, ConfigOverrides, ProviderKind, apply_overrides, default_config_path, load_config,
    write_config,
};
use scriptgen::io::generator::LlmGenerator;
use scriptgen::io::prompt::{PlatformInfo, PromptEngine};
use scriptgen::io::sandbox::{SandboxConfig, SandboxExecutor, write_executable};
use scriptgen::logging;
use scriptgen::pipeline::{Pipeline, PipelineConfig, PipelineError, Provenance};
use scriptgen::report::{ConsoleReporter, Reporter, TracingReporter};

#[derive(Parser)]
#[command(
    name = "scriptgen",
    version,
    about = "Generate shell scripts from descriptions and verify them with generated tests"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Config file [default: $XDG_CONFIG_HOME/scriptgen/config.toml].
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging to stderr (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Text-generation backend.
    #[arg(long, global = true, value_enum)]
    provider: Option<ProviderKind>,

    /// Model name for the selected backend.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Seconds allowed for each test run.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Test runs per attempt (the first run plus repairs).
    #[arg(long, global = true)]
    max_fixes: Option<u32>,

    /// Full regenerations before giving up.
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Extra instructions appended to every prompt.
    #[arg(long, global = true)]
    prompt: Option<String>,

    /// Skip the cache for both lookup and storage.
    #[arg(long, global = true)]
    no_cache: bool,
}

impl GlobalArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            provider: self.provider,
            model: self.model.clone(),
            run_timeout_secs: self.timeout,
            max_fixes: self.max_fixes,
            max_attempts: self.max_attempts,
            additional_prompt: self.prompt.clone(),
        }
    }

    fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => default_config_path(),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Generate and verify a script for the description in FILE, then run it.
    Run {
        /// File holding the description, or `-` for stdin.
        file: PathBuf,

        /// Print the verified script instead of running it.
        #[arg(long)]
        print: bool,

        /// Arguments passed to the script.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
    /// Write the default config file.
    WriteConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Inspect or clear cached scripts.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Print where the script for the description in FILE is cached.
    Path {
        /// File holding the description, or `-` for stdin.
        file: PathBuf,
    },
    /// Remove every cached script.
    Clear,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.global.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => report_error(&err),
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run { file, print, args } => cmd_run(&cli.global, &file, print, &args),
        Command::WriteConfig { force } => cmd_write_config(&cli.global, force),
        Command::Cache { command } => match command {
            CacheCommand::Path { file } => cmd_cache_path(&cli.global, &file),
            CacheCommand::Clear => cmd_cache_clear(&cli.global),
        },
    }
}

fn report_error(err: &anyhow::Error) -> i32 {
    if let Some(pipeline_err) = err.downcast_ref::<PipelineError>() {
        eprintln!("scriptgen: {pipeline_err}");
        if let Some(detail) = pipeline_err.last_failure().filter(|d| !d.is_empty()) {
            eprintln!("\nlast failure:\n{detail}");
        }
        return pipeline_err.exit_code();
    }
    if let Some(budget_err) = err.downcast_ref::<BudgetError>() {
        eprintln!("scriptgen: {budget_err}");
        return exit_codes::BUDGET;
    }
    eprintln!("scriptgen: {err:#}");
    exit_codes::INVALID
}

fn cmd_run(global: &GlobalArgs, file: &Path, print: bool, args: &[OsString]) -> Result<i32> {
    let cfg = load_effective_config(global)?;
    let description = read_description(file)?;

    let budget = RunBudget::new(cfg.total_timeout());
    let interrupts = interrupt::watch(budget.cancel_token().clone())?;

    let sandbox_config = SandboxConfig::from_env()
        .env(cfg.sandbox.env.clone())
        .output_limit_bytes(cfg.output_limit_bytes);
    let platform = PlatformInfo::current(sandbox_config.shell.path.display().to_string());
    let prompts = PromptEngine::new(&platform, &cfg.additional_prompt);
    let generator = LlmGenerator::new(HttpCompletion::new(cfg.provider.clone())?, prompts);
    let shell = sandbox_config.shell.path.clone();

    let mut pipeline = Pipeline::new(
        generator,
        SandboxExecutor::new(sandbox_config),
        PipelineConfig {
            max_attempts: cfg.max_attempts,
            max_fixes: cfg.max_fixes,
            run_timeout: cfg.run_timeout(),
        },
    );
    if !global.no_cache {
        pipeline = pipeline.with_cache(cache_for(&cfg)?);
    }

    let reporter: &dyn Reporter = if global.verbose {
        &TracingReporter
    } else {
        &ConsoleReporter
    };
    let outcome = pipeline.generate_and_test(&description, &budget, reporter)?;

    match outcome.provenance {
        Provenance::Cache => debug!("using cached script"),
        Provenance::Generated { attempt, fixes } => debug!(attempt, fixes, "using new script"),
    }

    if print {
        print!("{}", outcome.main_script);
        if !outcome.main_script.ends_with('\n') {
            println!();
        }
        return Ok(exit_codes::OK);
    }
    budget.check()?;
    execute_script(&outcome.main_script, &shell, args, &interrupts)
}

fn cmd_write_config(global: &GlobalArgs, force: bool) -> Result<i32> {
    let path = global.config_path()?;
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    write_config(&path, &AppConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_cache_path(global: &GlobalArgs, file: &Path) -> Result<i32> {
    let cfg = load_config(&global.config_path()?)?;
    let description = read_description(file)?;
    println!("{}", cache_for(&cfg)?.path_for(&description).display());
    Ok(exit_codes::OK)
}

fn cmd_cache_clear(global: &GlobalArgs) -> Result<i32> {
    let cfg = load_config(&global.config_path()?)?;
    let cache = cache_for(&cfg)?;
    let removed = cache.clear()?;
    println!(
        "removed {removed} cached script(s) from {}",
        cache.dir().display()
    );
    Ok(exit_codes::OK)
}

fn load_effective_config(global: &GlobalArgs) -> Result<AppConfig> {
    let path = global.config_path()?;
    let cfg = load_config(&path)?;
    apply_overrides(cfg, &global.overrides())
}

fn cache_for(cfg: &AppConfig) -> Result<ResultCache> {
    let dir = match &cfg.cache_dir {
        Some(dir) => dir.clone(),
        None => ResultCache::default_dir().context("no cache directory for this platform")?,
    };
    Ok(ResultCache::new(dir))
}

fn read_description(file: &Path) -> Result<String> {
    let description = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read description from stdin")?;
        buf
    } else {
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?
    };
    if description.trim().is_empty() {
        bail!("description in {} is empty", file.display());
    }
    Ok(description)
}

/// Run the verified script with inherited stdio and return its exit code.
///
/// Scripts with a shebang are executed directly; others go through `shell`.
/// Signals we receive meanwhile are passed on to the script.
fn execute_script(
    script: &str,
    shell: &Path,
    args: &[OsString],
    interrupts: &interrupt::Interrupts,
) -> Result<i32> {
    let dir = tempfile::Builder::new()
        .prefix("scriptgen-run-")
        .tempdir()
        .context("create script dir")?;
    let path = dir.path().join("script.sh");
    write_executable(&path, script)?;

    let mut cmd = if script.starts_with("#!") {
        ProcessCommand::new(&path)
    } else {
        let mut cmd = ProcessCommand::new(shell);
        cmd.arg(&path);
        cmd
    };
    let mut child = cmd.args(args).spawn().context("run script")?;
    interrupts.forward_to(&child);
    let status = child.wait().context("wait for script")?;
    debug!(exit_code = ?status.code(), "script finished");
    Ok(exit_code_of(status))
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(exit_codes::INVALID)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(exit_codes::INVALID)
}

/// SIGINT/SIGTERM cancel the run while scripts are generated and tested, so
/// a sandboxed process group is killed instead of orphaned. Once the verified
/// script is running they are forwarded to it, and its exit status decides
/// ours.
#[cfg(unix)]
mod interrupt {
    use std::process::Child;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    use anyhow::{Context, Result};
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use tracing::{debug, warn};

    use super::CancelToken;

    /// Where signals go once the run is over. Zero means nowhere yet.
    pub struct Interrupts {
        script_pid: Arc<AtomicI32>,
        cancel: CancelToken,
    }

    impl Interrupts {
        pub fn forward_to(&self, child: &Child) {
            let Ok(pid) = i32::try_from(child.id()) else {
                return;
            };
            self.script_pid.store(pid, Ordering::SeqCst);
            // A signal that landed between the last budget check and here
            // only set the flag.
            if self.cancel.is_cancelled() {
                forward(pid, SIGTERM);
            }
        }
    }

    pub fn watch(cancel: CancelToken) -> Result<Interrupts> {
        let mut signals = Signals::new([SIGINT, SIGTERM]).context("register signal handlers")?;
        let script_pid = Arc::new(AtomicI32::new(0));
        let target = Arc::clone(&script_pid);
        let token = cancel.clone();
        std::thread::Builder::new()
            .name("scriptgen-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    match target.load(Ordering::SeqCst) {
                        0 => {
                            warn!(signal, "interrupted, cancelling run");
                            token.cancel();
                        }
                        pid => forward(pid, signal),
                    }
                }
            })
            .context("spawn signal watcher")?;
        Ok(Interrupts { script_pid, cancel })
    }

    fn forward(pid: i32, signal: i32) {
        let Ok(signal) = Signal::try_from(signal) else {
            return;
        };
        debug!(pid, %signal, "forwarding signal to script");
        if let Err(errno) = kill(Pid::from_raw(pid), signal) {
            debug!(%errno, pid, "script already gone");
        }
    }
}

#[cfg(not(unix))]
mod interrupt {
    use std::process::Child;

    use anyhow::Result;

    use super::CancelToken;

    pub struct Interrupts;

    impl Interrupts {
        pub fn forward_to(&self, _child: &Child) {}
    }

    pub fn watch(_cancel: CancelToken) -> Result<Interrupts> {
        Ok(Interrupts)
    }
}
