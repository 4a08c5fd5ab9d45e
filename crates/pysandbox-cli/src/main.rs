//! pysandbox - sandboxed Python execution from the command line
//!
//! ## Commands
//!
//! - `exec`: Run a script in a session sandbox
//! - `install`: Install allow-listed packages into a session
//! - `ls`: List a session's mounted directory
//! - `policy`: Print the capability policy applied inside every guest

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use pysandbox_core::config::{
    ENV_CACHE_DIR, ENV_DATA_DIR, ENV_INDEX_URL, ENV_PACKAGES_DIR, ENV_PYTHON_WASM, ENV_STDLIB_DIR,
};
use pysandbox_core::metrics::METRICS;
use pysandbox_core::telemetry::init_tracing;
use pysandbox_core::tools::{clamp_timeout, render_execution};
use pysandbox_core::{
    build_registry, CapabilityPolicy, SandboxConfig, SandboxTools, SessionRegistry,
};

#[derive(Parser)]
#[command(name = "pysandbox")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-session sandboxed Python execution", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for [`SandboxConfig`]; anything unset falls back to the environment.
#[derive(clap::Args)]
struct ConfigArgs {
    /// Wheel cache directory
    #[arg(long, global = true, env = ENV_CACHE_DIR)]
    cache_dir: Option<PathBuf>,

    /// Host directory holding per-session mounts
    #[arg(long, global = true, env = ENV_DATA_DIR)]
    data_dir: Option<PathBuf>,

    /// CPython WASI module
    #[arg(long, global = true, env = ENV_PYTHON_WASM)]
    python_wasm: Option<PathBuf>,

    /// Interpreter standard library directory
    #[arg(long, global = true, env = ENV_STDLIB_DIR)]
    stdlib_dir: Option<PathBuf>,

    /// Bundled native package repository
    #[arg(long, global = true, env = ENV_PACKAGES_DIR)]
    packages_dir: Option<PathBuf>,

    /// Package index base URL
    #[arg(long, global = true, env = ENV_INDEX_URL)]
    index_url: Option<String>,
}

impl ConfigArgs {
    fn resolve(self) -> Result<SandboxConfig> {
        let mut config = SandboxConfig::from_env().context("Invalid sandbox configuration")?;
        if let Some(v) = self.cache_dir {
            config.cache_dir = v;
        }
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.python_wasm {
            config.python_wasm = v;
        }
        if let Some(v) = self.stdlib_dir {
            config.stdlib_dir = v;
        }
        if let Some(v) = self.packages_dir {
            config.packages_dir = Some(v);
        }
        if let Some(v) = self.index_url {
            config.index_url = v.trim_end_matches('/').to_string();
        }
        Ok(config)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Tool response text
    Text,
    /// Full execution result as JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run Python code in a session sandbox
    Exec {
        /// Code to run; `-` reads from stdin
        code: Option<String>,

        /// Read the script from a file instead
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,

        /// Session identifier
        #[arg(short, long, default_value = "default")]
        session: String,

        /// Timeout in milliseconds (clamped to 5000..=30000)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Install allow-listed packages into a session
    Install {
        /// Import names, e.g. `bs4 yaml`
        #[arg(required = true)]
        packages: Vec<String>,

        /// Session identifier
        #[arg(short, long, default_value = "default")]
        session: String,
    },

    /// List a session's mounted directory
    Ls {
        /// Session identifier
        #[arg(short, long, default_value = "default")]
        session: String,
    },

    /// Print the capability policy as JSON
    Policy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    init_tracing(cli.json, level);

    let result = run(cli.config, cli.command).await;

    if cli.verbose {
        METRICS.flush();
    }
    result
}

async fn run(config: ConfigArgs, command: Commands) -> Result<()> {
    if let Commands::Policy = command {
        return cmd_policy();
    }

    let config = config.resolve()?;
    let registry = build_registry(config).context("Failed to start the sandbox")?;
    match command {
        Commands::Exec {
            code,
            file,
            session,
            timeout,
            format,
        } => cmd_exec(registry, code, file, &session, timeout, format).await,
        Commands::Install { packages, session } => {
            cmd_install(&registry, &packages, &session).await
        }
        Commands::Ls { session } => cmd_ls(registry, &session).await,
        Commands::Policy => cmd_policy(),
    }
}

fn cmd_policy() -> Result<()> {
    println!("{}", CapabilityPolicy::standard().to_json()?);
    Ok(())
}

fn read_script(code: Option<String>, file: Option<PathBuf>) -> Result<String> {
    match (code, file) {
        (_, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read script {}", path.display())),
        (Some(code), None) if code == "-" => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read script from stdin")?;
            Ok(buf)
        }
        (Some(code), None) => Ok(code),
        (None, None) => bail!("Provide code, `-` for stdin, or --file"),
    }
}

async fn cmd_exec(
    registry: Arc<SessionRegistry>,
    code: Option<String>,
    file: Option<PathBuf>,
    session: &str,
    timeout: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let script = read_script(code, file)?;
    let tools = SandboxTools::new(registry);
    let timeout_ms = clamp_timeout(timeout);
    info!(session = %session, timeout_ms = timeout_ms, "executing script");

    let result = tools.executor().run_code(session, &script, timeout_ms).await;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => println!("{}", render_execution(&result).text()),
    }

    if !result.success {
        bail!("Execution failed");
    }
    Ok(())
}

async fn cmd_install(registry: &SessionRegistry, packages: &[String], session: &str) -> Result<()> {
    let runtime = registry
        .get_initialized(session)
        .await
        .context("Failed to initialize session")?;

    let mut failed = Vec::new();
    for package in packages {
        let outcome = runtime
            .install_package(package)
            .await
            .with_context(|| format!("Cannot install {package}"))?;
        for line in outcome.lines() {
            println!("{line}");
        }
        failed.extend(outcome.failed_packages().into_iter().map(str::to_string));
    }

    if !failed.is_empty() {
        bail!("Failed to install: {}", failed.join(", "));
    }
    Ok(())
}

/// Each CLI invocation starts with an empty registry, so bind the session
/// mount before listing it.
async fn cmd_ls(registry: Arc<SessionRegistry>, session: &str) -> Result<()> {
    let runtime = registry
        .get_or_create(session)
        .with_context(|| format!("Cannot open session {session}"))?;
    if !runtime.mount() {
        bail!("Mount rejected for session {session}");
    }
    let tools = SandboxTools::new(registry);
    let response = tools.list_mounted_directory(session).await;
    println!("{}", response.text());
    if response.is_error {
        bail!("Listing failed");
    }
    Ok(())
}
