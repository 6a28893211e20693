// BuildGuard - Main Entry Point
//
// Command-line front end for the secure executor:
// - run: execute one command with validation, env scrubbing and retry
// - validate: check a single untrusted value
// - env: show which variables a command would receive

use anyhow::Result;
use buildguard::config::Config;
use buildguard::exec::{
    self, CommandExecutor, ErrorCategory, ExecContext, ExecError, SecureExecutor, ValidationError,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

const EXIT_OPERATIONAL: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

/// BuildGuard: secure command execution for build pipelines
#[derive(Parser, Debug)]
#[command(name = "buildguard")]
#[command(author = "BuildGuard Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Validated, credential-scrubbed command execution for build automation", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/buildguard/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command through the secure executor
    Run {
        /// Print the command instead of running it
        #[arg(long)]
        dry_run: bool,

        /// Only allow this command name (repeatable)
        #[arg(long = "allow", value_name = "CMD")]
        allow: Vec<String>,

        /// Timeout in seconds for each attempt
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,

        /// Retry transient failures up to N more times
        #[arg(long, value_name = "N")]
        retries: Option<usize>,

        /// Delay before the first retry in milliseconds
        #[arg(long, value_name = "MS")]
        retry_delay_ms: Option<u64>,

        /// Capture output and print it when the command finishes
        #[arg(long)]
        capture: bool,

        /// Working directory for the command
        #[arg(long, value_name = "DIR")]
        workdir: Option<PathBuf>,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Validate a single value
    Validate {
        /// What kind of value to check
        #[arg(value_enum)]
        kind: ValueKind,

        /// Value to check
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// List the environment variable names a command would receive
    Env {
        /// Command name to filter for
        #[arg(long)]
        command: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ValueKind {
    Arg,
    Path,
    Version,
    GitRef,
    Filename,
    Url,
    Email,
    Port,
    EnvVar,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if let Err(e) = init_tracing(&config, args.verbose) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(EXIT_USAGE);
    }

    match args.command {
        Commands::Run {
            dry_run,
            allow,
            timeout,
            retries,
            retry_delay_ms,
            capture,
            workdir,
            command,
        } => {
            let mut exec_config = config.executor_config();
            if dry_run {
                exec_config = exec_config.dry_run(true);
            }
            if !allow.is_empty() {
                exec_config = exec_config.allowed_commands(allow);
            }
            if let Some(secs) = timeout {
                exec_config = exec_config.timeout(Duration::from_secs(secs));
            }
            if let Some(dir) = workdir {
                exec_config = exec_config.working_dir(dir);
            }

            let executor = SecureExecutor::with_config(exec_config);
            let attempts = retries
                .map(|n| n.saturating_add(1))
                .unwrap_or(config.retry.max_attempts);
            let delay = Duration::from_millis(retry_delay_ms.unwrap_or(config.retry.initial_delay_ms));

            run_command(&executor, &command, attempts, delay, capture).await
        }
        Commands::Validate { kind, value } => validate_value(kind, &value),
        Commands::Env { command } => print_env(&config, &command),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { config.log_level()? };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

/// Run one command, cancelling it on Ctrl-C
async fn run_command(
    executor: &SecureExecutor,
    command: &[String],
    attempts: usize,
    delay: Duration,
    capture: bool,
) -> ExitCode {
    let Some((name, rest)) = command.split_first() else {
        eprintln!("Error: no command given");
        return ExitCode::from(EXIT_USAGE);
    };
    let args: Vec<&str> = rest.iter().map(String::as_str).collect();

    let ctx = ExecContext::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling command");
            interrupt.cancel();
        }
    });

    debug!("Running {} with up to {} attempts", name, attempts);
    let captured = capture || executor.is_dry_run();
    let result = if captured {
        executor
            .execute_output_with_retry(&ctx, attempts, delay, name, &args)
            .await
            .map(|output| print!("{}", ensure_newline(output)))
    } else {
        executor
            .execute_with_retry(&ctx, attempts, delay, name, &args)
            .await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_failure(&err, captured),
    }
}

fn ensure_newline(mut output: String) -> String {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output
}

/// Print the error and map it to an exit code
///
/// Streamed runs already showed their output, so only captured output is
/// echoed.
fn report_failure(err: &ExecError, captured: bool) -> ExitCode {
    if let Some(output) = err.output().filter(|output| captured && !output.is_empty()) {
        eprint!("{}", ensure_newline(output.to_string()));
    }
    eprintln!("Error: {}", err);
    match err.category() {
        ErrorCategory::Usage => ExitCode::from(EXIT_USAGE),
        ErrorCategory::Operational => ExitCode::from(EXIT_OPERATIONAL),
        ErrorCategory::Cancelled => ExitCode::from(EXIT_CANCELLED),
    }
}

fn validate_value(kind: ValueKind, value: &str) -> ExitCode {
    let result: Result<String, ValidationError> = match kind {
        ValueKind::Arg => exec::validate_command_arg(value).map(|_| value.to_string()),
        ValueKind::Path => exec::validate_path(value).map(|p| p.display().to_string()),
        ValueKind::Version => exec::validate_version(value).map(|_| value.to_string()),
        ValueKind::GitRef => exec::validate_git_ref(value).map(|_| value.to_string()),
        ValueKind::Filename => exec::validate_filename(value).map(|_| value.to_string()),
        ValueKind::Url => exec::validate_url(value).map(|_| value.to_string()),
        ValueKind::Email => exec::validate_email(value).map(|_| value.to_string()),
        ValueKind::EnvVar => exec::validate_env_var_name(value).map(|_| value.to_string()),
        ValueKind::Port => match value.trim().parse::<i64>() {
            Ok(port) => exec::validate_port(port).map(|p| p.to_string()),
            Err(_) => {
                eprintln!("Error: port must be an integer: {:?}", value);
                return ExitCode::from(EXIT_USAGE);
            }
        },
    };

    match result {
        Ok(normalized) => {
            println!("valid: {}", normalized);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("invalid: {}", e);
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn print_env(config: &Config, command: &str) -> ExitCode {
    let executor = SecureExecutor::with_config(config.executor_config());
    if let Err(e) = executor.validator().validate_name(command) {
        eprintln!("invalid: {}", e);
        return ExitCode::from(EXIT_USAGE);
    }

    let mut names: Vec<String> = executor
        .child_env(&[], command)
        .iter()
        .filter_map(|entry| entry.split_once('=').map(|(key, _)| key.to_string()))
        .collect();
    names.sort();
    for name in names {
        println!("{}", name);
    }
    ExitCode::SUCCESS
}
