// sqlbridge - JSON-RPC host for database tooling
// Serves one editor over stdio, or one TCP client at a time with --listen.

mod exit_codes;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use env_logger::Target;
use log::LevelFilter;

use sqlbridge_config::{Settings, SettingsError};
use sqlbridge_host::{serve_stdio, ConnectorRegistry, HostError, TcpHost};

use exit_codes::{host_exit_code, EXIT_CONFIG, EXIT_ERROR, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "sqlbridge")]
#[command(about = "JSON-RPC host for database tooling (stdio unless --listen is given)")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Settings file [default: <config dir>/sqlbridge/settings.toml]
    #[arg(long, global = true, env = "SQLBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). Overrides RUST_LOG and the settings file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Write the log to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Serve TCP clients on HOST:PORT instead of stdio
    #[arg(long)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the settings file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the settings file location
    Path,

    /// Print the effective settings as TOML
    Show,
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("SQLBRIDGE_GIT_HASH"), ")",
        "\ntarget:  ", env!("SQLBRIDGE_TARGET"),
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Settings::config_path);

    let result = match &cli.command {
        Some(Commands::Config { command: ConfigCommands::Path }) => {
            println!("{}", config_path.display());
            Ok(())
        }
        Some(Commands::Config { command: ConfigCommands::Show }) => cmd_config_show(&config_path),
        None => cmd_serve(&cli, &config_path),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

fn cmd_config_show(path: &Path) -> Result<(), CliError> {
    let settings = Settings::load_from(path).map_err(CliError::settings)?;
    let text = settings
        .to_toml()
        .map_err(|e| CliError::general(e.to_string()))?;
    print!("{}", text);
    Ok(())
}

fn cmd_serve(cli: &Cli, config_path: &Path) -> Result<(), CliError> {
    let settings = Settings::load_from(config_path).map_err(CliError::settings)?;
    init_logging(cli.log_level.as_deref(), &settings.logging.level, cli.log_file.as_deref())?;
    log::info!("sqlbridge {} (settings: {})", env!("CARGO_PKG_VERSION"), config_path.display());

    let connectors = ConnectorRegistry::with_defaults();
    match cli.listen.clone().or_else(|| settings.server.listen.clone()) {
        Some(addr) => {
            let host = TcpHost::start(&addr, settings, connectors).map_err(CliError::host)?;
            host.join();
            Ok(())
        }
        None => serve_stdio(&settings, connectors).map_err(CliError::host),
    }
}

/// Level precedence: `--log-level`, then `RUST_LOG`, then the settings file.
/// The log never goes to stdout, which may be the protocol channel.
fn init_logging(cli_level: Option<&str>, settings_level: &str, log_file: Option<&Path>) -> Result<(), CliError> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::from_str(settings_level).unwrap_or(LevelFilter::Info));
    builder.parse_default_env();
    if let Some(level) = cli_level {
        let level = LevelFilter::from_str(level)
            .map_err(|_| {
                CliError::usage(format!("invalid log level '{}'", level))
                    .with_hint("levels are off, error, warn, info, debug, trace")
            })?;
        builder.filter_level(level);
    }

    builder.target(Target::Stderr);
    if let Some(path) = log_file {
        let file = File::create(path)
            .map_err(|e| CliError::general(format!("cannot open log file {}: {}", path.display(), e)))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| CliError::general(format!("failed to initialize logging: {}", e)))
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn general(msg: impl Into<String>) -> Self {
        Self { code: EXIT_ERROR, message: msg.into(), hint: None }
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn settings(err: SettingsError) -> Self {
        Self {
            code: EXIT_CONFIG,
            message: err.to_string(),
            hint: Some("run `sqlbridge config path` to see which file was read".to_string()),
        }
    }

    pub fn host(err: HostError) -> Self {
        let hint = match &err {
            HostError::Bind { .. } => Some("is another sqlbridge already listening there?".to_string()),
            _ => None,
        };
        Self { code: host_exit_code(&err), message: err.to_string(), hint }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
