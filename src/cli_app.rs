//! CLI definition and command dispatch for `fim`.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use folder_integrity_monitor::core::config::Config;
use folder_integrity_monitor::core::errors::FimError;
use folder_integrity_monitor::daemon::signals::SignalHandler;
use folder_integrity_monitor::daemon::supervisor::Supervisor;
use folder_integrity_monitor::integrity::checker::{
    CheckerOptions, FolderIntegrityChecker, VerifyReport,
};
use folder_integrity_monitor::integrity::checksum::MismatchKind;

/// Folder integrity monitor: keeps a checksum database of a directory tree
/// current and verifies the tree against it.
#[derive(Debug, Parser)]
#[command(
    name = "fim",
    author,
    version,
    about = "Folder Integrity Monitor - checksum database keeper",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Watch the configured roots until SIGTERM/SIGINT.
    Watch(WatchArgs),
    /// Re-index every file under a root and save its database.
    Rebuild(RootArgs),
    /// Compare a root against its database.
    Verify(RootArgs),
    /// Recompute the checksum of one file.
    Update(UpdateArgs),
    /// Print the tracked entries of a root.
    List(RootArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct WatchArgs {
    /// Roots to watch instead of `daemon.roots`.
    #[arg(value_name = "ROOT")]
    roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct RootArgs {
    /// Watched root directory.
    root: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct UpdateArgs {
    /// Watched root directory.
    root: PathBuf,
    /// File to recompute, absolute or relative to the root.
    file: PathBuf,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Verification found changed or untracked files.
    #[error("{0}")]
    Violations(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Violations(_) => 4,
        }
    }
}

impl From<FimError> for CliError {
    fn from(value: FimError) -> Self {
        match value {
            FimError::InvalidConfig { .. }
            | FimError::MissingConfig { .. }
            | FimError::ConfigParse { .. }
            | FimError::OutsideRoot { .. }
            | FimError::UnrepresentablePath { .. } => Self::User(value.to_string()),
            _ => Self::Runtime(value.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Watch(args) => run_watch(cli, args),
        Command::Rebuild(args) => run_rebuild(cli, args),
        Command::Verify(args) => run_verify(cli, args),
        Command::Update(args) => run_update(cli, args),
        Command::List(args) => run_list(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

/// Open a checker for a one-shot command. The checker is never enabled, so
/// only the explicit operations touch the database.
fn open_checker(config: &Config, root: &Path) -> Result<FolderIntegrityChecker, CliError> {
    let options = CheckerOptions::from_config(&config.checker);
    Ok(FolderIntegrityChecker::open(root, options)?)
}

/// Checked before opening, since closing a checker writes its database.
fn require_database(config: &Config, root: &Path) -> Result<(), CliError> {
    let database = root.join(&config.checker.database_file_name);
    if database.exists() {
        Ok(())
    } else {
        Err(CliError::User(format!(
            "no database at {}; run `fim rebuild {}` first",
            database.display(),
            root.display()
        )))
    }
}

fn run_watch(cli: &Cli, args: &WatchArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    if !args.roots.is_empty() {
        config.daemon.roots.clone_from(&args.roots);
    }

    let mut supervisor = Supervisor::init(config, SignalHandler::new())?;
    if output_mode(cli) == OutputMode::Json {
        let roots: Vec<String> = supervisor
            .checkers()
            .iter()
            .map(|c| c.root().display().to_string())
            .collect();
        write_json_line(&json!({ "command": "watch", "roots": roots }))?;
    }
    supervisor.run()?;
    Ok(())
}

fn run_rebuild(cli: &Cli, args: &RootArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let checker = open_checker(&config, &args.root)?;
    let report = checker.rebuild_database();
    let saved = checker.save_database()?;
    checker.close()?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "{} {} ({} files indexed, {} skipped, {} ms)",
                "Rebuilt".green().bold(),
                checker.database_path().display(),
                report.indexed,
                report.skipped,
                report.duration_ms
            );
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "rebuild",
                "root": checker.root().display().to_string(),
                "database": checker.database_path().display().to_string(),
                "entries": saved,
                "report": serde_json::to_value(&report)?,
            }))?;
        }
    }
    Ok(())
}

fn run_verify(cli: &Cli, args: &RootArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    require_database(&config, &args.root)?;
    let checker = open_checker(&config, &args.root)?;

    let mode = output_mode(cli);
    let report = checker.verify_integrity(
        |path, expected, actual| {
            if mode == OutputMode::Human {
                print_finding(path, expected, actual);
            }
        },
        None,
    );
    checker.close()?;

    match mode {
        OutputMode::Human => print_verify_summary(&checker, &report),
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "verify",
                "root": checker.root().display().to_string(),
                "clean": report.is_clean(),
                "mismatches": report.mismatches(),
                "untracked": report.untracked(),
                "report": serde_json::to_value(&report)?,
            }))?;
        }
    }

    if report.findings.is_empty() {
        Ok(())
    } else {
        Err(CliError::Violations(format!(
            "{} mismatched, {} untracked",
            report.mismatches(),
            report.untracked()
        )))
    }
}

fn print_finding(path: &Path, expected: Option<&str>, actual: &str) {
    let kind = MismatchKind::classify(expected, actual);
    let label = match kind {
        MismatchKind::Untracked => kind.label().yellow(),
        _ => kind.label().red(),
    };
    println!("{label:>16}  {}", path.display());
    if let Some(expected) = expected {
        println!("{:>16}  expected {expected}", "");
    }
    println!("{:>16}  actual   {actual}", "");
}

fn print_verify_summary(checker: &FolderIntegrityChecker, report: &VerifyReport) {
    let status = if report.is_clean() {
        "CLEAN".green().bold()
    } else {
        "CHANGED".red().bold()
    };
    println!(
        "{status} {}: {} checked, {} mismatched, {} untracked, {} unreadable ({} ms)",
        checker.root().display(),
        report.checked,
        report.mismatches(),
        report.untracked(),
        report.failures.len(),
        report.duration_ms
    );
    for failure in &report.failures {
        eprintln!("  {} {}", failure.path.display(), failure.error_message);
    }
}

fn run_update(cli: &Cli, args: &UpdateArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let checker = open_checker(&config, &args.root)?;
    checker.update_file(&args.file)?;
    let checksum = checker.checksum_of(&args.file);
    checker.close()?;

    match output_mode(cli) {
        OutputMode::Human => match &checksum {
            Some(checksum) => println!("{checksum}  {}", args.file.display()),
            None => println!("{} {}", "removed".yellow(), args.file.display()),
        },
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "update",
                "path": args.file.display().to_string(),
                "checksum": checksum,
            }))?;
        }
    }
    Ok(())
}

fn run_list(cli: &Cli, args: &RootArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    require_database(&config, &args.root)?;
    let checker = open_checker(&config, &args.root)?;
    let entries = checker.database().sorted_entries();
    checker.close()?;

    match output_mode(cli) {
        OutputMode::Human => {
            let mut stdout = io::stdout().lock();
            for (key, checksum) in &entries {
                writeln!(stdout, "{checksum}  {key}")?;
            }
        }
        OutputMode::Json => {
            let items: Vec<Value> = entries
                .iter()
                .map(|(key, checksum)| json!({ "path": key.as_str(), "checksum": checksum }))
                .collect();
            write_json_line(&json!({
                "command": "list",
                "root": checker.root().display().to_string(),
                "entries": items,
            }))?;
        }
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "hash": hash,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                if output_mode(cli) == OutputMode::Json {
                    write_json_line(&json!({
                        "command": "config validate",
                        "valid": false,
                        "error": e.to_string(),
                    }))?;
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("FIM_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from([
            "fim",
            "--config",
            "/tmp/fim.toml",
            "--json",
            "--no-color",
            "verify",
            "/data",
        ]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["fim", "verify", "/data", "--json", "--no-color"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_every_subcommand() {
        let cases = [
            vec!["fim", "watch"],
            vec!["fim", "watch", "/a", "/b"],
            vec!["fim", "rebuild", "/data"],
            vec!["fim", "verify", "/data"],
            vec!["fim", "update", "/data", "docs/a.txt"],
            vec!["fim", "list", "/data"],
            vec!["fim", "config"],
            vec!["fim", "config", "path"],
            vec!["fim", "config", "show"],
            vec!["fim", "config", "validate"],
        ];

        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn root_commands_require_arguments() {
        assert!(Cli::try_parse_from(["fim", "verify"]).is_err());
        assert!(Cli::try_parse_from(["fim", "update", "/data"]).is_err());
    }

    #[test]
    fn completions_support_bash_zsh_and_fish() {
        for shell in ["bash", "zsh", "fish"] {
            let parsed = Cli::try_parse_from(["fim", "completions", shell]);
            assert!(parsed.is_ok(), "failed shell parse for {shell}");
        }
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(resolve_output_mode(true, Some("human"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("json"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("human"), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("auto"), true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            CliError::User(String::new()).exit_code(),
            CliError::Runtime(String::new()).exit_code(),
            CliError::Json(serde_json::from_str::<Value>("{").unwrap_err()).exit_code(),
            CliError::Violations(String::new()).exit_code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn fim_errors_map_to_user_or_runtime() {
        let user: CliError = FimError::OutsideRoot {
            path: PathBuf::from("/x"),
            root: PathBuf::from("/r"),
        }
        .into();
        assert_eq!(user.exit_code(), 1);
        let runtime: CliError = FimError::Runtime {
            details: "boom".to_string(),
        }
        .into();
        assert_eq!(runtime.exit_code(), 2);
    }
}
