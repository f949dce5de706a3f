use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use plugbench_core::{init_logging, AppDirs, Config, LogLevel};
use plugbench_host::{
    Arguments, BatchCommand, CommandJudge, EngineConfig, EngineMode, ExecutionResult,
    InteractiveSession, PluginEngine, TestCase, ValidatorConfig,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PLUGINS_DIR: &str = "plugins";
const PASSTHROUGH_EXIT_WORDS: [&str; 3] = ["exit", "quit", "done"];

#[derive(Debug, Parser)]
#[command(name = "plugbench", version, about = "Plugin host emulator and compliance tester")]
struct Cli {
    /// Directory holding one folder per plugin (takes precedence over config)
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Per-call timeout in milliseconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    /// Do not watch the plugins directory for changes
    #[arg(long, global = true)]
    no_watch: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
enum Command {
    /// Menu-driven session (the default)
    Interactive,
    /// Show loaded plugins, their functions or the tool catalog
    List(ListCommand),
    /// Run one function, routed by name
    Exec(ExecCommand),
    /// Open a session on a plugin and forward stdin lines to it
    Passthrough(PassthroughCommand),
    /// Run a JSON file of commands in order
    Batch(BatchArgs),
    /// Score a plugin against the protocol
    Validate(ValidateCommand),
    /// Run judge-driven test cases against a plugin
    Test(TestCommand),
}

#[derive(Debug, Parser, Clone)]
struct ListCommand {
    /// Print function definitions instead of plugin summaries
    #[arg(long, conflicts_with = "catalog")]
    functions: bool,
    /// Print the tool catalog a host would hand to a model
    #[arg(long)]
    catalog: bool,
    /// Restrict --functions to one plugin
    #[arg(long)]
    plugin: Option<String>,
}

#[derive(Debug, Parser, Clone)]
struct ExecCommand {
    function: String,
    /// Arguments as a JSON object
    #[arg(long)]
    args: Option<String>,
    /// Write the call history to this file
    #[arg(long)]
    history: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
struct PassthroughCommand {
    plugin: String,
    function: String,
    /// Arguments as a JSON object
    #[arg(long)]
    args: Option<String>,
}

#[derive(Debug, Parser, Clone)]
struct BatchArgs {
    file: PathBuf,
    /// Write the call history to this file
    #[arg(long)]
    history: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
struct ValidateCommand {
    plugin: String,
    /// Write the report as JSON to this file
    #[arg(long)]
    export: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
struct TestCommand {
    plugin: String,
    /// JSON file with a list of {function, prompt, expectation, arguments}
    #[arg(long)]
    cases: PathBuf,
    /// Judge command line; receives each assessment as JSON on stdin
    #[arg(long)]
    judge: String,
}

impl Command {
    fn mode(&self) -> EngineMode {
        match self {
            Command::Interactive | Command::List(_) | Command::Validate(_) => EngineMode::Interactive,
            Command::Exec(_) => EngineMode::OneShot,
            Command::Passthrough(_) => EngineMode::Passthrough,
            Command::Batch(_) => EngineMode::Batch,
            Command::Test(_) => EngineMode::Autonomous,
        }
    }
}

fn parse_arguments(raw: Option<&str>) -> Result<Arguments> {
    let Some(raw) = raw else {
        return Ok(Arguments::new());
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("--args is not valid JSON: {raw}"))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {other}"),
    }
}

fn engine_config(cli: &Cli, config: &Config, command: &Command) -> EngineConfig {
    let plugins_dir = cli
        .plugins_dir
        .clone()
        .or_else(|| config.plugins_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGINS_DIR));

    let mut engine = EngineConfig::from_settings(plugins_dir, &config.engine);
    engine.mode = command.mode();
    if let Some(ms) = cli.timeout {
        engine.timeout = Duration::from_millis(ms);
    }
    if cli.no_watch {
        engine.watch_plugins = false;
    }
    engine
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let mut config = Config::load_or_default(&dirs)?;
    if cli.verbose {
        config.logging.level = LogLevel::Debug;
    }
    let _logging = init_logging(&config.logging, &dirs)?;

    let command = cli.command.clone().unwrap_or(Command::Interactive);
    let mut engine = PluginEngine::new(engine_config(&cli, &config, &command));
    if let Command::Test(test) = &command {
        let judge = CommandJudge::from_command_line(&test.judge)?.with_timeout(engine.config().timeout);
        engine = engine.with_judge(Arc::new(judge));
    }
    let summary = engine.initialize()?;
    tracing::info!(
        loaded = summary.loaded,
        failed = summary.failed,
        functions = summary.functions,
        plugins_dir = %engine.config().plugins_dir.display(),
        "plugins loaded"
    );

    let validator = ValidatorConfig::from(&config.validator);
    let outcome = match command {
        Command::Interactive => {
            let stdin = io::stdin();
            let mut session = InteractiveSession::new(&mut engine, stdin.lock(), io::stdout())
                .with_validator(validator)
                .with_export_dir(dirs.report_dir());
            session.run().map_err(anyhow::Error::from)
        }
        Command::List(list) => run_list(&engine, &list),
        Command::Exec(exec) => run_exec(&mut engine, &exec),
        Command::Passthrough(passthrough) => run_passthrough(&mut engine, &passthrough),
        Command::Batch(batch) => run_batch(&mut engine, &batch),
        Command::Validate(validate) => run_validate(&engine, &validate, validator),
        Command::Test(test) => run_test(&mut engine, &test),
    };

    engine.shutdown();
    outcome
}

fn run_list(engine: &PluginEngine, list: &ListCommand) -> Result<()> {
    if list.catalog {
        println!("{}", serde_json::to_string_pretty(&engine.tool_catalog())?);
        return Ok(());
    }
    if list.functions {
        let functions = engine.list_functions(list.plugin.as_deref());
        println!("{}", serde_json::to_string_pretty(&functions)?);
        return Ok(());
    }

    let plugins = engine.list_plugins();
    if plugins.is_empty() {
        println!(
            "No plugins found in {}",
            engine.config().plugins_dir.display()
        );
    }
    for plugin in &plugins {
        let passthrough = if plugin.passthrough { " [passthrough]" } else { "" };
        println!(
            "{} ({} functions, {}){}",
            plugin.name, plugin.function_count, plugin.state, passthrough
        );
        println!("  {}", plugin.description);
    }
    for failed in engine.failed_plugins() {
        println!("{} FAILED: {}", failed.name, failed.reason);
    }
    Ok(())
}

/// Print chunks as they arrive; returns whether anything was streamed.
fn stream_to_stdout(engine: &PluginEngine) -> Arc<AtomicBool> {
    let streamed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&streamed);
    engine.set_stream_callback(move |_plugin, chunk| {
        flag.store(true, Ordering::SeqCst);
        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "{chunk}");
        let _ = stdout.flush();
    });
    streamed
}

fn print_result(result: &ExecutionResult, streamed: bool) -> Result<()> {
    if result.success {
        if streamed {
            println!();
        } else {
            println!("{}", result.response);
        }
        Ok(())
    } else {
        bail!(
            "{} failed: {}",
            result.function_name,
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}

fn export_history(engine: &PluginEngine, path: Option<&Path>) -> Result<()> {
    if let Some(path) = path {
        engine.export_history(path)?;
        println!("History written to {}", path.display());
    }
    Ok(())
}

fn run_exec(engine: &mut PluginEngine, exec: &ExecCommand) -> Result<()> {
    let arguments = parse_arguments(exec.args.as_deref())?;
    let streamed = stream_to_stdout(engine);
    let result = engine.execute(&exec.function, arguments, None);
    if engine.is_in_passthrough() {
        engine.exit_passthrough();
    }
    export_history(engine, exec.history.as_deref())?;
    print_result(&result, streamed.swap(false, Ordering::SeqCst))
}

fn run_passthrough(engine: &mut PluginEngine, command: &PassthroughCommand) -> Result<()> {
    let arguments = parse_arguments(command.args.as_deref())?;
    let streamed = stream_to_stdout(engine);
    let mut result = engine.execute_passthrough(&command.plugin, &command.function, arguments);
    print_result(&result, streamed.swap(false, Ordering::SeqCst))?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    while result.awaiting_input {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next().transpose()? else {
            break;
        };
        let line = line.trim();
        if PASSTHROUGH_EXIT_WORDS.contains(&line.to_ascii_lowercase().as_str()) {
            break;
        }
        result = engine.send_input(line);
        print_result(&result, streamed.swap(false, Ordering::SeqCst))?;
    }

    if engine.is_in_passthrough() {
        let exit = engine.exit_passthrough();
        tracing::debug!(?exit, "passthrough closed");
    }
    Ok(())
}

fn run_batch(engine: &mut PluginEngine, batch: &BatchArgs) -> Result<()> {
    let commands = BatchCommand::parse_file(&batch.file)?;
    let results = engine.execute_batch(&commands);
    for (index, result) in results.iter().enumerate() {
        let status = if result.success { "OK" } else { "FAILED" };
        let detail = result.error.as_deref().unwrap_or(&result.response);
        println!(
            "[{}/{}] {} {} ({}ms): {}",
            index + 1,
            commands.len(),
            status,
            result.function_name,
            result.execution_time.as_millis(),
            detail
        );
    }
    export_history(engine, batch.history.as_deref())?;

    let passed = results.iter().filter(|r| r.success).count();
    println!("{passed}/{} commands succeeded", commands.len());
    if passed < commands.len() {
        bail!("batch did not complete");
    }
    Ok(())
}

fn run_validate(engine: &PluginEngine, validate: &ValidateCommand, config: ValidatorConfig) -> Result<()> {
    let report = engine.validate_plugin(&validate.plugin, config)?;
    println!("{report}");
    if let Some(path) = &validate.export {
        report.export_json(path)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn run_test(engine: &mut PluginEngine, test: &TestCommand) -> Result<()> {
    let cases = TestCase::parse_file(&test.cases)?;
    let results = engine.test_plugin_autonomous(&test.plugin, &cases)?;

    for result in &results {
        let status = if result.passed { "PASS" } else { "FAIL" };
        println!(
            "{status} {} ({} turns, confidence {:.2}): {}",
            result.function_name, result.turns_used, result.confidence, result.reasoning
        );
    }
    let passed = results.iter().filter(|r| r.passed).count();
    println!("{passed}/{} cases passed", results.len());
    if passed < results.len() {
        bail!("{} test case(s) failed", results.len() - passed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("plugbench").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn no_subcommand_means_interactive() {
        let cli = parse(&[]);
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = parse(&["exec", "echo", "--args", "{\"text\":\"hi\"}", "--timeout", "500", "--no-watch"]);
        assert_eq!(cli.timeout, Some(500));
        assert!(cli.no_watch);
        let Some(Command::Exec(exec)) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(exec.function, "echo");
        assert_eq!(exec.args.as_deref(), Some("{\"text\":\"hi\"}"));
    }

    #[test]
    fn list_flags_conflict() {
        let err = Cli::try_parse_from(["plugbench", "list", "--functions", "--catalog"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_requires_cases_and_judge() {
        assert!(Cli::try_parse_from(["plugbench", "test", "example"]).is_err());
        let cli = parse(&["test", "example", "--cases", "cases.json", "--judge", "python judge.py"]);
        let Some(Command::Test(test)) = cli.command else {
            panic!("expected test");
        };
        assert_eq!(test.judge, "python judge.py");
        assert_eq!(test.cases, PathBuf::from("cases.json"));
    }

    #[test]
    fn arguments_must_be_an_object() {
        assert!(parse_arguments(None).unwrap().is_empty());
        assert_eq!(parse_arguments(Some("{\"a\":1}")).unwrap().len(), 1);
        assert!(parse_arguments(Some("[1]")).is_err());
        assert!(parse_arguments(Some("{")).is_err());
    }

    #[test]
    fn engine_config_prefers_flags() {
        let cli = parse(&["--plugins-dir", "/tmp/p", "--timeout", "250", "interactive"]);
        let mut config = Config::default();
        config.plugins_dir = Some(PathBuf::from("/elsewhere"));
        let command = cli.command.clone().unwrap_or(Command::Interactive);

        let engine = engine_config(&cli, &config, &command);
        assert_eq!(engine.plugins_dir, PathBuf::from("/tmp/p"));
        assert_eq!(engine.timeout, Duration::from_millis(250));
        assert!(engine.watches_plugins());
        assert_eq!(engine.mode, EngineMode::Interactive);

        let batch = parse(&["batch", "cmds.json"]);
        let command = batch.command.clone().unwrap_or(Command::Interactive);
        let engine = engine_config(&batch, &config, &command);
        assert_eq!(engine.plugins_dir, PathBuf::from("/elsewhere"));
        assert_eq!(engine.mode, EngineMode::Batch);
        assert!(!engine.watches_plugins());

        let quiet = parse(&["--no-watch", "interactive"]);
        let command = quiet.command.clone().unwrap_or(Command::Interactive);
        assert!(!engine_config(&quiet, &config, &command).watches_plugins());
    }
}
