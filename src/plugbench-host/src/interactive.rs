//! Menu-driven operator loop.
//!
//! Reads from any `BufRead` and writes to any `Write`, so a session can be scripted in
//! tests as easily as it runs on a terminal. End of input ends the session.

use crate::engine::{PassthroughExit, PluginEngine};
use crate::manifest::FunctionDefinition;
use crate::plugin::{Arguments, PluginState};
use crate::validator::ValidatorConfig;
use crate::watcher::ChangeKind;
use chrono::Local;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};

const WIDE: usize = 70;
const NARROW: usize = 50;
const EXIT_WORDS: [&str; 3] = ["exit", "quit", "done"];

/// Turn operator text into a JSON value of the declared type; anything that does not
/// parse stays a string.
pub fn coerce_value(kind: &str, raw: &str) -> Value {
    let parsed = match kind {
        "number" | "integer" if raw.contains('.') => raw.parse::<f64>().ok().map(Value::from),
        "number" | "integer" => raw.parse::<i64>().ok().map(Value::from),
        "boolean" => Some(Value::Bool(matches!(
            raw.to_ascii_lowercase().as_str(),
            "true" | "yes" | "1"
        ))),
        "array" if raw.starts_with('[') => serde_json::from_str(raw).ok(),
        "array" => Some(Value::Array(raw.split(',').map(Value::from).collect())),
        "object" => serde_json::from_str(raw).ok(),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::from(raw))
}

fn status_label(state: PluginState) -> &'static str {
    if state == PluginState::Ready {
        "RUNNING"
    } else {
        "STOPPED"
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

/// Pick an entry by 1-based number or case-insensitive name.
fn select<'a, T>(items: &'a [T], choice: &str, name: impl Fn(&T) -> &str) -> Option<&'a T> {
    match choice.parse::<usize>() {
        Ok(n) => n.checked_sub(1).and_then(|idx| items.get(idx)),
        Err(_) => items.iter().find(|item| name(item).eq_ignore_ascii_case(choice)),
    }
}

pub struct InteractiveSession<'e, R, W> {
    engine: &'e mut PluginEngine,
    input: R,
    output: W,
    validator: ValidatorConfig,
    export_dir: PathBuf,
}

impl<'e, R: BufRead, W: Write> InteractiveSession<'e, R, W> {
    pub fn new(engine: &'e mut PluginEngine, input: R, output: W) -> Self {
        Self {
            engine,
            input,
            output,
            validator: ValidatorConfig::default(),
            export_dir: PathBuf::from("."),
        }
    }

    pub fn with_validator(mut self, config: ValidatorConfig) -> Self {
        self.validator = config;
        self
    }

    /// Where validation reports are written when the operator asks for an export.
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = dir.into();
        self
    }

    pub fn run(&mut self) -> io::Result<()> {
        self.print_banner()?;
        self.print_startup_summary()?;

        let outcome = self.main_loop();
        let result = match outcome {
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                if self.engine.is_in_passthrough() {
                    self.engine.exit_passthrough();
                }
                writeln!(self.output, "\nNon-interactive mode detected. Exiting...")
            }
            other => other,
        };
        self.engine.shutdown();
        result
    }

    fn main_loop(&mut self) -> io::Result<()> {
        loop {
            if self.engine.is_in_passthrough() {
                self.passthrough_loop()?;
                continue;
            }
            if self.engine.has_pending_changes() {
                self.print_plugin_changes()?;
            }

            let choice = self.show_main_menu()?;
            match choice.as_str() {
                "1" => self.list_plugins()?,
                "2" => self.select_plugin()?,
                "3" => self.execute_function()?,
                "4" => self.validate_plugin()?,
                "5" => self.reload_plugins()?,
                c if c == "0" || ["q", "quit", "exit"].contains(&c.to_ascii_lowercase().as_str()) => {
                    writeln!(self.output, "\nShutting down...")?;
                    return Ok(());
                }
                _ => writeln!(self.output, "\nInvalid choice. Please try again.")?,
            }
        }
    }

    fn read_line(&mut self, prompt: &str) -> io::Result<String> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input closed"));
        }
        Ok(line.trim().to_string())
    }

    fn confirm(&mut self, prompt: &str, default_yes: bool) -> io::Result<bool> {
        let answer = self.read_line(prompt)?.to_ascii_lowercase();
        Ok(match answer.as_str() {
            "" => default_yes,
            "y" | "yes" => true,
            _ => false,
        })
    }

    fn heading(&mut self, title: &str) -> io::Result<()> {
        writeln!(self.output, "\n{}", "=".repeat(WIDE))?;
        writeln!(self.output, "{title}")?;
        writeln!(self.output, "{}", "=".repeat(WIDE))
    }

    fn print_banner(&mut self) -> io::Result<()> {
        writeln!(self.output, "\n{}", "=".repeat(WIDE))?;
        writeln!(self.output, "  Plugbench")?;
        writeln!(self.output, "  Plugin host emulator for development & testing")?;
        writeln!(self.output, "{}", "=".repeat(WIDE))
    }

    fn print_startup_summary(&mut self) -> io::Result<()> {
        let plugins = self.engine.list_plugins();
        let failed = self.engine.failed_plugins();
        let mcp = self.engine.manager().mcp_plugins();

        writeln!(self.output, "\nDiscovered {} plugin(s)", plugins.len())?;
        if !mcp.is_empty() {
            writeln!(self.output, "MCP-enabled plugins: {}", mcp.join(", "))?;
        }

        if !plugins.is_empty() {
            writeln!(self.output, "\nLoaded plugins:")?;
            for (i, plugin) in plugins.iter().enumerate() {
                let mut flags = Vec::new();
                if plugin.persistent {
                    flags.push("persistent");
                }
                if plugin.passthrough {
                    flags.push("passthrough");
                }
                if mcp.contains(&plugin.name) {
                    flags.push("MCP");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", flags.join(", "))
                };
                writeln!(
                    self.output,
                    "  {}. {} - {} function(s) [{}]{flags}",
                    i + 1,
                    plugin.name,
                    plugin.function_count,
                    status_label(plugin.state)
                )?;
            }
        }

        if !failed.is_empty() {
            writeln!(self.output, "\nFailed to load:")?;
            for plugin in &failed {
                writeln!(self.output, "  - {}: {}", plugin.name, plugin.reason)?;
            }
        }
        writeln!(self.output)
    }

    fn print_plugin_changes(&mut self) -> io::Result<()> {
        let changes = self.engine.take_plugin_changes();
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        let mut updated = BTreeSet::new();
        for change in changes {
            match change.kind {
                ChangeKind::Added => added.insert(change.plugin_name),
                ChangeKind::Removed => removed.insert(change.plugin_name),
                ChangeKind::ManifestUpdated | ChangeKind::Modified => updated.insert(change.plugin_name),
            };
        }

        writeln!(self.output, "\n{}", "=".repeat(NARROW))?;
        writeln!(self.output, "  PLUGIN CHANGES DETECTED")?;
        writeln!(self.output, "{}", "=".repeat(NARROW))?;
        for (label, names) in [
            ("+ New plugins:", &added),
            ("- Removed plugins:", &removed),
            ("~ Updated plugins:", &updated),
        ] {
            if names.is_empty() {
                continue;
            }
            writeln!(self.output, "\n  {label}")?;
            for name in names {
                writeln!(self.output, "      {name}")?;
            }
        }
        writeln!(self.output, "\n  Press 5 to reload or continue with current state")?;
        writeln!(self.output, "{}", "=".repeat(NARROW))
    }

    fn show_main_menu(&mut self) -> io::Result<String> {
        let rule = "-".repeat(40);
        writeln!(self.output, "\n{rule}")?;
        writeln!(self.output, "MAIN MENU")?;
        writeln!(self.output, "{rule}")?;
        writeln!(self.output, "  1. List all plugins")?;
        writeln!(self.output, "  2. Select a plugin (view functions)")?;
        writeln!(self.output, "  3. Execute a function")?;
        writeln!(self.output, "  4. Validate a plugin")?;
        writeln!(self.output, "  5. Reload plugins")?;
        writeln!(self.output, "  0. Exit")?;
        writeln!(self.output, "{rule}")?;
        self.read_line("Enter choice: ")
    }

    fn list_plugins(&mut self) -> io::Result<()> {
        let plugins = self.engine.list_plugins();
        self.heading(&format!("LOADED PLUGINS ({})", plugins.len()))?;
        if plugins.is_empty() {
            return writeln!(self.output, "No plugins loaded.");
        }
        for (i, plugin) in plugins.iter().enumerate() {
            writeln!(self.output, "\n[{}] {}", i + 1, plugin.name)?;
            writeln!(self.output, "    Description: {}", plugin.description)?;
            writeln!(self.output, "    Status: {}", status_label(plugin.state))?;
            writeln!(self.output, "    Functions: {}", plugin.function_count)?;
            writeln!(self.output, "    Persistent: {}", yes_no(plugin.persistent))?;
            writeln!(self.output, "    Passthrough: {}", yes_no(plugin.passthrough))?;
        }
        writeln!(self.output)
    }

    fn select_plugin(&mut self) -> io::Result<()> {
        let plugins = self.engine.list_plugins();
        if plugins.is_empty() {
            return writeln!(self.output, "\nNo plugins loaded.");
        }

        self.heading("SELECT A PLUGIN")?;
        for (i, plugin) in plugins.iter().enumerate() {
            writeln!(self.output, "  {}. {} ({} functions)", i + 1, plugin.name, plugin.function_count)?;
        }
        writeln!(self.output, "  0. Back to main menu")?;

        let choice = self.read_line("\nEnter plugin number: ")?;
        if choice == "0" {
            return Ok(());
        }
        match select(&plugins, &choice, |p| p.name.as_str()) {
            Some(plugin) => {
                let name = plugin.name.clone();
                self.show_plugin_functions(&name)
            }
            None => writeln!(self.output, "Invalid selection."),
        }
    }

    fn show_plugin_functions(&mut self, plugin_name: &str) -> io::Result<()> {
        let Some(plugin) = self.engine.plugin(plugin_name) else {
            return writeln!(self.output, "Plugin '{plugin_name}' not found.");
        };
        let manifest = plugin.manifest();

        self.heading(&format!("PLUGIN: {plugin_name}\nDescription: {}", manifest.description))?;
        writeln!(self.output, "\nFunctions ({}):", manifest.functions.len())?;
        writeln!(self.output, "{}", "-".repeat(NARROW))?;
        for (i, function) in manifest.functions.iter().enumerate() {
            writeln!(self.output, "\n  [{}] {}", i + 1, function.name)?;
            writeln!(self.output, "      {}", function.description)?;
            if function.parameters.is_empty() {
                continue;
            }
            writeln!(self.output, "      Parameters:")?;
            for param in &function.parameters {
                let mark = if param.required { "*" } else { " " };
                writeln!(
                    self.output,
                    "        {mark} {} ({}): {}",
                    param.name, param.kind, param.description
                )?;
                if let Some(values) = param.enum_values.as_ref().filter(|v| !v.is_empty()) {
                    writeln!(self.output, "          Options: {}", join_values(values))?;
                }
            }
        }
        writeln!(self.output, "\n  (* = required parameter)\n")?;

        let choice = self.read_line("Enter function number to execute (or 0 to go back): ")?;
        if choice == "0" {
            return Ok(());
        }
        let selected = choice
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| manifest.functions.get(idx))
            .cloned();
        match selected {
            Some(function) => self.execute_interactively(&function),
            None => Ok(()),
        }
    }

    fn execute_function(&mut self) -> io::Result<()> {
        let names = self.engine.manager().all_functions();
        if names.is_empty() {
            return writeln!(self.output, "\nNo functions available.");
        }

        self.heading("EXECUTE FUNCTION")?;
        for (i, name) in names.iter().enumerate() {
            let owner = self
                .engine
                .manager()
                .plugin_for_function(name)
                .unwrap_or_else(|| "unknown".to_string());
            writeln!(self.output, "  {}. {name} [{owner}]", i + 1)?;
        }
        writeln!(self.output, "  0. Back to main menu")?;

        let choice = self.read_line("\nEnter function number or name: ")?;
        if choice == "0" {
            return Ok(());
        }
        let definition = select(&names, &choice, String::as_str)
            .and_then(|name| self.engine.manager().function_definition(name));
        match definition {
            Some(function) => self.execute_interactively(&function),
            None => writeln!(self.output, "Function not found."),
        }
    }

    fn prompt_arguments(&mut self, function: &FunctionDefinition) -> io::Result<Arguments> {
        let mut arguments = Arguments::new();
        if function.parameters.is_empty() {
            return Ok(arguments);
        }

        writeln!(self.output, "\nEnter arguments (press Enter for default/skip optional):")?;
        writeln!(self.output, "{}", "-".repeat(NARROW))?;
        for param in &function.parameters {
            let requirement = if param.required { "required" } else { "optional" };
            writeln!(self.output, "\n  {} ({requirement}):", param.name)?;
            writeln!(self.output, "    Type: {}", param.kind)?;
            if !param.description.is_empty() {
                writeln!(self.output, "    Description: {}", param.description)?;
            }
            if let Some(values) = param.enum_values.as_ref().filter(|v| !v.is_empty()) {
                writeln!(self.output, "    Options: {}", join_values(values))?;
            }

            let default = param
                .default
                .as_ref()
                .map(|d| format!(" [default: {}]", display_value(d)))
                .unwrap_or_default();
            let raw = self.read_line(&format!("    Enter value{default}: "))?;
            if !raw.is_empty() {
                arguments.insert(param.name.clone(), coerce_value(&param.kind, &raw));
            } else if let Some(default) = &param.default {
                arguments.insert(param.name.clone(), default.clone());
            } else if param.required {
                writeln!(
                    self.output,
                    "    Warning: Required parameter '{}' was not provided.",
                    param.name
                )?;
            }
        }
        Ok(arguments)
    }

    fn execute_interactively(&mut self, function: &FunctionDefinition) -> io::Result<()> {
        self.heading(&format!("EXECUTE: {}", function.name))?;
        writeln!(self.output, "Description: {}", function.description)?;
        let arguments = self.prompt_arguments(function)?;

        self.heading("CONFIRM EXECUTION")?;
        writeln!(self.output, "Function: {}", function.name)?;
        let pretty = serde_json::to_string_pretty(&arguments).unwrap_or_else(|_| "{}".to_string());
        writeln!(self.output, "Arguments: {pretty}")?;
        if !self.confirm("\nExecute? (Y/n): ", true)? {
            return writeln!(self.output, "Cancelled.");
        }

        writeln!(self.output, "\nExecuting...")?;
        writeln!(self.output, "{}", "-".repeat(NARROW))?;
        let result = self.engine.execute(&function.name, arguments, None);

        self.heading("RESULT")?;
        writeln!(self.output, "Success: {}", result.success)?;
        writeln!(
            self.output,
            "Execution time: {:.1}ms",
            result.execution_time.as_secs_f64() * 1000.0
        )?;
        if !result.response.is_empty() {
            writeln!(self.output, "\nResponse:\n{}", result.response)?;
        }
        if let Some(error) = &result.error {
            writeln!(self.output, "\nError: {error}")?;
        }
        if result.awaiting_input {
            writeln!(self.output, "\nPlugin entered passthrough mode. Type 'exit' to leave.")?;
            writeln!(self.output, "{}", "-".repeat(NARROW))?;
        }
        Ok(())
    }

    fn passthrough_loop(&mut self) -> io::Result<()> {
        let plugin = self.engine.passthrough_plugin().unwrap_or_default().to_string();
        writeln!(self.output, "\n[Passthrough mode with '{plugin}']")?;
        writeln!(self.output, "Type 'exit', 'quit', or 'done' to leave passthrough mode.\n")?;

        while self.engine.is_in_passthrough() {
            let line = self.read_line(&format!("[{plugin}]> "))?;
            if EXIT_WORDS.contains(&line.to_ascii_lowercase().as_str()) {
                if self.engine.exit_passthrough() == PassthroughExit::Forced {
                    writeln!(self.output, "Plugin did not close its session and was stopped.")?;
                }
                writeln!(self.output, "Exited passthrough mode.\n")?;
                break;
            }
            if line.is_empty() {
                continue;
            }

            let result = self.engine.send_input(&line);
            if !result.response.is_empty() {
                writeln!(self.output, "{}", result.response)?;
            }
            if let Some(error) = &result.error {
                writeln!(self.output, "Error: {error}")?;
            }
        }
        Ok(())
    }

    fn validate_plugin(&mut self) -> io::Result<()> {
        let plugins = self.engine.list_plugins();
        if plugins.is_empty() {
            return writeln!(self.output, "\nNo plugins loaded.");
        }

        self.heading("VALIDATE PLUGIN")?;
        writeln!(self.output, "Select a plugin to validate:")?;
        for (i, plugin) in plugins.iter().enumerate() {
            writeln!(self.output, "  {}. {} [{}]", i + 1, plugin.name, status_label(plugin.state))?;
        }
        writeln!(self.output, "  0. Back to main menu")?;

        let choice = self.read_line("\nEnter plugin number: ")?;
        if choice == "0" {
            return Ok(());
        }
        let Some(name) = select(&plugins, &choice, |p| p.name.as_str()).map(|p| p.name.clone()) else {
            return writeln!(self.output, "Invalid selection.");
        };

        self.heading(&format!("VALIDATING: {name}"))?;
        writeln!(self.output, "\nThis will run a comprehensive validation suite including:")?;
        for item in [
            "Manifest compliance",
            "Startup behavior",
            "Protocol compliance (JSON-RPC 2.0)",
            "Heartbeat/ping response",
            "Function execution",
            "Error handling",
            "Shutdown behavior",
        ] {
            writeln!(self.output, "  - {item}")?;
        }
        writeln!(self.output)?;
        if !self.confirm("Start validation? (Y/n): ", true)? {
            return writeln!(self.output, "Validation cancelled.");
        }

        writeln!(self.output, "\nRunning validation (this may take a minute)...")?;
        writeln!(self.output, "{}", "-".repeat(WIDE))?;
        let report = match self.engine.validate_plugin(&name, self.validator.clone()) {
            Ok(report) => report,
            Err(err) => {
                error!(plugin = %name, error = %err, "validation failed to run");
                return writeln!(self.output, "Validation failed: {err}");
            }
        };
        writeln!(self.output, "{report}")?;

        if self.confirm("Export report to JSON? (y/N): ", false)? {
            let file = format!("validation_{name}_{}.json", Local::now().format("%Y%m%d_%H%M%S"));
            let path = self.export_dir.join(file);
            match report.export_json(&path) {
                Ok(()) => writeln!(self.output, "Report exported to {}", path.display())?,
                Err(err) => writeln!(self.output, "Export failed: {err}")?,
            }
        }
        Ok(())
    }

    fn reload_plugins(&mut self) -> io::Result<()> {
        writeln!(self.output, "\nReloading plugins...")?;
        match self.engine.reload() {
            Ok(summary) => {
                info!(loaded = summary.loaded, failed = summary.failed, "plugins reloaded");
                writeln!(self.output, "Plugins reloaded successfully.")?;
                self.print_startup_summary()
            }
            Err(err) => writeln!(self.output, "Failed to reload plugins: {err}"),
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn join_values(values: &[Value]) -> String {
    values.iter().map(display_value).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use serde_json::json;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn engine() -> (TempDir, PluginEngine) {
        let dir = TempDir::new().unwrap();
        let plugin_dir = dir.path().join("tools");
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::write(
            plugin_dir.join("manifest.json"),
            json!({
                "manifestVersion": 1,
                "protocol_version": "2.0",
                "executable": "missing-binary",
                "persistent": false,
                "description": "Handy tools",
                "functions": [{
                    "name": "paint",
                    "description": "Paint something",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "color": {"type": "string", "enum": ["red", "blue"]},
                            "coats": {"type": "integer", "default": 2}
                        },
                        "required": ["color"]
                    }
                }]
            })
            .to_string(),
        )
        .unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.watch_plugins = false;
        let mut engine = PluginEngine::new(config);
        engine.initialize().unwrap();
        (dir, engine)
    }

    fn run_script(engine: &mut PluginEngine, script: &str) -> String {
        let mut output = Vec::new();
        InteractiveSession::new(engine, Cursor::new(script.to_string()), &mut output)
            .run()
            .unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn coerces_by_declared_type() {
        assert_eq!(coerce_value("integer", "3"), json!(3));
        assert_eq!(coerce_value("number", "2.5"), json!(2.5));
        assert_eq!(coerce_value("number", "many"), json!("many"));
        assert_eq!(coerce_value("boolean", "Yes"), json!(true));
        assert_eq!(coerce_value("boolean", "nope"), json!(false));
        assert_eq!(coerce_value("array", "a,b"), json!(["a", "b"]));
        assert_eq!(coerce_value("array", "[1, 2]"), json!([1, 2]));
        assert_eq!(coerce_value("object", "{\"k\": 1}"), json!({"k": 1}));
        assert_eq!(coerce_value("object", "{broken"), json!("{broken"));
        assert_eq!(coerce_value("string", "42"), json!("42"));
    }

    #[test]
    fn lists_plugins_and_exits() {
        let (_dir, mut engine) = engine();
        let out = run_script(&mut engine, "1\n0\n");
        assert!(out.contains("Discovered 1 plugin(s)"));
        assert!(out.contains("LOADED PLUGINS (1)"));
        assert!(out.contains("    Description: Handy tools"));
        assert!(out.contains("Shutting down..."));
    }

    #[test]
    fn shows_functions_with_options() {
        let (_dir, mut engine) = engine();
        let out = run_script(&mut engine, "2\ntools\n0\n0\n");
        assert!(out.contains("PLUGIN: tools"));
        assert!(out.contains("* color (string): "));
        assert!(out.contains("Options: red, blue"));
    }

    #[test]
    fn executes_with_prompted_arguments() {
        let (_dir, mut engine) = engine();
        let out = run_script(&mut engine, "3\npaint\nred\n\ny\n0\n");
        assert!(out.contains("[default: 2]"));
        assert!(out.contains("\"color\": \"red\""));
        assert!(out.contains("\"coats\": 2"));
        assert!(out.contains("Success: false"));
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.history()[0].arguments.get("coats"), Some(&json!(2)));
    }

    #[test]
    fn invalid_choice_then_end_of_input() {
        let (_dir, mut engine) = engine();
        let out = run_script(&mut engine, "9\n");
        assert!(out.contains("Invalid choice. Please try again."));
        assert!(out.contains("Non-interactive mode detected. Exiting..."));
    }
}
