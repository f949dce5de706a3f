//! Orchestration over one [`PluginManager`]: single calls, passthrough sessions,
//! batches, judge-driven autonomous tests and the call history.

use crate::judge::{Assessment, Judge, JudgeError, JudgeOutcome, Turn};
use crate::manager::{FailedPlugin, LoadSummary, ManagerError, ManagerOptions, PluginManager, PluginSummary};
use crate::manifest::{Manifest, ManifestError};
use crate::plugin::{
    lock, Arguments, CallOptions, NoopObserver, Plugin, PluginObserver, PluginOptions, PluginResponse,
};
use crate::protocol::ContextMessage;
use crate::validator::{ValidationReport, Validator, ValidatorConfig};
use crate::watcher::{PluginChange, PluginWatcher};
use chrono::{DateTime, Local};
use plugbench_core::EngineSettings;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_FOLLOW_UP: &str = "Can you provide more details?";

/// How the engine is being driven. Only the interactive menu hot-reloads plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineMode {
    #[default]
    Interactive,
    OneShot,
    Passthrough,
    Autonomous,
    Batch,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub plugins_dir: PathBuf,
    pub mode: EngineMode,
    /// Per-call timeout for execute and input.
    pub timeout: Duration,
    pub watch_plugins: bool,
    pub watch_interval: Duration,
    pub watch_debounce: Duration,
    /// Turn budget for autonomous tests, the first call included.
    pub max_turns: u32,
    pub mcp_grace: Duration,
}

impl EngineConfig {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self::from_settings(plugins_dir, &EngineSettings::default())
    }

    pub fn from_settings(plugins_dir: impl Into<PathBuf>, settings: &EngineSettings) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            mode: EngineMode::default(),
            timeout: Duration::from_millis(settings.timeout_ms),
            watch_plugins: settings.watch_plugins,
            watch_interval: Duration::from_millis(settings.watch_interval_ms),
            watch_debounce: Duration::from_millis(settings.watch_debounce_ms),
            max_turns: settings.max_turns.max(1),
            mcp_grace: Duration::from_millis(settings.mcp_grace_ms),
        }
    }

    /// The watcher only runs for the interactive menu, and only when enabled.
    pub fn watches_plugins(&self) -> bool {
        self.watch_plugins && self.mode == EngineMode::Interactive
    }

    fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            plugin: PluginOptions::default(),
            mcp_grace: self.mcp_grace,
            call_timeout: self.timeout,
        }
    }
}

pub(crate) fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub plugin_name: String,
    pub function_name: String,
    pub arguments: Arguments,
    pub response: String,
    pub error: Option<String>,
    #[serde(rename = "execution_time_ms", serialize_with = "serialize_millis")]
    pub execution_time: Duration,
    pub awaiting_input: bool,
    pub timestamp: DateTime<Local>,
}

impl ExecutionResult {
    fn from_response(
        plugin_name: &str,
        function_name: &str,
        arguments: Arguments,
        response: &PluginResponse,
        execution_time: Duration,
    ) -> Self {
        Self {
            success: response.success,
            plugin_name: plugin_name.to_string(),
            function_name: function_name.to_string(),
            arguments,
            response: response.message.clone(),
            error: (!response.success).then(|| response.message.clone()),
            execution_time,
            awaiting_input: response.awaiting_input,
            timestamp: Local::now(),
        }
    }

    fn rejected(plugin_name: &str, function_name: &str, arguments: Arguments, error: impl Into<String>) -> Self {
        Self {
            success: false,
            plugin_name: plugin_name.to_string(),
            function_name: function_name.to_string(),
            arguments,
            response: String::new(),
            error: Some(error.into()),
            execution_time: Duration::ZERO,
            awaiting_input: false,
            timestamp: Local::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutonomousTestResult {
    pub plugin_name: String,
    pub function_name: String,
    pub test_prompt: String,
    pub expected_behavior: String,
    pub actual_response: String,
    pub passed: bool,
    pub reasoning: String,
    pub confidence: f64,
    pub turns_used: u32,
    #[serde(rename = "execution_time_ms", serialize_with = "serialize_millis")]
    pub execution_time: Duration,
}

/// One entry of an autonomous test file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub expectation: String,
    #[serde(default)]
    pub arguments: Arguments,
}

impl TestCase {
    pub fn parse_file(path: &Path) -> Result<Vec<Self>, EngineError> {
        let raw = read_json(path)?;
        serde_json::from_value(raw).map_err(|err| EngineError::InvalidFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }
}

/// One entry of a batch: `function` (or `name`) plus `arguments` (or `params`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchCommand {
    pub function: String,
    pub arguments: Arguments,
}

impl BatchCommand {
    pub fn new(function: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            function: function.into(),
            arguments,
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let function = value
            .get("function")
            .or_else(|| value.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = value
            .get("arguments")
            .or_else(|| value.get("params"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self { function, arguments }
    }

    pub fn parse_file(path: &Path) -> Result<Vec<Self>, EngineError> {
        match read_json(path)? {
            Value::Array(entries) => Ok(entries.iter().map(Self::from_value).collect()),
            _ => Err(EngineError::InvalidFile {
                path: path.to_path_buf(),
                reason: "expected a JSON array of commands".to_string(),
            }),
        }
    }
}

fn read_json(path: &Path) -> Result<Value, EngineError> {
    let content = fs::read_to_string(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|err| EngineError::InvalidFile {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("no judge configured for autonomous testing")]
    NoJudge,
    #[error(transparent)]
    Judge(#[from] JudgeError),
    #[error("Plugin not found: {0}")]
    UnknownPlugin(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid file {path}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },
    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How a passthrough session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughExit {
    NotActive,
    Clean,
    Forced,
}

type StreamCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Forwards streamed chunks from every plugin to an optional callback.
#[derive(Default)]
struct StreamRelay {
    callback: Mutex<Option<StreamCallback>>,
}

impl PluginObserver for StreamRelay {
    fn on_stream(&self, plugin: &str, chunk: &str) {
        if let Some(callback) = lock(&self.callback).as_ref() {
            callback(plugin, chunk);
        }
    }

    fn on_complete(&self, plugin: &str, success: bool, _text: &str) {
        debug!(plugin, success, "plugin turn complete");
    }
}

pub struct PluginEngine {
    config: EngineConfig,
    manager: PluginManager,
    relay: Arc<StreamRelay>,
    judge: Option<Arc<dyn Judge>>,
    passthrough: Option<String>,
    history: Vec<ExecutionResult>,
    watcher: Option<PluginWatcher>,
    pending_changes: Arc<Mutex<Vec<PluginChange>>>,
}

impl PluginEngine {
    pub fn new(config: EngineConfig) -> Self {
        let relay = Arc::new(StreamRelay::default());
        let manager = PluginManager::with_observer(
            config.plugins_dir.clone(),
            config.manager_options(),
            relay.clone(),
        );
        Self {
            config,
            manager,
            relay,
            judge: None,
            passthrough: None,
            history: Vec::new(),
            watcher: None,
            pending_changes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Load plugins and, in interactive mode with watching enabled, start watching the
    /// plugins directory.
    pub fn initialize(&mut self) -> Result<LoadSummary, EngineError> {
        let summary = self.manager.load()?;
        info!(
            loaded = summary.loaded,
            failed = summary.failed,
            functions = summary.functions,
            "engine initialized"
        );
        if self.config.watches_plugins() {
            self.start_watcher();
        } else {
            debug!(mode = ?self.config.mode, "plugin watcher disabled");
        }
        Ok(summary)
    }

    fn start_watcher(&mut self) {
        let mut watcher = PluginWatcher::new(&self.config.plugins_dir, self.config.watch_interval)
            .with_debounce(self.config.watch_debounce);
        let pending = Arc::clone(&self.pending_changes);
        let started = watcher.start(Box::new(move |changes| {
            for change in &changes {
                info!(plugin = %change.plugin_name, kind = %change.kind, "plugin change detected");
            }
            lock(&pending).extend(changes);
        }));
        match started {
            Ok(()) => self.watcher = Some(watcher),
            Err(err) => warn!(error = %err, "plugin watcher not started"),
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Drain the changes seen by the watcher since the last call.
    pub fn take_plugin_changes(&self) -> Vec<PluginChange> {
        std::mem::take(&mut *lock(&self.pending_changes))
    }

    pub fn has_pending_changes(&self) -> bool {
        !lock(&self.pending_changes).is_empty()
    }

    /// Close any session, re-scan the plugins directory and restart persistent plugins.
    pub fn reload(&mut self) -> Result<LoadSummary, EngineError> {
        self.exit_passthrough();
        let summary = self.manager.reload()?;
        lock(&self.pending_changes).clear();
        if let Some(watcher) = &self.watcher {
            watcher.force_rescan();
        }
        Ok(summary)
    }

    pub fn shutdown(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.passthrough = None;
        self.manager.shutdown();
        info!("engine shut down");
    }

    pub fn set_stream_callback(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) {
        *lock(&self.relay.callback) = Some(Box::new(callback));
    }

    pub fn list_plugins(&self) -> Vec<PluginSummary> {
        self.manager.plugin_summaries()
    }

    pub fn failed_plugins(&self) -> Vec<FailedPlugin> {
        self.manager.failed_plugins()
    }

    pub fn list_functions(&self, plugin_name: Option<&str>) -> Vec<Value> {
        self.manager.function_definitions(plugin_name)
    }

    pub fn tool_catalog(&self) -> Vec<Value> {
        self.manager.tool_catalog()
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.manager.plugin(name)
    }

    fn call_options(&self, context: Option<Vec<ContextMessage>>) -> CallOptions {
        CallOptions {
            context,
            timeout: self.config.timeout,
            ..CallOptions::default()
        }
    }

    /// Route a call by function name. A session left open on another plugin is closed
    /// first; a call that leaves its plugin awaiting input opens one.
    pub fn execute(
        &mut self,
        function: &str,
        arguments: Arguments,
        context: Option<Vec<ContextMessage>>,
    ) -> ExecutionResult {
        let owner = self.manager.plugin_for_function(function);
        let switching = matches!(
            (&self.passthrough, &owner),
            (Some(open), Some(target)) if open != target
        );
        if switching {
            self.exit_passthrough();
        }

        let options = self.call_options(context);
        let started = Instant::now();
        let response = self.manager.execute(function, arguments.clone(), &options);
        let plugin_name = owner.unwrap_or_else(|| "unknown".to_string());
        let result =
            ExecutionResult::from_response(&plugin_name, function, arguments, &response, started.elapsed());
        self.track_session(&result);
        self.history.push(result.clone());
        result
    }

    /// Call a function on a named plugin, skipping routing, and keep the session if the
    /// plugin asks for more input.
    pub fn execute_passthrough(&mut self, plugin_name: &str, function: &str, arguments: Arguments) -> ExecutionResult {
        if !self.manager.plugin_exists(plugin_name) {
            return ExecutionResult::rejected(
                plugin_name,
                function,
                arguments,
                format!("Plugin not found: {plugin_name}"),
            );
        }
        if self.passthrough.as_deref().is_some_and(|open| open != plugin_name) {
            self.exit_passthrough();
        }

        let options = self.call_options(None);
        let started = Instant::now();
        let response = self
            .manager
            .execute_direct(plugin_name, function, arguments.clone(), &options);
        let result =
            ExecutionResult::from_response(plugin_name, function, arguments, &response, started.elapsed());
        self.track_session(&result);
        if result.awaiting_input {
            info!(plugin = %plugin_name, "entered passthrough mode");
        }
        self.history.push(result.clone());
        result
    }

    fn track_session(&mut self, result: &ExecutionResult) {
        self.passthrough = result.awaiting_input.then(|| result.plugin_name.clone());
    }

    /// Forward user text to the plugin holding the open session.
    pub fn send_input(&mut self, content: &str) -> ExecutionResult {
        let mut arguments = Arguments::new();
        arguments.insert("content".to_string(), Value::from(content));
        let Some(plugin_name) = self.passthrough.clone() else {
            return ExecutionResult::rejected("", "input", arguments, "No plugin in passthrough mode");
        };

        let started = Instant::now();
        let response = self.manager.send_input(&plugin_name, content);
        let result =
            ExecutionResult::from_response(&plugin_name, "input", arguments, &response, started.elapsed());
        if !result.awaiting_input {
            self.passthrough = None;
            info!(plugin = %plugin_name, "exited passthrough mode");
        }
        self.history.push(result.clone());
        result
    }

    /// Leave the open session: ask politely with "exit", then stop the process if the
    /// plugin still holds on.
    pub fn exit_passthrough(&mut self) -> PassthroughExit {
        let Some(plugin_name) = self.passthrough.clone() else {
            return PassthroughExit::NotActive;
        };

        let result = self.send_input("exit");
        self.passthrough = None;
        if result.success && !result.awaiting_input {
            return PassthroughExit::Clean;
        }

        warn!(plugin = %plugin_name, "plugin kept its session open, stopping it");
        if let Some(plugin) = self.manager.plugin(&plugin_name) {
            plugin.stop();
        }
        PassthroughExit::Forced
    }

    pub fn is_in_passthrough(&self) -> bool {
        self.passthrough.is_some()
    }

    pub fn passthrough_plugin(&self) -> Option<&str> {
        self.passthrough.as_deref()
    }

    /// Run commands in order. An entry without a function name is recorded and skipped;
    /// any other failure ends the batch.
    pub fn execute_batch(&mut self, commands: &[BatchCommand]) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            if command.function.is_empty() {
                results.push(ExecutionResult::rejected(
                    "",
                    "",
                    command.arguments.clone(),
                    "Missing function name",
                ));
                continue;
            }

            let result = self.execute(&command.function, command.arguments.clone(), None);
            let failed = !result.success;
            if failed {
                warn!(
                    function = %command.function,
                    error = result.error.as_deref().unwrap_or_default(),
                    "batch stopped"
                );
            }
            results.push(result);
            if failed {
                break;
            }
        }
        results
    }

    /// Execute once, then let the judge decide; follow-up prompts are sent only while a
    /// passthrough session is open.
    pub fn test_function_autonomous(&mut self, case: &TestCase) -> Result<AutonomousTestResult, EngineError> {
        let judge = self.judge.clone().ok_or(EngineError::NoJudge)?;
        let max_turns = self.config.max_turns;
        let started = Instant::now();

        let first = self.execute(&case.function, case.arguments.clone(), None);
        let mut turns_used = 1;
        let mut current = first.response.clone();
        let mut history = vec![Turn {
            user: case.prompt.clone(),
            assistant: current.clone(),
        }];

        let mut verdict = judge.assess(&Assessment {
            prompt: &case.prompt,
            response: &current,
            expectation: &case.expectation,
            history: &[],
            remaining_turns: max_turns.saturating_sub(turns_used),
        })?;

        while verdict.outcome == JudgeOutcome::FollowUp && turns_used < max_turns {
            if !self.is_in_passthrough() {
                break;
            }
            let prompt = verdict
                .follow_up_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_FOLLOW_UP.to_string());
            current = self.send_input(&prompt).response;
            turns_used += 1;
            history.push(Turn {
                user: prompt.clone(),
                assistant: current.clone(),
            });

            verdict = judge.assess(&Assessment {
                prompt: &prompt,
                response: &current,
                expectation: &case.expectation,
                history: &history[..history.len() - 1],
                remaining_turns: max_turns.saturating_sub(turns_used),
            })?;
        }

        if self.is_in_passthrough() {
            self.exit_passthrough();
        }

        Ok(AutonomousTestResult {
            plugin_name: first.plugin_name,
            function_name: case.function.clone(),
            test_prompt: case.prompt.clone(),
            expected_behavior: case.expectation.clone(),
            actual_response: current,
            passed: verdict.passed(),
            reasoning: verdict.reasoning,
            confidence: verdict.confidence,
            turns_used,
            execution_time: started.elapsed(),
        })
    }

    /// Run every case whose function belongs to `plugin_name`.
    pub fn test_plugin_autonomous(
        &mut self,
        plugin_name: &str,
        cases: &[TestCase],
    ) -> Result<Vec<AutonomousTestResult>, EngineError> {
        let mut results = Vec::new();
        for case in cases {
            if case.function.is_empty() {
                continue;
            }
            if self.manager.plugin_for_function(&case.function).as_deref() != Some(plugin_name) {
                warn!(plugin = %plugin_name, function = %case.function, "skipping case for a function the plugin does not provide");
                continue;
            }

            info!(plugin = %plugin_name, function = %case.function, "running autonomous test");
            let result = self.test_function_autonomous(case)?;
            info!(
                plugin = %plugin_name,
                function = %case.function,
                passed = result.passed,
                turns = result.turns_used,
                "autonomous test finished"
            );
            results.push(result);
        }
        Ok(results)
    }

    /// Score a plugin against a fresh process, leaving the managed instance alone.
    pub fn validate_plugin(&self, plugin_name: &str, config: ValidatorConfig) -> Result<ValidationReport, EngineError> {
        let manifest = match self.manager.plugin(plugin_name) {
            Some(plugin) => (*plugin.manifest()).clone(),
            None => {
                let dir = self.config.plugins_dir.join(plugin_name);
                if !dir.join(crate::manifest::MANIFEST_FILE).is_file() {
                    return Err(EngineError::UnknownPlugin(plugin_name.to_string()));
                }
                Manifest::load(&dir)?
            }
        };

        let plugin = Plugin::new(
            manifest,
            self.manager.options().plugin.clone(),
            Arc::new(NoopObserver),
        );
        let report = Validator::new(config).run(&plugin);
        plugin.stop();
        Ok(report)
    }

    pub fn history(&self) -> &[ExecutionResult] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn export_history(&self, path: &Path) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(&self.history)?;
        fs::write(path, content).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), entries = self.history.len(), "history exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::Verdict;
    use serde_json::json;
    use tempfile::TempDir;

    fn engine_with_plugin() -> (TempDir, PluginEngine) {
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
                "functions": [{
                    "name": "echo",
                    "description": "Echo text back",
                    "parameters": {
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
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

    struct ScriptedJudge(JudgeOutcome);

    impl Judge for ScriptedJudge {
        fn assess(&self, assessment: &Assessment<'_>) -> Result<Verdict, JudgeError> {
            Ok(Verdict {
                outcome: self.0,
                reasoning: format!("saw {:?}", assessment.response),
                confidence: 0.5,
                follow_up_prompt: None,
            })
        }
    }

    #[test]
    fn config_from_settings_uses_millis() {
        let settings = EngineSettings {
            timeout_ms: 1_500,
            max_turns: 0,
            ..EngineSettings::default()
        };
        let config = EngineConfig::from_settings("/tmp/plugins", &settings);
        assert_eq!(config.timeout, Duration::from_millis(1_500));
        assert_eq!(config.max_turns, 1);
        assert_eq!(config.mode, EngineMode::Interactive);
    }

    #[test]
    fn only_interactive_mode_watches_plugins() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::new(dir.path());
        config.watch_plugins = true;
        config.watch_interval = Duration::from_millis(20);

        config.mode = EngineMode::Batch;
        assert!(!config.watches_plugins());
        let mut engine = PluginEngine::new(config.clone());
        engine.initialize().unwrap();
        assert!(!engine.is_watching());
        engine.shutdown();

        config.mode = EngineMode::Interactive;
        let mut engine = PluginEngine::new(config);
        engine.initialize().unwrap();
        assert!(engine.is_watching());
        engine.shutdown();
        assert!(!engine.is_watching());
    }

    #[test]
    fn batch_command_accepts_aliases() {
        let command = BatchCommand::from_value(&json!({"name": "echo", "params": {"text": "hi"}}));
        assert_eq!(command.function, "echo");
        assert_eq!(command.arguments.get("text"), Some(&json!("hi")));

        let empty = BatchCommand::from_value(&json!({"arguments": 3}));
        assert!(empty.function.is_empty());
        assert!(empty.arguments.is_empty());
    }

    #[test]
    fn batch_skips_unnamed_and_stops_on_failure() {
        let (_dir, mut engine) = engine_with_plugin();
        let commands = vec![
            BatchCommand::default(),
            BatchCommand::new("nope", Arguments::new()),
            BatchCommand::new("echo", Arguments::new()),
        ];
        let results = engine.execute_batch(&commands);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error.as_deref(), Some("Missing function name"));
        assert_eq!(results[1].error.as_deref(), Some("Unknown function: nope"));
        assert_eq!(results[1].plugin_name, "unknown");
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn missing_parameter_is_recorded_without_a_session() {
        let (_dir, mut engine) = engine_with_plugin();
        let result = engine.execute("echo", Arguments::new(), None);
        assert!(!result.success);
        assert_eq!(result.plugin_name, "tools");
        assert_eq!(result.error.as_deref(), Some("Missing required parameter: text"));
        assert!(!engine.is_in_passthrough());
    }

    #[test]
    fn input_without_session_is_rejected() {
        let (_dir, mut engine) = engine_with_plugin();
        let result = engine.send_input("hello");
        assert_eq!(result.error.as_deref(), Some("No plugin in passthrough mode"));
        assert_eq!(engine.exit_passthrough(), PassthroughExit::NotActive);
        assert!(engine.history().is_empty());
    }

    #[test]
    fn passthrough_to_unknown_plugin_fails() {
        let (_dir, mut engine) = engine_with_plugin();
        let result = engine.execute_passthrough("ghost", "echo", Arguments::new());
        assert_eq!(result.error.as_deref(), Some("Plugin not found: ghost"));
    }

    #[test]
    fn autonomous_needs_a_judge() {
        let (_dir, mut engine) = engine_with_plugin();
        let case = TestCase {
            function: "echo".into(),
            ..TestCase::default()
        };
        assert!(matches!(engine.test_function_autonomous(&case), Err(EngineError::NoJudge)));
    }

    #[test]
    fn autonomous_reports_the_judge_verdict() {
        let (_dir, engine) = engine_with_plugin();
        let mut engine = engine.with_judge(Arc::new(ScriptedJudge(JudgeOutcome::Failure)));
        let case = TestCase {
            function: "nope".into(),
            prompt: "do the thing".into(),
            expectation: "it works".into(),
            arguments: Arguments::new(),
        };
        let result = engine.test_function_autonomous(&case).unwrap();
        assert!(!result.passed);
        assert_eq!(result.turns_used, 1);
        assert_eq!(result.reasoning, "saw \"Unknown function: nope\"");

        let skipped = engine.test_plugin_autonomous("tools", &[case]).unwrap();
        assert!(skipped.is_empty());
    }

    #[test]
    fn history_exports_as_json_array() {
        let (dir, mut engine) = engine_with_plugin();
        engine.execute("nope", Arguments::new(), None);
        let path = dir.path().join("history.json");
        engine.export_history(&path).unwrap();

        let exported: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(exported[0]["function_name"], "nope");
        assert_eq!(exported[0]["success"], false);
        assert!(exported[0]["execution_time_ms"].is_number());

        engine.clear_history();
        assert!(engine.history().is_empty());
    }

    #[test]
    fn test_cases_parse_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cases.json");
        fs::write(
            &path,
            r#"[{"function": "echo", "prompt": "say hi", "expectation": "says hi", "arguments": {"text": "hi"}}]"#,
        )
        .unwrap();
        let cases = TestCase::parse_file(&path).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].arguments.get("text"), Some(&json!("hi")));

        fs::write(&path, "{}").unwrap();
        assert!(matches!(BatchCommand::parse_file(&path), Err(EngineError::InvalidFile { .. })));
    }

    #[test]
    fn validating_unknown_plugin_is_an_error() {
        let (_dir, engine) = engine_with_plugin();
        assert!(matches!(
            engine.validate_plugin("ghost", ValidatorConfig::default()),
            Err(EngineError::UnknownPlugin(_))
        ));
    }
}
