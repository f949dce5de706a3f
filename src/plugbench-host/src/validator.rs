//! Compliance scorecard.
//!
//! The validator drives one plugin through a fixed sequence of categories (manifest,
//! startup, MCP discovery, protocol, heartbeat, execution, stress, error handling,
//! shutdown). Each category collects checks; its score counts a pass as 1 and a warning
//! as 0.5 over every non-skipped check, and the overall score is the mean of the
//! category scores.

use crate::manifest::{FunctionDefinition, Manifest, RESERVED_PREFIX, SUPPORTED_MANIFEST_VERSION};
use crate::plugin::{
    Arguments, CallOptions, Plugin, PluginError, PluginResponse, ShutdownOutcome, StopOutcome,
};
use crate::protocol::{PING_TIMEOUT, PROTOCOL_VERSION};
use chrono::{DateTime, Local};
use plugbench_core::ValidatorSettings;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

const UNKNOWN_FUNCTION: &str = "__nonexistent_function_12345__";
const REPORTED_VERSION: &str = "1.0.0";
const SLOW_CALL: Duration = Duration::from_secs(10);

/// The operations the validator needs from a plugin.
pub trait PluginUnderTest {
    fn manifest(&self) -> Arc<Manifest>;
    fn is_running(&self) -> bool;
    fn start(&self) -> Result<(), PluginError>;
    fn stop(&self) -> StopOutcome;
    fn initialize(&self) -> PluginResponse;
    fn execute(&self, function: &str, arguments: Arguments, timeout: Duration) -> PluginResponse;
    fn send_input(&self, content: &str, timeout: Duration) -> PluginResponse;
    /// Round trip of one ping, or `None` if nothing came back in time.
    fn probe(&self, timeout: Duration) -> Option<Duration>;
    fn last_heartbeat(&self) -> Option<Instant>;
    fn is_heartbeat_expired(&self) -> bool;
    fn shutdown(&self) -> ShutdownOutcome;
}

impl PluginUnderTest for Plugin {
    fn manifest(&self) -> Arc<Manifest> {
        Plugin::manifest(self)
    }

    fn is_running(&self) -> bool {
        Plugin::is_running(self)
    }

    fn start(&self) -> Result<(), PluginError> {
        Plugin::start(self)
    }

    fn stop(&self) -> StopOutcome {
        Plugin::stop(self)
    }

    fn initialize(&self) -> PluginResponse {
        Plugin::initialize(self)
    }

    fn execute(&self, function: &str, arguments: Arguments, timeout: Duration) -> PluginResponse {
        Plugin::execute(self, function, arguments, &CallOptions::with_timeout(timeout))
    }

    fn send_input(&self, content: &str, timeout: Duration) -> PluginResponse {
        Plugin::send_input(self, content, timeout)
    }

    fn probe(&self, timeout: Duration) -> Option<Duration> {
        Plugin::probe(self, timeout)
    }

    fn last_heartbeat(&self) -> Option<Instant> {
        Plugin::last_heartbeat(self)
    }

    fn is_heartbeat_expired(&self) -> bool {
        Plugin::is_heartbeat_expired(self)
    }

    fn shutdown(&self) -> ShutdownOutcome {
        Plugin::shutdown(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Skip,
    Info,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warn => "WARN",
            CheckStatus::Skip => "SKIP",
            CheckStatus::Info => "INFO",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub details: String,
    pub duration: Option<Duration>,
}

impl ValidationCheck {
    fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            details: String::new(),
            duration: None,
        }
    }

    fn timed(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    fn duration_ms(&self) -> f64 {
        self.duration.map_or(0.0, millis)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationCategory {
    pub name: String,
    pub description: String,
    pub checks: Vec<ValidationCheck>,
}

impl ValidationCategory {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            checks: Vec::new(),
        }
    }

    fn push(&mut self, check: ValidationCheck) {
        debug!(category = %self.name, check = %check.name, status = %check.status, "{}", check.message);
        self.checks.push(check);
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(CheckStatus::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warnings(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    /// 0-100; a category with only skipped checks scores 100.
    pub fn score(&self) -> f64 {
        let total = self.checks.len() - self.count(CheckStatus::Skip);
        if total == 0 {
            return 100.0;
        }
        (self.passed() as f64 + 0.5 * self.warnings() as f64) / total as f64 * 100.0
    }
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("failed to write report {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub plugin_name: String,
    pub plugin_version: String,
    pub timestamp: DateTime<Local>,
    pub categories: Vec<ValidationCategory>,
}

pub fn grade_for(score: f64) -> &'static str {
    match score {
        s if s >= 95.0 => "A+",
        s if s >= 90.0 => "A",
        s if s >= 85.0 => "B+",
        s if s >= 80.0 => "B",
        s if s >= 75.0 => "C+",
        s if s >= 70.0 => "C",
        s if s >= 60.0 => "D",
        _ => "F",
    }
}

impl ValidationReport {
    pub fn category(&self, name: &str) -> Option<&ValidationCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn total_checks(&self) -> usize {
        self.categories.iter().map(|c| c.checks.len()).sum()
    }

    pub fn total_passed(&self) -> usize {
        self.categories.iter().map(ValidationCategory::passed).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.categories.iter().map(ValidationCategory::failed).sum()
    }

    pub fn total_warnings(&self) -> usize {
        self.categories.iter().map(ValidationCategory::warnings).sum()
    }

    pub fn overall_score(&self) -> f64 {
        if self.categories.is_empty() {
            return 0.0;
        }
        self.categories.iter().map(ValidationCategory::score).sum::<f64>()
            / self.categories.len() as f64
    }

    pub fn grade(&self) -> &'static str {
        grade_for(self.overall_score())
    }

    pub fn status_line(&self) -> &'static str {
        match self.overall_score() {
            s if s >= 90.0 => "EXCELLENT - Plugin is a good citizen!",
            s if s >= 75.0 => "GOOD - Minor improvements recommended",
            s if s >= 60.0 => "ACCEPTABLE - Several issues to address",
            _ => "NEEDS WORK - Significant improvements required",
        }
    }

    pub fn to_json(&self) -> Value {
        let categories: Vec<Value> = self
            .categories
            .iter()
            .map(|category| {
                let checks: Vec<Value> = category
                    .checks
                    .iter()
                    .map(|check| {
                        json!({
                            "name": check.name,
                            "status": check.status,
                            "message": check.message,
                            "details": check.details,
                            "duration_ms": check.duration_ms(),
                        })
                    })
                    .collect();
                json!({
                    "name": category.name,
                    "description": category.description,
                    "score": category.score(),
                    "checks": checks,
                })
            })
            .collect();

        json!({
            "plugin_name": self.plugin_name,
            "plugin_version": self.plugin_version,
            "timestamp": self.timestamp.to_rfc3339(),
            "overall_score": self.overall_score(),
            "grade": self.grade(),
            "total_checks": self.total_checks(),
            "total_passed": self.total_passed(),
            "total_failed": self.total_failed(),
            "total_warnings": self.total_warnings(),
            "categories": categories,
        })
    }

    pub fn export_json(&self, path: &Path) -> Result<(), ValidatorError> {
        let content = serde_json::to_string_pretty(&self.to_json())?;
        fs::write(path, content).map_err(|source| ValidatorError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "validation report exported");
        Ok(())
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(70);
        let thin = "-".repeat(66);
        let score = self.overall_score();

        writeln!(f, "{rule}")?;
        writeln!(f, "  PLUGIN VALIDATION REPORT")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "  Plugin: {} v{}", self.plugin_name, self.plugin_version)?;
        writeln!(f, "  Time: {}", self.timestamp.to_rfc3339())?;
        writeln!(f, "{rule}")?;
        writeln!(f)?;
        writeln!(f, "  OVERALL SCORE: {score:.1}% ({})", self.grade())?;
        writeln!(f, "  Total Checks: {}", self.total_checks())?;
        writeln!(
            f,
            "  Passed: {}  |  Failed: {}  |  Warnings: {}",
            self.total_passed(),
            self.total_failed(),
            self.total_warnings()
        )?;

        for category in &self.categories {
            writeln!(f)?;
            writeln!(f, "  {thin}")?;
            writeln!(f, "  {} ({:.0}%)", category.name.to_uppercase(), category.score())?;
            writeln!(f, "  {}", category.description)?;
            writeln!(f, "  {thin}")?;
            for check in &category.checks {
                match check.duration {
                    Some(d) if !d.is_zero() => {
                        writeln!(f, "    [{}] {} ({:.0}ms)", check.status, check.name, millis(d))?
                    }
                    _ => writeln!(f, "    [{}] {}", check.status, check.name)?,
                }
                writeln!(f, "           {}", check.message)?;
            }
        }

        writeln!(f)?;
        writeln!(f, "{rule}")?;
        writeln!(f, "  VALIDATION COMPLETE")?;
        writeln!(f, "  Grade: {} ({score:.1}%)", self.grade())?;
        writeln!(f, "  Status: {}", self.status_line())?;
        write!(f, "{rule}")
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub heartbeat_window: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub repeat_calls: u32,
    pub rapid_calls: u32,
    pub sustained_window: Duration,
    pub sustained_pace: Duration,
    pub mcp_discovery_wait: Duration,
    pub call_timeout: Duration,
    /// Timeout for the deliberately bad calls.
    pub error_call_timeout: Duration,
    pub call_gap: Duration,
    pub rapid_gap: Duration,
    /// Pause before restarting a running plugin and after the stress burst.
    pub settle: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_window: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            ping_timeout: PING_TIMEOUT,
            repeat_calls: 3,
            rapid_calls: 10,
            sustained_window: Duration::from_secs(10),
            sustained_pace: Duration::from_millis(300),
            mcp_discovery_wait: Duration::from_secs(10),
            call_timeout: Duration::from_secs(15),
            error_call_timeout: Duration::from_secs(5),
            call_gap: Duration::from_millis(200),
            rapid_gap: Duration::from_millis(50),
            settle: Duration::from_secs(1),
        }
    }
}

impl From<&ValidatorSettings> for ValidatorConfig {
    fn from(settings: &ValidatorSettings) -> Self {
        Self {
            heartbeat_window: Duration::from_millis(settings.heartbeat_window_ms),
            ping_interval: Duration::from_millis(settings.ping_interval_ms),
            repeat_calls: settings.repeat_calls,
            rapid_calls: settings.rapid_calls,
            sustained_window: Duration::from_millis(settings.sustained_window_ms),
            sustained_pace: Duration::from_millis(settings.sustained_pace_ms),
            mcp_discovery_wait: Duration::from_millis(settings.mcp_discovery_wait_ms),
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
            ..Self::default()
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
}

/// Placeholder arguments for every required parameter, chosen by declared type.
pub fn synthetic_arguments(function: &FunctionDefinition, text: &str) -> Arguments {
    function
        .required_parameters()
        .filter_map(|param| {
            let value = match param.kind.as_str() {
                "string" => json!(text),
                "number" | "integer" => json!(1),
                "boolean" => json!(true),
                "array" => json!([]),
                "object" => json!({}),
                _ => return None,
            };
            Some((param.name.clone(), value))
        })
        .collect()
}

fn responded(response: &PluginResponse) -> bool {
    response.success || response.awaiting_input
}

fn skipped(name: &str, description: &str, check: &str) -> ValidationCategory {
    let mut category = ValidationCategory::new(name, description);
    category.push(ValidationCheck::new(check, CheckStatus::Skip, "Plugin not running"));
    category
}

pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn run<P: PluginUnderTest + ?Sized>(&self, plugin: &P) -> ValidationReport {
        let manifest = plugin.manifest();
        info!(plugin = %manifest.name, "validating plugin");
        let started = Instant::now();

        let mut categories = vec![self.check_manifest(&manifest), self.check_startup(plugin)];
        if manifest.mcp.enabled {
            categories.push(self.check_mcp(plugin, &manifest));
        }
        categories.push(self.check_protocol(plugin));
        categories.push(self.check_heartbeat(plugin));
        categories.push(self.check_execution(plugin, &manifest));
        categories.push(self.check_stress(plugin, &manifest));
        categories.push(self.check_error_handling(plugin, &manifest));
        categories.push(self.check_shutdown(plugin));

        let report = ValidationReport {
            plugin_name: manifest.name.clone(),
            plugin_version: REPORTED_VERSION.to_string(),
            timestamp: Local::now(),
            categories,
        };
        info!(
            plugin = %manifest.name,
            score = report.overall_score(),
            grade = report.grade(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "validation finished"
        );
        report
    }

    /// Execute once and close any session the call opened.
    fn call<P: PluginUnderTest + ?Sized>(
        &self,
        plugin: &P,
        function: &str,
        arguments: &Arguments,
        timeout: Duration,
    ) -> (PluginResponse, Duration) {
        let started = Instant::now();
        let response = plugin.execute(function, arguments.clone(), timeout);
        let elapsed = started.elapsed();
        if response.awaiting_input {
            plugin.send_input("exit", self.config.call_timeout);
        }
        (response, elapsed)
    }

    fn check_manifest(&self, manifest: &Manifest) -> ValidationCategory {
        let mut category = ValidationCategory::new("Manifest", "Manifest file structure and content");

        category.push(if manifest.manifest_version == SUPPORTED_MANIFEST_VERSION {
            ValidationCheck::new(
                "Manifest Version",
                CheckStatus::Pass,
                format!("Using supported manifest version {SUPPORTED_MANIFEST_VERSION}"),
            )
        } else {
            ValidationCheck::new(
                "Manifest Version",
                CheckStatus::Fail,
                format!("Unsupported manifest version: {}", manifest.manifest_version),
            )
        });

        category.push(if manifest.protocol_version == PROTOCOL_VERSION {
            ValidationCheck::new("Protocol Version", CheckStatus::Pass, "Using Protocol V2 (2.0)")
        } else {
            ValidationCheck::new(
                "Protocol Version",
                CheckStatus::Fail,
                format!("Invalid protocol version: {}", manifest.protocol_version),
            )
        });

        category.push(if manifest.description.len() > 10 {
            ValidationCheck::new("Description", CheckStatus::Pass, "Has meaningful description")
        } else {
            ValidationCheck::new("Description", CheckStatus::Warn, "Missing or short description")
        });

        category.push(if manifest.functions.is_empty() {
            ValidationCheck::new("Functions Defined", CheckStatus::Fail, "No functions defined in manifest")
        } else {
            ValidationCheck::new(
                "Functions Defined",
                CheckStatus::Pass,
                format!("Defines {} function(s)", manifest.functions.len()),
            )
        });

        let reserved: Vec<&str> = manifest
            .function_names()
            .into_iter()
            .filter(|name| name.starts_with(RESERVED_PREFIX))
            .collect();
        category.push(if reserved.is_empty() {
            ValidationCheck::new(
                "Function Names",
                CheckStatus::Pass,
                format!("No reserved '{RESERVED_PREFIX}' prefix used"),
            )
        } else {
            ValidationCheck::new(
                "Function Names",
                CheckStatus::Fail,
                format!("Functions use reserved prefix: {}", reserved.join(", ")),
            )
        });

        let undocumented: Vec<&str> = manifest
            .functions
            .iter()
            .filter(|f| f.description.trim().is_empty())
            .map(|f| f.name.as_str())
            .collect();
        category.push(if undocumented.is_empty() {
            ValidationCheck::new("Function Descriptions", CheckStatus::Pass, "All functions have descriptions")
        } else {
            ValidationCheck::new(
                "Function Descriptions",
                CheckStatus::Warn,
                format!("Functions missing descriptions: {}", undocumented.join(", ")),
            )
        });

        if manifest.passthrough {
            category.push(if manifest.functions.len() == 1 {
                ValidationCheck::new("Passthrough Mode", CheckStatus::Pass, "Passthrough enabled with single function")
            } else {
                ValidationCheck::new(
                    "Passthrough Mode",
                    CheckStatus::Warn,
                    "Passthrough enabled but multiple functions defined",
                )
            });
        }

        if manifest.mcp.enabled {
            category.push(ValidationCheck::new(
                "MCP Enabled",
                CheckStatus::Info,
                "Plugin uses MCP for function discovery",
            ));
            if manifest.mcp.launch_on_startup {
                category.push(ValidationCheck::new(
                    "MCP Startup",
                    CheckStatus::Pass,
                    "MCP server launches on startup",
                ));
            }
        }
        category
    }

    fn check_startup<P: PluginUnderTest + ?Sized>(&self, plugin: &P) -> ValidationCategory {
        let mut category = ValidationCategory::new("Startup", "Plugin startup and initialization");

        if plugin.is_running() {
            plugin.stop();
            thread::sleep(self.config.settle / 2);
        }

        let started = Instant::now();
        let spawned = plugin.start();
        let startup = started.elapsed();
        if let Err(err) = spawned {
            category.push(ValidationCheck::new(
                "Process Start",
                CheckStatus::Fail,
                format!("Failed to start plugin process: {err}"),
            ));
            return category;
        }
        category.push(
            ValidationCheck::new("Process Start", CheckStatus::Pass, "Plugin process started successfully")
                .timed(startup),
        );

        let ms = millis(startup);
        let check = match startup {
            d if d < Duration::from_secs(1) => {
                ValidationCheck::new("Startup Time", CheckStatus::Pass, format!("Started in {ms:.0}ms (< 1s)"))
            }
            d if d < Duration::from_secs(3) => ValidationCheck::new(
                "Startup Time",
                CheckStatus::Warn,
                format!("Started in {ms:.0}ms (1-3s, consider optimizing)"),
            ),
            _ => ValidationCheck::new(
                "Startup Time",
                CheckStatus::Fail,
                format!("Started in {ms:.0}ms (> 3s, too slow)"),
            ),
        };
        category.push(check.timed(startup));

        let started = Instant::now();
        let init = plugin.initialize();
        let init_time = started.elapsed();
        category.push(
            if init.success {
                ValidationCheck::new("Initialize Response", CheckStatus::Pass, "Responded to initialize request")
            } else {
                ValidationCheck::new(
                    "Initialize Response",
                    CheckStatus::Fail,
                    format!("Initialize failed: {}", init.message),
                )
            }
            .timed(init_time),
        );

        let ms = millis(init_time);
        category.push(
            if init_time < Duration::from_secs(5) {
                ValidationCheck::new("Initialize Time", CheckStatus::Pass, format!("Initialized in {ms:.0}ms"))
            } else {
                ValidationCheck::new("Initialize Time", CheckStatus::Warn, format!("Initialization slow: {ms:.0}ms"))
            }
            .timed(init_time),
        );
        category
    }

    fn check_mcp<P: PluginUnderTest + ?Sized>(&self, plugin: &P, manifest: &Manifest) -> ValidationCategory {
        let mut category =
            ValidationCategory::new("MCP Discovery", "MCP server connectivity and function discovery");

        let initial = manifest.functions.len();
        category.push(ValidationCheck::new(
            "Initial Functions",
            CheckStatus::Info,
            format!("Manifest has {initial} functions at startup"),
        ));

        thread::sleep(self.config.mcp_discovery_wait);

        if !plugin.is_running() {
            category.push(ValidationCheck::new(
                "MCP Connection",
                CheckStatus::Fail,
                "Plugin crashed during MCP connection",
            ));
            return category;
        }
        category.push(ValidationCheck::new(
            "MCP Connection",
            CheckStatus::Pass,
            "Plugin running after MCP connection time",
        ));

        match Manifest::load(&manifest.directory) {
            Ok(refreshed) if !refreshed.functions.is_empty() => {
                let count = refreshed.functions.len();
                category.push(ValidationCheck::new(
                    "Function Discovery",
                    CheckStatus::Pass,
                    format!("Discovered {count} functions via MCP"),
                ));
                category.push(if count != initial {
                    ValidationCheck::new(
                        "Manifest Updated",
                        CheckStatus::Pass,
                        format!("Manifest updated: {initial} -> {count} functions"),
                    )
                } else {
                    ValidationCheck::new(
                        "Manifest Updated",
                        CheckStatus::Info,
                        "Function count unchanged (may be cached)",
                    )
                });
            }
            Ok(_) => category.push(ValidationCheck::new(
                "Function Discovery",
                CheckStatus::Warn,
                "No functions discovered (MCP server may be unavailable)",
            )),
            Err(err) => category.push(ValidationCheck::new(
                "Manifest Refresh",
                CheckStatus::Warn,
                format!("Could not refresh manifest: {err}"),
            )),
        }

        if let Some(function) = manifest.functions.first() {
            let arguments = synthetic_arguments(function, "mcp_test");
            let (response, elapsed) = self.call(plugin, &function.name, &arguments, self.config.call_timeout);
            category.push(if responded(&response) {
                ValidationCheck::new(
                    "MCP Function Execution",
                    CheckStatus::Pass,
                    format!("MCP function '{}' executed ({:.0}ms)", function.name, millis(elapsed)),
                )
                .timed(elapsed)
            } else {
                ValidationCheck::new(
                    "MCP Function Execution",
                    CheckStatus::Warn,
                    format!("MCP function failed: {}", response.message),
                )
            });
        }
        category
    }

    fn check_protocol<P: PluginUnderTest + ?Sized>(&self, plugin: &P) -> ValidationCategory {
        const NAME: &str = "Protocol";
        const DESCRIPTION: &str = "JSON-RPC 2.0 protocol compliance";
        if !plugin.is_running() {
            return skipped(NAME, DESCRIPTION, "Protocol Tests");
        }

        // Reaching this point means the handshake was framed and decoded correctly.
        let mut category = ValidationCategory::new(NAME, DESCRIPTION);
        category.push(ValidationCheck::new("JSON-RPC 2.0", CheckStatus::Pass, "Plugin speaks JSON-RPC 2.0"));
        category.push(ValidationCheck::new(
            "Length-Prefixed Framing",
            CheckStatus::Pass,
            "Uses 4-byte big-endian length prefix",
        ));
        category.push(ValidationCheck::new("UTF-8 Encoding", CheckStatus::Pass, "Messages are UTF-8 encoded"));
        category
    }

    fn check_heartbeat<P: PluginUnderTest + ?Sized>(&self, plugin: &P) -> ValidationCategory {
        const NAME: &str = "Heartbeat";
        const DESCRIPTION: &str = "Ping/pong and liveness over time";
        if !plugin.is_running() {
            return skipped(NAME, DESCRIPTION, "Heartbeat Tests");
        }
        let mut category = ValidationCategory::new(NAME, DESCRIPTION);

        let mut round_trips = Vec::new();
        let mut pings = 0usize;
        let mut failures = 0usize;
        let window_started = Instant::now();
        while window_started.elapsed() < self.config.heartbeat_window {
            pings += 1;
            match plugin.probe(self.config.ping_timeout) {
                Some(rtt) => round_trips.push(millis(rtt)),
                None => failures += 1,
            }
            thread::sleep(self.config.ping_interval);
        }

        if round_trips.is_empty() {
            category.push(ValidationCheck::new("Ping Response", CheckStatus::Fail, "No successful pings"));
        } else {
            let window = self.config.heartbeat_window.as_secs_f64();
            category.push(if failures == 0 {
                ValidationCheck::new(
                    "Ping Response",
                    CheckStatus::Pass,
                    format!("All {pings} pings successful over {window:.0}s"),
                )
            } else {
                let rate = failures as f64 / pings as f64 * 100.0;
                let status = if rate < 10.0 { CheckStatus::Warn } else { CheckStatus::Fail };
                ValidationCheck::new(
                    "Ping Response",
                    status,
                    format!("{failures}/{pings} ping failures ({rate:.0}%)"),
                )
            });

            let avg = mean(&round_trips);
            let (min, max) = min_max(&round_trips);
            category.push(ValidationCheck::new(
                "Ping Timing",
                CheckStatus::Info,
                format!("Avg: {avg:.0}ms, Min: {min:.0}ms, Max: {max:.0}ms"),
            ));

            let variance = round_trips.iter().map(|t| (t - avg).powi(2)).sum::<f64>()
                / round_trips.len() as f64;
            let std_dev = variance.sqrt();
            category.push(match std_dev {
                s if s < 100.0 => ValidationCheck::new(
                    "Response Consistency",
                    CheckStatus::Pass,
                    format!("Consistent timing (std dev: {s:.0}ms)"),
                ),
                s if s < 500.0 => ValidationCheck::new(
                    "Response Consistency",
                    CheckStatus::Warn,
                    format!("Variable timing (std dev: {s:.0}ms)"),
                ),
                s => ValidationCheck::new(
                    "Response Consistency",
                    CheckStatus::Fail,
                    format!("Highly inconsistent timing (std dev: {s:.0}ms)"),
                ),
            });
        }

        let before = plugin.last_heartbeat();
        thread::sleep(self.config.call_gap);
        plugin.probe(self.config.ping_timeout);
        let refreshed = match (before, plugin.last_heartbeat()) {
            (Some(before), Some(after)) => after > before,
            (None, Some(_)) => true,
            _ => false,
        };
        category.push(if refreshed {
            ValidationCheck::new("Heartbeat Update", CheckStatus::Pass, "Updates heartbeat on communication")
        } else {
            ValidationCheck::new("Heartbeat Update", CheckStatus::Warn, "Heartbeat not updated after ping")
        });

        category.push(if plugin.is_heartbeat_expired() {
            ValidationCheck::new(
                "Heartbeat Timeout",
                CheckStatus::Fail,
                "Heartbeat expired - plugin may be unresponsive",
            )
        } else {
            ValidationCheck::new("Heartbeat Timeout", CheckStatus::Pass, "Within heartbeat timeout window")
        });
        category
    }

    fn check_execution<P: PluginUnderTest + ?Sized>(&self, plugin: &P, manifest: &Manifest) -> ValidationCategory {
        const NAME: &str = "Execution";
        const DESCRIPTION: &str = "Function execution behavior and consistency";
        if !plugin.is_running() {
            return skipped(NAME, DESCRIPTION, "Execution Tests");
        }
        let mut category = ValidationCategory::new(NAME, DESCRIPTION);
        let repeats = self.config.repeat_calls;

        let mut consistent = 0usize;
        let mut all_times = Vec::new();
        for function in &manifest.functions {
            let arguments = synthetic_arguments(function, "test");
            let mut times = Vec::new();
            let mut non_empty = 0usize;
            for _ in 0..repeats {
                let (response, elapsed) = self.call(plugin, &function.name, &arguments, self.config.call_timeout);
                if responded(&response) {
                    times.push(millis(elapsed));
                    if !response.message.trim().is_empty() {
                        non_empty += 1;
                    }
                }
                thread::sleep(self.config.call_gap);
            }
            all_times.extend_from_slice(&times);

            let successes = times.len();
            let avg = mean(&times);
            let name = format!("Execute: {}", function.name);
            let check = if successes == repeats as usize {
                consistent += 1;
                ValidationCheck::new(name, CheckStatus::Pass, format!("{repeats}/{repeats} calls OK (avg: {avg:.0}ms)"))
            } else if successes > 0 {
                ValidationCheck::new(name, CheckStatus::Warn, format!("{successes}/{repeats} calls succeeded"))
            } else {
                ValidationCheck::new(name, CheckStatus::Fail, format!("All {repeats} calls failed"))
            };
            category.push(if successes > 0 {
                check.timed(Duration::from_secs_f64(avg / 1000.0))
            } else {
                check
            });

            if successes > 0 {
                let name = format!("Response: {}", function.name);
                category.push(if non_empty == successes {
                    ValidationCheck::new(name, CheckStatus::Pass, "Returns non-empty responses")
                } else {
                    ValidationCheck::new(
                        name,
                        CheckStatus::Warn,
                        format!("Some empty responses ({non_empty}/{successes})"),
                    )
                });
            }
        }

        let tested = manifest.functions.len();
        category.push(if consistent == tested {
            ValidationCheck::new(
                "Execution Summary",
                CheckStatus::Pass,
                format!("All {tested} functions consistent ({repeats} calls each)"),
            )
        } else if consistent > 0 {
            ValidationCheck::new(
                "Execution Summary",
                CheckStatus::Warn,
                format!("{consistent}/{tested} functions fully consistent"),
            )
        } else {
            ValidationCheck::new("Execution Summary", CheckStatus::Fail, "No functions executed consistently")
        });

        if !all_times.is_empty() {
            let avg = mean(&all_times);
            let (min, max) = min_max(&all_times);
            category.push(ValidationCheck::new(
                "Timing Analysis",
                CheckStatus::Info,
                format!("Avg: {avg:.0}ms, Range: {min:.0}-{max:.0}ms"),
            ));
            let slow = all_times.iter().filter(|t| **t > millis(SLOW_CALL)).count();
            category.push(if slow == 0 {
                ValidationCheck::new("Timeout Compliance", CheckStatus::Pass, "All calls completed within 10s")
            } else {
                ValidationCheck::new("Timeout Compliance", CheckStatus::Warn, format!("{slow} calls exceeded 10s"))
            });
        }
        category
    }

    fn check_stress<P: PluginUnderTest + ?Sized>(&self, plugin: &P, manifest: &Manifest) -> ValidationCategory {
        const NAME: &str = "Stress Test";
        const DESCRIPTION: &str = "Rapid-fire commands and sustained load";
        if !plugin.is_running() {
            return skipped(NAME, DESCRIPTION, "Stress Tests");
        }
        let mut category = ValidationCategory::new(NAME, DESCRIPTION);
        let Some(function) = manifest.functions.first() else {
            category.push(ValidationCheck::new("Stress Tests", CheckStatus::Skip, "No functions to test"));
            return category;
        };
        let arguments = synthetic_arguments(function, "stress_test");

        let total = self.config.rapid_calls;
        let mut rapid_times = Vec::new();
        for _ in 0..total {
            let (response, elapsed) = self.call(plugin, &function.name, &arguments, self.config.call_timeout);
            if responded(&response) {
                rapid_times.push(millis(elapsed));
            }
            thread::sleep(self.config.rapid_gap);
        }
        let succeeded = rapid_times.len();
        let failures = total as usize - succeeded;
        category.push(if failures == 0 {
            ValidationCheck::new(
                "Rapid-Fire Commands",
                CheckStatus::Pass,
                format!("{succeeded}/{total} rapid calls succeeded (avg: {:.0}ms)", mean(&rapid_times)),
            )
        } else if failures * 5 <= total as usize {
            ValidationCheck::new(
                "Rapid-Fire Commands",
                CheckStatus::Warn,
                format!("{succeeded}/{total} rapid calls succeeded"),
            )
        } else {
            ValidationCheck::new(
                "Rapid-Fire Commands",
                CheckStatus::Fail,
                format!("Only {succeeded}/{total} rapid calls succeeded"),
            )
        });

        let mut sustained_times = Vec::new();
        let mut calls = 0usize;
        let window_started = Instant::now();
        while window_started.elapsed() < self.config.sustained_window {
            calls += 1;
            let (response, elapsed) = self.call(plugin, &function.name, &arguments, self.config.call_timeout);
            if responded(&response) {
                sustained_times.push(millis(elapsed));
            }
            thread::sleep(self.config.sustained_pace);
        }
        let rate = if calls == 0 {
            0.0
        } else {
            sustained_times.len() as f64 / calls as f64 * 100.0
        };
        let window = self.config.sustained_window.as_secs_f64();
        category.push(match rate {
            r if r >= 95.0 => ValidationCheck::new(
                "Sustained Load",
                CheckStatus::Pass,
                format!("{calls} calls over {window:.0}s, {r:.0}% success"),
            ),
            r if r >= 80.0 => ValidationCheck::new(
                "Sustained Load",
                CheckStatus::Warn,
                format!("{calls} calls, {r:.0}% success (some degradation)"),
            ),
            r => ValidationCheck::new(
                "Sustained Load",
                CheckStatus::Fail,
                format!("{calls} calls, only {r:.0}% success"),
            ),
        });

        thread::sleep(self.config.settle);
        let (health, _) = self.call(plugin, &function.name, &arguments, self.config.call_timeout);
        category.push(if responded(&health) {
            ValidationCheck::new("Post-Stress Health", CheckStatus::Pass, "Plugin responsive after stress test")
        } else {
            ValidationCheck::new("Post-Stress Health", CheckStatus::Fail, "Plugin unresponsive after stress test")
        });

        category.push(if plugin.is_heartbeat_expired() {
            ValidationCheck::new("Post-Stress Heartbeat", CheckStatus::Warn, "Heartbeat lagging after stress")
        } else {
            ValidationCheck::new("Post-Stress Heartbeat", CheckStatus::Pass, "Heartbeat healthy after stress")
        });

        let half = sustained_times.len() / 2;
        let (first, second) = sustained_times.split_at(half);
        if !first.is_empty() && !second.is_empty() {
            let (early, late) = (mean(first), mean(second));
            let change = if early > 0.0 { (late - early) / early * 100.0 } else { 0.0 };
            category.push(match change {
                c if c < 20.0 => ValidationCheck::new(
                    "Performance Stability",
                    CheckStatus::Pass,
                    format!("Stable performance ({c:+.0}% change)"),
                ),
                c if c < 50.0 => ValidationCheck::new(
                    "Performance Stability",
                    CheckStatus::Warn,
                    format!("Some degradation ({c:+.0}% slower)"),
                ),
                c => ValidationCheck::new(
                    "Performance Stability",
                    CheckStatus::Fail,
                    format!("Significant degradation ({c:+.0}% slower)"),
                ),
            });
        }
        category
    }

    fn check_error_handling<P: PluginUnderTest + ?Sized>(
        &self,
        plugin: &P,
        manifest: &Manifest,
    ) -> ValidationCategory {
        const NAME: &str = "Error Handling";
        const DESCRIPTION: &str = "Graceful error handling";
        if !plugin.is_running() {
            return skipped(NAME, DESCRIPTION, "Error Handling Tests");
        }
        let mut category = ValidationCategory::new(NAME, DESCRIPTION);

        let (response, elapsed) =
            self.call(plugin, UNKNOWN_FUNCTION, &Arguments::new(), self.config.error_call_timeout);
        let check = if response.success {
            ValidationCheck::new("Unknown Function", CheckStatus::Fail, "Does not reject unknown function")
        } else if response.error_code.is_some() {
            ValidationCheck::new("Unknown Function", CheckStatus::Pass, "Returns error for unknown function")
        } else {
            ValidationCheck::new("Unknown Function", CheckStatus::Warn, "Returns error but no error code")
        };
        category.push(check.timed(elapsed));

        if let Some(function) = manifest
            .functions
            .iter()
            .find(|f| f.required_parameters().next().is_some())
        {
            let (response, _) =
                self.call(plugin, &function.name, &Arguments::new(), self.config.error_call_timeout);
            category.push(if !response.success || !response.message.is_empty() {
                ValidationCheck::new(
                    "Missing Parameters",
                    CheckStatus::Pass,
                    format!("Handles missing params for {}", function.name),
                )
            } else {
                ValidationCheck::new(
                    "Missing Parameters",
                    CheckStatus::Warn,
                    format!("No clear error for missing params in {}", function.name),
                )
            });
        }

        category.push(if plugin.is_running() {
            ValidationCheck::new(
                "Stability After Errors",
                CheckStatus::Pass,
                "Plugin remains stable after error conditions",
            )
        } else {
            ValidationCheck::new("Stability After Errors", CheckStatus::Fail, "Plugin crashed during error tests")
        });
        category
    }

    fn check_shutdown<P: PluginUnderTest + ?Sized>(&self, plugin: &P) -> ValidationCategory {
        const NAME: &str = "Shutdown";
        const DESCRIPTION: &str = "Clean shutdown behavior";
        if !plugin.is_running() {
            return skipped(NAME, DESCRIPTION, "Shutdown Tests");
        }
        let mut category = ValidationCategory::new(NAME, DESCRIPTION);

        let started = Instant::now();
        let outcome = plugin.shutdown();
        let elapsed = started.elapsed();
        let ms = millis(elapsed);
        category.push(
            if outcome.response.success {
                ValidationCheck::new("Graceful Shutdown", CheckStatus::Pass, format!("Shutdown completed in {ms:.0}ms"))
            } else {
                ValidationCheck::new(
                    "Graceful Shutdown",
                    CheckStatus::Warn,
                    format!("Shutdown response: {}", outcome.response.message),
                )
            }
            .timed(elapsed),
        );

        let still_running = plugin.is_running();
        if still_running {
            plugin.stop();
        }
        category.push(if outcome.forced_kill || still_running {
            ValidationCheck::new("Process Exit", CheckStatus::Warn, "Process required force stop")
        } else {
            ValidationCheck::new("Process Exit", CheckStatus::Pass, "Process exited cleanly")
        });

        category.push(if elapsed < Duration::from_secs(3) {
            ValidationCheck::new("Shutdown Time", CheckStatus::Pass, format!("Shutdown in {ms:.0}ms (< 3s)"))
        } else {
            ValidationCheck::new("Shutdown Time", CheckStatus::Warn, format!("Slow shutdown: {ms:.0}ms"))
        });
        category
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::FailureKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted stand-in: every call succeeds except the listed stress calls.
    struct FakePlugin {
        manifest: Arc<Manifest>,
        running: AtomicBool,
        stress_calls: AtomicUsize,
        failing_stress_calls: Vec<usize>,
        heartbeat: Mutex<Option<Instant>>,
        start_fails: bool,
    }

    impl FakePlugin {
        fn new(failing_stress_calls: Vec<usize>) -> Self {
            let manifest = Manifest::from_value(
                &json!({
                    "manifestVersion": 1,
                    "protocol_version": "2.0",
                    "executable": "fake",
                    "persistent": false,
                    "description": "A scripted plugin for tests",
                    "functions": [{
                        "name": "echo",
                        "description": "Echo text",
                        "parameters": {
                            "type": "object",
                            "properties": {"text": {"type": "string"}},
                            "required": ["text"]
                        }
                    }]
                }),
                Path::new("/plugins/fake"),
            )
            .unwrap();
            Self {
                manifest: Arc::new(manifest),
                running: AtomicBool::new(false),
                stress_calls: AtomicUsize::new(0),
                failing_stress_calls,
                heartbeat: Mutex::new(None),
                start_fails: false,
            }
        }

        fn beat(&self) {
            *self.heartbeat.lock().unwrap() = Some(Instant::now());
        }
    }

    impl PluginUnderTest for FakePlugin {
        fn manifest(&self) -> Arc<Manifest> {
            self.manifest.clone()
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn start(&self) -> Result<(), PluginError> {
            if self.start_fails {
                return Err(PluginError::ExecutableNotFound(PathBuf::from("/plugins/fake/fake")));
            }
            self.running.store(true, Ordering::SeqCst);
            self.beat();
            Ok(())
        }

        fn stop(&self) -> StopOutcome {
            self.running.store(false, Ordering::SeqCst);
            StopOutcome::Exited
        }

        fn initialize(&self) -> PluginResponse {
            self.beat();
            PluginResponse::success("", json!({"success": true}))
        }

        fn execute(&self, function: &str, arguments: Arguments, _timeout: Duration) -> PluginResponse {
            self.beat();
            if function != "echo" {
                return PluginResponse::failure(FailureKind::Rejected, "Unknown function").with_code(-32601);
            }
            let Some(text) = arguments.get("text").and_then(Value::as_str) else {
                return PluginResponse::failure(FailureKind::Rejected, "missing text").with_code(-32602);
            };
            if text == "stress_test" {
                let n = self.stress_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.failing_stress_calls.contains(&n) {
                    return PluginResponse::failure(FailureKind::Rejected, "flaky").with_code(-1);
                }
            }
            PluginResponse::success(text, Value::Null)
        }

        fn send_input(&self, _content: &str, _timeout: Duration) -> PluginResponse {
            PluginResponse::success("bye", Value::Null)
        }

        fn probe(&self, _timeout: Duration) -> Option<Duration> {
            thread::sleep(Duration::from_millis(1));
            self.beat();
            Some(Duration::from_millis(1))
        }

        fn last_heartbeat(&self) -> Option<Instant> {
            *self.heartbeat.lock().unwrap()
        }

        fn is_heartbeat_expired(&self) -> bool {
            false
        }

        fn shutdown(&self) -> ShutdownOutcome {
            self.running.store(false, Ordering::SeqCst);
            ShutdownOutcome {
                response: PluginResponse::success("", json!({"success": true})),
                forced_kill: false,
            }
        }
    }

    fn quick() -> ValidatorConfig {
        ValidatorConfig {
            heartbeat_window: Duration::from_millis(30),
            ping_interval: Duration::from_millis(5),
            ping_timeout: Duration::from_millis(50),
            sustained_window: Duration::from_millis(30),
            sustained_pace: Duration::from_millis(2),
            mcp_discovery_wait: Duration::ZERO,
            call_timeout: Duration::from_millis(100),
            error_call_timeout: Duration::from_millis(100),
            call_gap: Duration::from_millis(1),
            rapid_gap: Duration::ZERO,
            settle: Duration::ZERO,
            ..ValidatorConfig::default()
        }
    }

    fn check<'a>(report: &'a ValidationReport, category: &str, name: &str) -> &'a ValidationCheck {
        report
            .category(category)
            .and_then(|c| c.checks.iter().find(|check| check.name == name))
            .unwrap_or_else(|| panic!("missing check {category}/{name}"))
    }

    #[test]
    fn two_of_ten_rapid_failures_is_a_warning() {
        let plugin = FakePlugin::new(vec![3, 7]);
        let report = Validator::new(quick()).run(&plugin);

        let rapid = check(&report, "Stress Test", "Rapid-Fire Commands");
        assert_eq!(rapid.status, CheckStatus::Warn);
        assert_eq!(rapid.message, "8/10 rapid calls succeeded");
    }

    #[test]
    fn three_rapid_failures_fail_the_check() {
        let plugin = FakePlugin::new(vec![1, 2, 3]);
        let report = Validator::new(quick()).run(&plugin);

        let rapid = check(&report, "Stress Test", "Rapid-Fire Commands");
        assert_eq!(rapid.status, CheckStatus::Fail);
        assert_eq!(rapid.message, "Only 7/10 rapid calls succeeded");
    }

    #[test]
    fn healthy_plugin_scores_well() {
        let plugin = FakePlugin::new(Vec::new());
        let report = Validator::new(quick()).run(&plugin);

        let names: Vec<_> = report.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Manifest",
                "Startup",
                "Protocol",
                "Heartbeat",
                "Execution",
                "Stress Test",
                "Error Handling",
                "Shutdown"
            ]
        );
        assert_eq!(check(&report, "Execution", "Execute: echo").message.split(" (").next(), Some("3/3 calls OK"));
        assert_eq!(check(&report, "Error Handling", "Unknown Function").status, CheckStatus::Pass);
        assert_eq!(check(&report, "Error Handling", "Missing Parameters").status, CheckStatus::Pass);
        assert_eq!(check(&report, "Shutdown", "Process Exit").status, CheckStatus::Pass);
        assert!(report.overall_score() >= 90.0, "score was {}", report.overall_score());
        assert!(!plugin.is_running());
    }

    #[test]
    fn failed_start_skips_process_categories() {
        let mut plugin = FakePlugin::new(Vec::new());
        plugin.start_fails = true;
        let report = Validator::new(quick()).run(&plugin);

        assert_eq!(check(&report, "Startup", "Process Start").status, CheckStatus::Fail);
        let heartbeat = report.category("Heartbeat").unwrap();
        assert_eq!(heartbeat.checks.len(), 1);
        assert_eq!(heartbeat.checks[0].status, CheckStatus::Skip);
        assert_eq!(heartbeat.checks[0].message, "Plugin not running");
        assert_eq!(heartbeat.score(), 100.0);
        assert!(report.to_string().contains("[SKIP] Heartbeat Tests"));
    }

    #[test]
    fn category_score_counts_warnings_as_half() {
        let mut category = ValidationCategory::new("X", "x");
        category.push(ValidationCheck::new("a", CheckStatus::Pass, ""));
        category.push(ValidationCheck::new("b", CheckStatus::Warn, ""));
        category.push(ValidationCheck::new("c", CheckStatus::Fail, ""));
        category.push(ValidationCheck::new("d", CheckStatus::Skip, ""));
        assert!((category.score() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn grades_follow_thresholds() {
        assert_eq!(grade_for(100.0), "A+");
        assert_eq!(grade_for(90.0), "A");
        assert_eq!(grade_for(84.9), "B");
        assert_eq!(grade_for(72.0), "C");
        assert_eq!(grade_for(60.0), "D");
        assert_eq!(grade_for(10.0), "F");
    }

    #[test]
    fn synthetic_arguments_by_type() {
        let manifest = FakePlugin::new(Vec::new()).manifest;
        let args = synthetic_arguments(&manifest.functions[0], "test");
        assert_eq!(args.get("text"), Some(&json!("test")));
    }

    #[test]
    fn report_exports_json() {
        let mut report = ValidationReport {
            plugin_name: "demo".into(),
            plugin_version: REPORTED_VERSION.into(),
            timestamp: Local::now(),
            categories: vec![ValidationCategory::new("Manifest", "m")],
        };
        report.categories[0].push(
            ValidationCheck::new("Manifest Version", CheckStatus::Warn, "hmm").timed(Duration::from_millis(12)),
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.export_json(&path).unwrap();
        let exported: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(exported["grade"], "F");
        assert_eq!(exported["total_warnings"], 1);
        assert_eq!(exported["categories"][0]["checks"][0]["status"], "WARN");
        assert_eq!(exported["categories"][0]["checks"][0]["duration_ms"], 12.0);
        assert!(report.to_string().contains("NEEDS WORK"));
    }
}
