#![allow(dead_code)]

use plugbench_host::{Manifest, PluginOptions, ValidatorConfig};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXAMPLE_PLUGIN: &str = env!("CARGO_BIN_EXE_example-plugin");

/// Lay out `<root>/<name>/manifest.json` pointing at the example plugin binary, plus an
/// optional `behavior.json`.
pub fn write_example_plugin(root: &Path, name: &str, persistent: bool, behavior: Option<Value>) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    let manifest = json!({
        "manifestVersion": 1,
        "protocol_version": "2.0",
        "executable": EXAMPLE_PLUGIN,
        "persistent": persistent,
        "description": "Reference plugin used by the test-suite",
        "tags": ["demo"],
        "functions": [
            {
                "name": "echo",
                "description": "Echo text back",
                "parameters": {
                    "type": "object",
                    "properties": {"text": {"type": "string", "description": "Text to echo"}},
                    "required": ["text"]
                }
            },
            {
                "name": "greet",
                "description": "Start a short conversation",
                "parameters": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": []
                }
            },
            {
                "name": "calculate",
                "description": "Basic arithmetic",
                "tags": ["math"],
                "parameters": {
                    "type": "object",
                    "properties": {
                        "operation": {"type": "string", "enum": ["add", "subtract", "multiply", "divide"]},
                        "a": {"type": "number"},
                        "b": {"type": "number"}
                    },
                    "required": ["operation", "a", "b"]
                }
            }
        ]
    });
    fs::write(dir.join("manifest.json"), serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
    if let Some(behavior) = behavior {
        fs::write(dir.join("behavior.json"), behavior.to_string()).unwrap();
    }
    dir
}

pub fn load_manifest(dir: &Path) -> Manifest {
    Manifest::load(dir).unwrap()
}

pub fn fast_plugin_options() -> PluginOptions {
    PluginOptions {
        shutdown_settle: Duration::from_millis(20),
        exit_grace: Duration::from_millis(300),
        kill_grace: Duration::from_millis(300),
        poll_slice: Duration::from_millis(50),
        ..PluginOptions::default()
    }
}

pub fn quick_validator() -> ValidatorConfig {
    ValidatorConfig {
        heartbeat_window: Duration::from_millis(200),
        ping_interval: Duration::from_millis(20),
        sustained_window: Duration::from_millis(200),
        sustained_pace: Duration::from_millis(10),
        mcp_discovery_wait: Duration::ZERO,
        call_timeout: Duration::from_secs(5),
        error_call_timeout: Duration::from_secs(2),
        call_gap: Duration::from_millis(5),
        rapid_gap: Duration::ZERO,
        settle: Duration::from_millis(10),
        ..ValidatorConfig::default()
    }
}
