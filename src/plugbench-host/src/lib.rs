//! Plugin host emulator.
//!
//! This crate stands in for a production host application so plugin authors can
//! develop and compliance-test their plugins without it:
//! - A length-prefixed JSON-RPC 2.0 codec ([`protocol`])
//! - Manifest parsing and plugin discovery ([`manifest`])
//! - A child-process wrapper with a request/response correlator and heartbeat
//!   tracking ([`Plugin`])
//! - Function routing across every loaded plugin ([`PluginManager`])
//! - Interactive, one-shot, passthrough, batch and judge-driven modes ([`PluginEngine`])
//! - A compliance scorecard ([`Validator`]) and a polling directory watcher
//!   ([`PluginWatcher`])
//!
//! # Plugin Protocol
//!
//! Every message on the plugin's stdin and stdout is a 4-byte big-endian length
//! followed by that many bytes of UTF-8 JSON:
//! - The host sends requests: `initialize`, `execute`, `input`, `ping`, `shutdown`
//! - The plugin answers with responses carrying the request id, or with `stream`,
//!   `complete`, `error` and `log` notifications while an `execute` is in flight
//!
//! # Example Plugin (pseudocode)
//!
//! ```text
//! loop:
//!     length = read_u32_be(stdin)
//!     message = json_parse(read_exact(stdin, length))
//!     if message.method == "initialize":
//!         reply(message.id, {"success": true})
//!     elif message.method == "execute":
//!         notify("stream", {"data": "partial text"})
//!         notify("complete", {"success": true, "data": "done", "keep_session": false})
//!     elif message.method == "ping":
//!         reply(message.id, {"timestamp": message.params.timestamp})
//!     elif message.method == "shutdown":
//!         reply(message.id, {"success": true})
//!         exit()
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use plugbench_host::{EngineConfig, PluginEngine};
//!
//! let mut engine = PluginEngine::new(EngineConfig::new("./plugins"));
//! engine.initialize()?;
//! let result = engine.execute("echo", serde_json::Map::new(), None);
//! println!("{}", result.response);
//! engine.shutdown();
//! ```

pub mod engine;
pub mod interactive;
pub mod judge;
pub mod manager;
pub mod manifest;
pub mod plugin;
pub mod protocol;
pub mod validator;
pub mod watcher;

pub use engine::{
    AutonomousTestResult, BatchCommand, EngineConfig, EngineError, EngineMode, ExecutionResult,
    PassthroughExit, PluginEngine, TestCase,
};
pub use interactive::InteractiveSession;
pub use judge::{Assessment, CommandJudge, Judge, JudgeError, JudgeOutcome, Turn, Verdict};
pub use manager::{
    FailedPlugin, LoadSummary, ManagerError, ManagerOptions, PluginManager, PluginSummary,
};
pub use manifest::{FunctionDefinition, Manifest, ManifestError, ParameterDefinition};
pub use plugin::{
    Arguments, CallOptions, FailureKind, Plugin, PluginError, PluginObserver, PluginOptions,
    PluginResponse, PluginState,
};
pub use protocol::{ErrorCode, FrameDecoder, Message, ProtocolError, PROTOCOL_VERSION};
pub use validator::{
    CheckStatus, PluginUnderTest, ValidationCategory, ValidationCheck, ValidationReport,
    Validator, ValidatorConfig, ValidatorError,
};
pub use watcher::{ChangeKind, PluginChange, PluginWatcher, WatcherError};
