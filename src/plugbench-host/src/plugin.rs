//! One plugin process: spawn, framed IPC, request correlation and liveness.
//!
//! The host writes requests to the child's stdin. A dedicated reader thread decodes
//! frames from stdout and routes them: responses go to the waiter registered under
//! their id, pongs and input acknowledgements only refresh the heartbeat.
//! `stream`/`complete`/`error` notifications carry no id, so they belong to the one
//! in-flight `execute` or `input` turn. Output from a turn that already timed out, and
//! a `complete` trailing the `error` that failed a turn, is discarded instead of
//! resolving the next caller. Callers block on a per-request channel in short slices
//! so a dead process is noticed before the deadline.

use crate::manifest::{FunctionDefinition, Manifest};
use crate::protocol::{
    ContextMessage, ExecuteParams, FrameDecoder, Message, Notification, Outcome, PluginEvent,
    ProtocolError, Request, Response, EXECUTE_TIMEOUT, HEARTBEAT_TIMEOUT, PING_INTERVAL,
    SHUTDOWN_TIMEOUT,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Arguments passed to a plugin function.
pub type Arguments = Map<String, Value>;

/// Environment variable pointing at a development Python interpreter.
pub const PYTHON_OVERRIDE_ENV: &str = "PLUGBENCH_PYTHON";
/// Plugin-local dependency folder prepended to `PYTHONPATH`.
pub const LIBS_DIR: &str = "libs";

const EXIT_POLL: Duration = Duration::from_millis(20);
const ERROR_SETTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Stopped,
    Starting,
    Running,
    Initializing,
    Ready,
    Executing,
    AwaitingInput,
    Stopping,
    Error,
}

impl PluginState {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Stopped => "stopped",
            PluginState::Starting => "starting",
            PluginState::Running => "running",
            PluginState::Initializing => "initializing",
            PluginState::Ready => "ready",
            PluginState::Executing => "executing",
            PluginState::AwaitingInput => "awaiting_input",
            PluginState::Stopping => "stopping",
            PluginState::Error => "error",
        }
    }

    /// States in which a process is (or is becoming) live.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PluginState::Starting
                | PluginState::Running
                | PluginState::Initializing
                | PluginState::Ready
                | PluginState::Executing
                | PluginState::AwaitingInput
        )
    }

    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Stopped | Error, Starting) => true,
            (Starting, Running) => true,
            (Running | Ready | Error, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready | AwaitingInput, Executing) => true,
            (Executing | AwaitingInput, Ready | AwaitingInput) => true,
            (from, Error) => from.is_active(),
            (from, Stopping) => from.is_active() || from == Error,
            (Stopping | Error, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownPlugin,
    UnknownFunction,
    MissingParameter,
    /// The plugin answered with an error or an unsuccessful `complete`.
    Rejected,
    Timeout,
    ProcessExited,
    HeartbeatExpired,
    NotRunning,
    NotReady,
    NotAwaitingInput,
    Spawn,
    Transport,
}

impl FailureKind {
    /// Liveness failures mean the plugin was slow or gone, not that it said no.
    pub fn is_liveness(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::ProcessExited | FailureKind::HeartbeatExpired
        )
    }
}

/// Uniform result of every plugin call. Expected failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginResponse {
    pub success: bool,
    /// Accumulated streamed text, or the failure message.
    pub message: String,
    pub data: Value,
    pub awaiting_input: bool,
    pub error_code: Option<i64>,
    pub failure: Option<FailureKind>,
}

impl PluginResponse {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            awaiting_input: false,
            error_code: None,
            failure: None,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Value::Null,
            awaiting_input: false,
            error_code: None,
            failure: Some(kind),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn is_liveness_failure(&self) -> bool {
        self.failure.is_some_and(FailureKind::is_liveness)
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),
    #[error("Python interpreter not found")]
    InterpreterNotFound,
    #[error("failed to spawn plugin process: {0}")]
    Spawn(std::io::Error),
    #[error("plugin process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("failed to start reader thread: {0}")]
    Thread(std::io::Error),
    #[error("plugin is not running")]
    NotRunning,
    #[error("failed to write to plugin: {0}")]
    Write(std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Receives plugin output as it arrives. Callbacks run on the reader thread.
pub trait PluginObserver: Send + Sync {
    fn on_stream(&self, _plugin: &str, _chunk: &str) {}
    fn on_complete(&self, _plugin: &str, _success: bool, _text: &str) {}
    fn on_error(&self, _plugin: &str, _code: i64, _message: &str) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl PluginObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct PluginOptions {
    pub heartbeat_timeout: Duration,
    pub initialize_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Pause between the shutdown reply and closing the pipes.
    pub shutdown_settle: Duration,
    /// How long a child gets to exit on its own after stdin closes.
    pub exit_grace: Duration,
    pub kill_grace: Duration,
    pub reader_join_timeout: Duration,
    /// Upper bound on one blocking wait while polling for a response.
    pub poll_slice: Duration,
    /// A waiting caller pings the plugin after this much silence.
    pub ping_interval: Duration,
    /// Window in which a `complete(false)` after an `error` still belongs to the
    /// failed turn. The next turn starts once it has passed.
    pub error_settle: Duration,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            initialize_timeout: EXECUTE_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            shutdown_settle: Duration::from_millis(500),
            exit_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(1),
            reader_join_timeout: Duration::from_secs(1),
            poll_slice: Duration::from_millis(500),
            ping_interval: PING_INTERVAL,
            error_settle: ERROR_SETTLE,
        }
    }
}

/// Per-call settings for `execute`.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub context: Option<Vec<ContextMessage>>,
    pub system_info: Option<String>,
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            context: None,
            system_info: None,
            timeout: EXECUTE_TIMEOUT,
        }
    }
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Exited,
    Killed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownOutcome {
    pub response: PluginResponse,
    pub forced_kill: bool,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ownership of id-less notifications.
#[derive(Debug, Default)]
struct Turn {
    active: Option<u64>,
    /// Timed-out turns whose `complete`/`error` has not arrived yet.
    abandoned: u32,
    /// A `complete(false)` before this instant trails an earlier `error`.
    tail_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Turn(u64),
    /// No turn in flight: every waiter, as for a failure during `initialize`.
    Waiters,
    Discard,
}

/// State shared between callers and the reader thread.
struct Shared {
    name: String,
    state: Mutex<PluginState>,
    pending: Mutex<HashMap<u64, Sender<PluginResponse>>>,
    connected: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    last_heartbeat: Mutex<Option<Instant>>,
    awaiting_input: AtomicBool,
    transcript: Mutex<String>,
    turn: Mutex<Turn>,
    error_settle: Duration,
    observer: Arc<dyn PluginObserver>,
}

impl Shared {
    fn new(name: String, error_settle: Duration, observer: Arc<dyn PluginObserver>) -> Self {
        Self {
            name,
            state: Mutex::new(PluginState::Stopped),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            started_at: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
            awaiting_input: AtomicBool::new(false),
            transcript: Mutex::new(String::new()),
            turn: Mutex::new(Turn::default()),
            error_settle,
            observer,
        }
    }

    fn state(&self) -> PluginState {
        *lock(&self.state)
    }

    fn set_state(&self, next: PluginState) -> bool {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            warn!(plugin = %self.name, from = %*state, to = %next, "refusing invalid state transition");
            return false;
        }
        if *state != next {
            debug!(plugin = %self.name, from = %*state, to = %next, "state transition");
            *state = next;
        }
        true
    }

    fn touch_heartbeat(&self) {
        *lock(&self.last_heartbeat) = Some(Instant::now());
    }

    fn heartbeat_reference(&self) -> Option<Instant> {
        let started = *lock(&self.started_at);
        let beat = *lock(&self.last_heartbeat);
        match (started, beat) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn heartbeat_expired(&self, timeout: Duration) -> bool {
        self.heartbeat_reference()
            .is_some_and(|reference| reference.elapsed() > timeout)
    }

    fn register(&self, id: u64) -> Receiver<PluginResponse> {
        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(id, tx);
        rx
    }

    fn unregister(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }

    /// Make `id` the owner of notifications, after letting a failed turn's trailing
    /// `complete` drain.
    fn begin_turn(&self, id: u64) {
        let tail = lock(&self.turn).tail_until;
        if let Some(wait) = tail.and_then(|until| until.checked_duration_since(Instant::now())) {
            trace!(plugin = %self.name, id, wait_ms = wait.as_millis() as u64, "waiting for failed turn to settle");
            thread::sleep(wait);
        }
        {
            let mut turn = lock(&self.turn);
            turn.tail_until = None;
            turn.active = Some(id);
        }
        lock(&self.transcript).clear();
    }

    fn end_turn(&self, id: u64, response: &PluginResponse) {
        let mut turn = lock(&self.turn);
        if turn.active != Some(id) {
            return;
        }
        turn.active = None;
        if response.failure == Some(FailureKind::Timeout) {
            turn.abandoned += 1;
            debug!(plugin = %self.name, id, "late output of timed-out request will be discarded");
        }
    }

    fn accepts_stream(&self) -> bool {
        lock(&self.turn).abandoned == 0
    }

    /// Decide who a `complete` (`error == false`) or `error` notification resolves.
    fn route_terminal(&self, error: bool, success: bool) -> Route {
        let mut turn = lock(&self.turn);
        let now = Instant::now();
        if !error && !success && turn.tail_until.is_some_and(|until| now < until) {
            turn.tail_until = None;
            return Route::Discard;
        }
        if error {
            turn.tail_until = Some(now + self.error_settle);
        }
        if turn.abandoned > 0 {
            turn.abandoned -= 1;
            return Route::Discard;
        }
        turn.active.take().map_or(Route::Waiters, Route::Turn)
    }

    fn deliver(&self, route: Route, response: PluginResponse) {
        let pending = lock(&self.pending);
        match route {
            Route::Turn(id) => {
                if let Some(sender) = pending.get(&id) {
                    let _ = sender.send(response);
                }
            }
            Route::Waiters => {
                for sender in pending.values() {
                    let _ = sender.send(response.clone());
                }
            }
            Route::Discard => {}
        }
    }

    fn dispatch(&self, message: Message) {
        self.touch_heartbeat();
        match message {
            Message::Response(response) => self.on_response(response),
            Message::Notification(notification) => self.on_notification(&notification),
            Message::Request(request) => {
                warn!(plugin = %self.name, method = %request.method, "ignoring request sent by plugin")
            }
        }
    }

    fn on_response(&self, response: Response) {
        if response.is_pong() {
            trace!(plugin = %self.name, id = response.id, "pong");
            return;
        }
        if response.is_acknowledgement() {
            trace!(plugin = %self.name, id = response.id, "input acknowledged");
            return;
        }

        let Some(sender) = lock(&self.pending).get(&response.id).cloned() else {
            debug!(plugin = %self.name, id = response.id, "response for unknown request id");
            return;
        };
        let transcript = lock(&self.transcript).clone();
        let reply = match response.outcome {
            Outcome::Result(data) => PluginResponse::success(transcript, data),
            Outcome::Error(err) => {
                let message = if transcript.is_empty() {
                    err.message
                } else {
                    transcript
                };
                let mut reply =
                    PluginResponse::failure(FailureKind::Rejected, message).with_code(err.code);
                reply.data = err.data.unwrap_or(Value::Null);
                reply
            }
        };
        let _ = sender.send(reply);
    }

    fn on_notification(&self, notification: &Notification) {
        match notification.event() {
            PluginEvent::Stream { data } => {
                if !self.accepts_stream() {
                    trace!(plugin = %self.name, "discarding stream of timed-out request");
                    return;
                }
                lock(&self.transcript).push_str(&data);
                self.observer.on_stream(&self.name, &data);
            }
            PluginEvent::Complete {
                success,
                data,
                keep_session,
            } => {
                let route = self.route_terminal(false, success);
                if route == Route::Discard {
                    debug!(plugin = %self.name, success, "discarding stale complete");
                    return;
                }
                let text = {
                    let mut transcript = lock(&self.transcript);
                    transcript.push_str(&data);
                    transcript.clone()
                };
                self.awaiting_input.store(keep_session, Ordering::SeqCst);
                self.observer.on_complete(&self.name, success, &text);
                let mut reply = if success {
                    PluginResponse::success(text, Value::String(data))
                } else {
                    let mut reply = PluginResponse::failure(FailureKind::Rejected, text);
                    reply.data = Value::String(data);
                    reply
                };
                reply.awaiting_input = keep_session;
                self.deliver(route, reply);
            }
            PluginEvent::Error { code, message } => {
                let route = self.route_terminal(true, false);
                if route == Route::Discard {
                    debug!(plugin = %self.name, code, %message, "discarding error of timed-out request");
                    return;
                }
                self.awaiting_input.store(false, Ordering::SeqCst);
                self.observer.on_error(&self.name, code, &message);
                self.deliver(route, PluginResponse::failure(FailureKind::Rejected, message).with_code(code));
            }
            PluginEvent::Log { level, message } => {
                let plugin = self.name.as_str();
                match level.to_ascii_lowercase().as_str() {
                    "error" | "critical" => error!(plugin, "{message}"),
                    "warn" | "warning" => warn!(plugin, "{message}"),
                    "debug" => debug!(plugin, "{message}"),
                    "trace" => trace!(plugin, "{message}"),
                    _ => info!(plugin, "{message}"),
                }
            }
            PluginEvent::Unknown { method } => {
                debug!(plugin = %self.name, %method, "ignoring unknown notification")
            }
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.pending).clear();
    }

    fn reset_session(&self) {
        self.awaiting_input.store(false, Ordering::SeqCst);
        lock(&self.transcript).clear();
        *lock(&self.turn) = Turn::default();
        *lock(&self.started_at) = None;
        *lock(&self.last_heartbeat) = None;
    }
}

struct Process {
    child: Child,
    reader: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

/// A plugin described by a manifest, owning at most one child process.
pub struct Plugin {
    manifest: RwLock<Arc<Manifest>>,
    options: PluginOptions,
    shared: Arc<Shared>,
    process: Mutex<Option<Process>>,
    stdin: Mutex<Option<ChildStdin>>,
    lifecycle: Mutex<()>,
    next_id: AtomicU64,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn new(manifest: Manifest, options: PluginOptions, observer: Arc<dyn PluginObserver>) -> Self {
        Self {
            shared: Arc::new(Shared::new(manifest.name.clone(), options.error_settle, observer)),
            manifest: RwLock::new(Arc::new(manifest)),
            options,
            process: Mutex::new(None),
            stdin: Mutex::new(None),
            lifecycle: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_manifest(manifest: Manifest) -> Self {
        Self::new(manifest, PluginOptions::default(), Arc::new(NoopObserver))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn manifest(&self) -> Arc<Manifest> {
        self.manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a re-parsed manifest; the running process is untouched.
    pub fn replace_manifest(&self, manifest: Manifest) {
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(manifest);
    }

    pub fn function(&self, name: &str) -> Option<FunctionDefinition> {
        self.manifest().function(name).cloned()
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    pub fn state(&self) -> PluginState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.process)
            .as_mut()
            .is_some_and(|process| matches!(process.child.try_wait(), Ok(None)))
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.shared.awaiting_input.load(Ordering::SeqCst)
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        *lock(&self.shared.last_heartbeat)
    }

    /// True once nothing has arrived for longer than the heartbeat timeout since the
    /// later of process start and the last inbound message.
    pub fn is_heartbeat_expired(&self) -> bool {
        self.shared.heartbeat_expired(self.options.heartbeat_timeout)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Spawn the process and its reader thread. A no-op while already running.
    pub fn start(&self) -> Result<(), PluginError> {
        let _guard = lock(&self.lifecycle);
        if self.is_running() {
            debug!(plugin = %self.name(), "plugin already running");
            return Ok(());
        }
        self.reap();
        self.shared.set_state(PluginState::Starting);

        let manifest = self.manifest();
        match self.launch(&manifest) {
            Ok((process, stdin)) => {
                let pid = process.child.id();
                *lock(&self.stdin) = Some(stdin);
                *lock(&self.process) = Some(process);
                self.shared.set_state(PluginState::Running);
                info!(
                    plugin = %self.name(),
                    pid,
                    executable = %manifest.executable_path.display(),
                    "plugin started"
                );
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(PluginState::Error);
                error!(plugin = %self.name(), error = %err, "failed to start plugin");
                Err(err)
            }
        }
    }

    fn launch(&self, manifest: &Manifest) -> Result<(Process, ChildStdin), PluginError> {
        let mut command = build_command(manifest)?;
        let mut child = command.spawn().map_err(PluginError::Spawn)?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), stderr) = pipes else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PluginError::MissingPipe("stdin/stdout"));
        };

        let now = Instant::now();
        self.shared.reset_session();
        *lock(&self.shared.started_at) = Some(now);
        *lock(&self.shared.last_heartbeat) = Some(now);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let reader = thread::Builder::new()
            .name(format!("plugin-reader-{}", self.name()))
            .spawn(move || read_loop(stdout, shared));
        let reader = match reader {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.connected.store(false, Ordering::SeqCst);
                let _ = child.kill();
                let _ = child.wait();
                return Err(PluginError::Thread(err));
            }
        };

        let stderr = stderr.and_then(|pipe| {
            let name = self.name().to_string();
            thread::Builder::new()
                .name(format!("plugin-stderr-{name}"))
                .spawn(move || drain_stderr(pipe, &name))
                .map_err(|err| warn!(plugin = %self.name(), error = %err, "stderr will not be captured"))
                .ok()
        });

        Ok((
            Process {
                child,
                reader: Some(reader),
                stderr,
            },
            stdin,
        ))
    }

    /// Clean up a process that exited on its own so the slot can be reused.
    fn reap(&self) {
        let Some(process) = lock(&self.process).take() else {
            return;
        };
        debug!(plugin = %self.name(), "reaping exited plugin process");
        lock(&self.stdin).take();
        self.release(process);
        self.shared.set_state(PluginState::Stopping);
        self.shared.set_state(PluginState::Stopped);
    }

    fn release(&self, mut process: Process) {
        let _ = process.child.wait();
        join_bounded(process.reader.take(), self.options.reader_join_timeout, self.name());
        join_bounded(process.stderr.take(), self.options.reader_join_timeout, self.name());
        self.shared.disconnect();
        self.shared.reset_session();
    }

    /// Send the `initialize` handshake, spawning the process first if needed.
    pub fn initialize(&self) -> PluginResponse {
        if let Err(err) = self.start() {
            return PluginResponse::failure(FailureKind::Spawn, err.to_string());
        }
        if !self.shared.set_state(PluginState::Initializing) {
            let state = self.state();
            return PluginResponse::failure(
                FailureKind::NotReady,
                format!("Plugin cannot initialize (state: {state})"),
            );
        }

        let started = Instant::now();
        let response = self.call(Request::initialize(self.next_id()), self.options.initialize_timeout);
        if response.success {
            self.shared.set_state(PluginState::Ready);
            info!(
                plugin = %self.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "plugin initialized"
            );
        } else {
            self.shared.set_state(PluginState::Error);
            warn!(plugin = %self.name(), reason = %response.message, "plugin failed to initialize");
        }
        response
    }

    /// Invoke a plugin function and wait for its `complete`, `error` or response.
    pub fn execute(&self, function: &str, arguments: Arguments, options: &CallOptions) -> PluginResponse {
        if !self.is_running() {
            let init = self.initialize();
            if !init.success {
                return init;
            }
        }

        let state = self.state();
        if !matches!(state, PluginState::Ready | PluginState::AwaitingInput) {
            return PluginResponse::failure(
                FailureKind::NotReady,
                format!("Plugin not ready (state: {state})"),
            );
        }

        self.shared.set_state(PluginState::Executing);
        let params = ExecuteParams {
            function: function.to_string(),
            arguments,
            context: options.context.clone(),
            system_info: options.system_info.clone(),
        };

        let started = Instant::now();
        let response = self.call_turn(Request::execute(self.next_id(), &params), options.timeout);
        debug!(
            plugin = %self.name(),
            function,
            success = response.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execute finished"
        );
        self.settle(&response);
        response
    }

    /// Forward user text to a plugin holding an open session.
    pub fn send_input(&self, content: &str, timeout: Duration) -> PluginResponse {
        if !self.is_running() {
            return PluginResponse::failure(FailureKind::NotRunning, "Plugin not running");
        }
        if !self.is_awaiting_input() {
            return PluginResponse::failure(
                FailureKind::NotAwaitingInput,
                "Plugin not awaiting input",
            );
        }

        let response = self.call_turn(Request::input(self.next_id(), content), timeout);
        self.settle(&response);
        response
    }

    fn settle(&self, response: &PluginResponse) {
        if matches!(
            response.failure,
            Some(FailureKind::ProcessExited | FailureKind::HeartbeatExpired)
        ) {
            self.shared.awaiting_input.store(false, Ordering::SeqCst);
            self.shared.set_state(PluginState::Error);
            return;
        }
        self.shared
            .awaiting_input
            .store(response.awaiting_input, Ordering::SeqCst);
        let next = if response.awaiting_input {
            PluginState::AwaitingInput
        } else {
            PluginState::Ready
        };
        self.shared.set_state(next);
    }

    /// Fire-and-forget ping; the pong only refreshes the heartbeat.
    pub fn send_ping(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.write(&Request::ping(self.next_id()).into()) {
            Ok(()) => true,
            Err(err) => {
                debug!(plugin = %self.name(), error = %err, "ping not sent");
                false
            }
        }
    }

    /// Ping and wait for the heartbeat to move past the send instant.
    pub fn probe(&self, timeout: Duration) -> Option<Duration> {
        let sent = Instant::now();
        if !self.send_ping() {
            return None;
        }
        let deadline = sent + timeout;
        while Instant::now() < deadline {
            if let Some(beat) = self.last_heartbeat().filter(|beat| *beat >= sent) {
                return Some(beat.duration_since(sent));
            }
            thread::sleep(Duration::from_millis(2));
        }
        None
    }

    /// Ask the plugin to shut down, then close its pipes and reap it.
    pub fn shutdown(&self) -> ShutdownOutcome {
        if !self.is_running() {
            self.stop();
            return ShutdownOutcome {
                response: PluginResponse::success("Plugin already stopped", Value::Null),
                forced_kill: false,
            };
        }

        self.shared.set_state(PluginState::Stopping);
        let response = self.call(Request::shutdown(self.next_id()), self.options.shutdown_timeout);
        if !response.success {
            warn!(plugin = %self.name(), reason = %response.message, "shutdown request not acknowledged");
        }
        thread::sleep(self.options.shutdown_settle);
        let stopped = self.stop();
        ShutdownOutcome {
            response,
            forced_kill: stopped == StopOutcome::Killed,
        }
    }

    /// Close stdin, give the child a moment to exit, then kill it. Safe to call on a
    /// plugin whose process already died.
    pub fn stop(&self) -> StopOutcome {
        let _guard = lock(&self.lifecycle);
        let Some(mut process) = lock(&self.process).take() else {
            self.shared.set_state(PluginState::Stopping);
            self.shared.set_state(PluginState::Stopped);
            self.shared.reset_session();
            return StopOutcome::AlreadyStopped;
        };

        self.shared.set_state(PluginState::Stopping);
        drop(lock(&self.stdin).take());

        let outcome = if wait_with_timeout(&mut process.child, self.options.exit_grace).is_some() {
            StopOutcome::Exited
        } else {
            warn!(plugin = %self.name(), "plugin did not exit gracefully, killing");
            let _ = process.child.kill();
            let _ = wait_with_timeout(&mut process.child, self.options.kill_grace);
            StopOutcome::Killed
        };

        self.release(process);
        self.shared.set_state(PluginState::Stopped);
        info!(plugin = %self.name(), ?outcome, "plugin stopped");
        outcome
    }

    fn write(&self, message: &Message) -> Result<(), PluginError> {
        let bytes = message.encode()?;
        let mut stdin = lock(&self.stdin);
        let pipe = stdin.as_mut().ok_or(PluginError::NotRunning)?;
        pipe.write_all(&bytes)
            .and_then(|()| pipe.flush())
            .map_err(PluginError::Write)
    }

    /// A call whose `stream`/`complete`/`error` notifications belong to it.
    fn call_turn(&self, request: Request, timeout: Duration) -> PluginResponse {
        let id = request.id;
        self.shared.begin_turn(id);
        let response = self.call(request, timeout);
        self.shared.end_turn(id, &response);
        response
    }

    /// Register a waiter, write the request, and block until an answer, the deadline,
    /// or evidence that the process is gone.
    fn call(&self, request: Request, timeout: Duration) -> PluginResponse {
        let id = request.id;
        let method = request.method.clone();
        let receiver = self.shared.register(id);
        trace!(plugin = %self.name(), id, %method, "sending request");

        let response = if !self.shared.connected.load(Ordering::SeqCst) {
            PluginResponse::failure(FailureKind::ProcessExited, "Plugin process is not connected")
        } else {
            match self.write(&request.into()) {
                Ok(()) => self.wait_for(&receiver, timeout),
                Err(err) => PluginResponse::failure(
                    FailureKind::Transport,
                    format!("Failed to send request: {err}"),
                ),
            }
        };

        self.shared.unregister(id);
        if response.is_liveness_failure() {
            warn!(plugin = %self.name(), id, %method, reason = %response.message, "request failed");
        }
        response
    }

    fn wait_for(&self, receiver: &Receiver<PluginResponse>, timeout: Duration) -> PluginResponse {
        let deadline = Instant::now() + timeout;
        let mut last_ping: Option<Instant> = None;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return PluginResponse::failure(
                    FailureKind::Timeout,
                    format!("Request timeout after {} ms", timeout.as_millis()),
                );
            }

            if self.is_heartbeat_expired() {
                if !self.is_running() {
                    return PluginResponse::failure(
                        FailureKind::HeartbeatExpired,
                        "Plugin process died (heartbeat expired)",
                    );
                }
                // Alive but quiet: slow, not dead.
                self.shared.touch_heartbeat();
            }

            let interval = self.options.ping_interval;
            let ping_due = last_ping.map_or(true, |sent| now.duration_since(sent) >= interval);
            if ping_due && self.shared.heartbeat_expired(interval) && self.send_ping() {
                last_ping = Some(now);
            }

            let slice = (deadline - now).min(self.options.poll_slice);
            match receiver.recv_timeout(slice) {
                Ok(response) => return response,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return PluginResponse::failure(
                        FailureKind::ProcessExited,
                        "Plugin process exited before responding",
                    )
                }
            }
        }
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        if lock(&self.process).is_some() {
            self.stop();
        }
    }
}

fn read_loop(mut stdout: ChildStdout, shared: Arc<Shared>) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                while let Some(frame) = decoder.next_frame() {
                    match frame {
                        Ok(message) => shared.dispatch(message),
                        Err(err) => {
                            warn!(plugin = %shared.name, error = %err, "discarding malformed frame")
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(plugin = %shared.name, error = %err, "plugin stdout read failed");
                break;
            }
        }
    }
    let partial = decoder.buffered();
    if partial > 0 {
        warn!(plugin = %shared.name, bytes = partial, "plugin stdout closed mid-frame");
    }
    debug!(plugin = %shared.name, "plugin stdout closed");
    shared.disconnect();
}

fn drain_stderr(stderr: ChildStderr, plugin: &str) {
    for line in BufReader::new(stderr).split(b'\n') {
        let Ok(line) = line else { break };
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();
        if !text.is_empty() {
            debug!(plugin, "stderr: {text}");
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
            Ok(None) => return None,
            Err(err) => {
                debug!(error = %err, "failed to poll child status");
                return None;
            }
        }
    }
}

fn join_bounded(handle: Option<JoinHandle<()>>, timeout: Duration, plugin: &str) {
    let Some(handle) = handle else { return };
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(EXIT_POLL);
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!(plugin, "plugin I/O thread still blocked; detaching it");
    }
}

fn is_script(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("py"))
}

fn build_command(manifest: &Manifest) -> Result<Command, PluginError> {
    let executable = &manifest.executable_path;
    if !executable.is_file() {
        return Err(PluginError::ExecutableNotFound(executable.clone()));
    }

    let mut command = if is_script(executable) {
        let python = find_python(&manifest.directory).ok_or(PluginError::InterpreterNotFound)?;
        let mut command = Command::new(python);
        command.arg("-u").arg(executable);
        command
    } else {
        Command::new(executable)
    };

    command
        .current_dir(&manifest.directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(path) = library_path(&manifest.directory) {
        command.env("PYTHONPATH", path);
    }
    Ok(command)
}

/// Interpreter lookup order: override variable, bundled copy two levels above the
/// plugin directory, then PATH.
pub fn find_python(plugin_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = env::var_os(PYTHON_OVERRIDE_ENV)
        .map(PathBuf::from)
        .filter(|path| path.is_file())
    {
        return Some(path);
    }

    let bundled_name = if cfg!(windows) { "python.exe" } else { "python" };
    let bundled = plugin_dir.join("..").join("..").join("python").join(bundled_name);
    if bundled.is_file() {
        return Some(bundled);
    }

    ["python3", "python", "py"]
        .into_iter()
        .find_map(|candidate| which::which(candidate).ok())
}

fn library_path(plugin_dir: &Path) -> Option<OsString> {
    let libs = plugin_dir.join(LIBS_DIR);
    if !libs.is_dir() {
        return None;
    }
    let mut paths = vec![libs];
    if let Some(existing) = env::var_os("PYTHONPATH") {
        paths.extend(env::split_paths(&existing));
    }
    env::join_paths(paths).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Notification, Response};
    use serde_json::json;
    use std::fs;

    #[derive(Default)]
    struct Recorder {
        chunks: Mutex<Vec<String>>,
    }

    impl PluginObserver for Recorder {
        fn on_stream(&self, _plugin: &str, chunk: &str) {
            lock(&self.chunks).push(chunk.to_string());
        }
    }

    fn shared() -> (Shared, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let shared = Shared::new("demo".into(), Duration::from_millis(200), recorder.clone());
        (shared, recorder)
    }

    fn manifest(dir: &Path, executable: &str) -> Manifest {
        Manifest::from_value(
            &json!({
                "manifestVersion": 1,
                "protocol_version": "2.0",
                "executable": executable,
                "persistent": false,
                "functions": [{"name": "noop", "description": "Does nothing"}]
            }),
            dir,
        )
        .unwrap()
    }

    #[test]
    fn transition_table_follows_lifecycle() {
        use PluginState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Executing));
        assert!(Executing.can_transition_to(AwaitingInput));
        assert!(AwaitingInput.can_transition_to(AwaitingInput));
        assert!(AwaitingInput.can_transition_to(Ready));
        assert!(Executing.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Ready));
        assert!(!Stopped.can_transition_to(Executing));
        assert!(!Running.can_transition_to(Executing));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopping));
    }

    #[test]
    fn responses_route_only_to_their_own_id() {
        let (shared, _) = shared();
        let first = shared.register(1);
        let second = shared.register(2);

        shared.dispatch(Response::result(2, json!({"ok": true})).into());

        assert!(first.try_recv().is_err());
        let reply = second.try_recv().expect("id 2 should be resolved");
        assert!(reply.success);
        assert_eq!(reply.data, json!({"ok": true}));
    }

    #[test]
    fn pongs_and_acks_only_refresh_heartbeat() {
        let (shared, _) = shared();
        let waiter = shared.register(5);
        assert!(shared.heartbeat_reference().is_none());

        shared.dispatch(Response::result(5, json!({"timestamp": 1})).into());
        shared.dispatch(Response::result(5, json!({"acknowledged": true})).into());

        assert!(waiter.try_recv().is_err());
        assert!(shared.heartbeat_reference().is_some());
        assert!(!shared.heartbeat_expired(Duration::from_secs(5)));
    }

    #[test]
    fn heartbeat_expires_after_silence() {
        let (shared, _) = shared();
        assert!(!shared.heartbeat_expired(Duration::ZERO));
        *lock(&shared.started_at) = Some(Instant::now() - Duration::from_millis(50));
        assert!(shared.heartbeat_expired(Duration::from_millis(10)));

        shared.dispatch(Notification::log("debug", "still here").into());
        assert!(!shared.heartbeat_expired(Duration::from_millis(10)));
    }

    #[test]
    fn stream_then_complete_accumulates_text() {
        let (shared, recorder) = shared();
        shared.begin_turn(9);
        let waiter = shared.register(9);

        shared.dispatch(Notification::stream("Hello, ").into());
        shared.dispatch(Notification::log("info", "working").into());
        assert!(waiter.try_recv().is_err(), "log must not resolve a waiter");
        shared.dispatch(Notification::stream("world").into());
        shared.dispatch(Notification::complete(true, "!", true).into());

        let reply = waiter.try_recv().unwrap();
        assert!(reply.success);
        assert_eq!(reply.message, "Hello, world!");
        assert!(reply.awaiting_input);
        assert!(shared.awaiting_input.load(Ordering::SeqCst));
        assert_eq!(*lock(&recorder.chunks), vec!["Hello, ", "world"]);
    }

    #[test]
    fn error_without_a_turn_fails_every_waiter() {
        let (shared, _) = shared();
        shared.awaiting_input.store(true, Ordering::SeqCst);
        let a = shared.register(1);
        let b = shared.register(2);

        shared.dispatch(Notification::error(-32602, "missing text").into());

        for waiter in [a, b] {
            let reply = waiter.try_recv().unwrap();
            assert!(!reply.success);
            assert_eq!(reply.error_code, Some(-32602));
            assert_eq!(reply.failure, Some(FailureKind::Rejected));
        }
        assert!(!shared.awaiting_input.load(Ordering::SeqCst));
    }

    #[test]
    fn notifications_resolve_only_the_active_turn() {
        let (shared, _) = shared();
        let handshake = shared.register(1);
        shared.begin_turn(2);
        let turn = shared.register(2);

        shared.dispatch(Notification::complete(true, "done", false).into());

        assert!(handshake.try_recv().is_err());
        assert_eq!(turn.try_recv().unwrap().message, "done");
    }

    #[test]
    fn timed_out_turn_output_is_discarded() {
        let (shared, recorder) = shared();
        shared.begin_turn(1);
        let timeout = PluginResponse::failure(FailureKind::Timeout, "Request timeout after 10 ms");
        shared.end_turn(1, &timeout);

        shared.begin_turn(2);
        let waiter = shared.register(2);
        shared.dispatch(Notification::stream("FIRST").into());
        shared.dispatch(Notification::complete(true, "", false).into());
        assert!(waiter.try_recv().is_err(), "late output must not resolve the next call");
        assert!(lock(&shared.transcript).is_empty());

        shared.dispatch(Notification::stream("2 add 3 = 5").into());
        shared.dispatch(Notification::complete(true, "", false).into());
        let reply = waiter.try_recv().unwrap();
        assert_eq!(reply.message, "2 add 3 = 5");
        assert_eq!(*lock(&recorder.chunks), vec!["2 add 3 = 5"]);
    }

    #[test]
    fn late_error_of_timed_out_turn_is_discarded() {
        let (shared, _) = shared();
        shared.begin_turn(1);
        let timeout = PluginResponse::failure(FailureKind::Timeout, "Request timeout after 10 ms");
        shared.end_turn(1, &timeout);

        shared.begin_turn(2);
        let waiter = shared.register(2);
        shared.dispatch(Notification::error(-32603, "too slow").into());
        assert!(waiter.try_recv().is_err());

        shared.dispatch(Notification::complete(true, "ok", false).into());
        assert!(waiter.try_recv().unwrap().success);
    }

    #[test]
    fn complete_trailing_an_error_is_dropped() {
        let (shared, _) = shared();
        shared.begin_turn(1);
        let first = shared.register(1);
        shared.dispatch(Notification::error(-32602, "missing text").into());
        shared.dispatch(Notification::complete(false, "missing text", false).into());

        let reply = first.try_recv().unwrap();
        assert_eq!(reply.error_code, Some(-32602));
        assert!(first.try_recv().is_err());

        shared.begin_turn(2);
        let second = shared.register(2);
        shared.dispatch(Notification::complete(true, "hi", false).into());
        let reply = second.try_recv().unwrap();
        assert!(reply.success);
        assert_eq!(reply.message, "hi");
    }

    #[test]
    fn next_turn_waits_out_the_error_settle() {
        let (shared, _) = shared();
        shared.begin_turn(1);
        shared.dispatch(Notification::error(-1, "boom").into());

        let started = Instant::now();
        shared.begin_turn(2);
        assert!(started.elapsed() >= Duration::from_millis(150));

        let waiter = shared.register(2);
        shared.dispatch(Notification::complete(false, "legit failure", false).into());
        assert_eq!(waiter.try_recv().unwrap().message, "legit failure");
    }

    #[test]
    fn disconnect_wakes_waiters() {
        let (shared, _) = shared();
        let waiter = shared.register(3);
        shared.disconnect();
        assert!(matches!(
            waiter.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn missing_executable_fails_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = Plugin::from_manifest(manifest(dir.path(), "does-not-exist"));

        let err = plugin.start().unwrap_err();
        assert!(matches!(err, PluginError::ExecutableNotFound(_)));
        assert!(err.to_string().starts_with("Executable not found"));
        assert_eq!(plugin.state(), PluginState::Error);
        assert!(!plugin.is_running());

        let response = plugin.execute("noop", Arguments::new(), &CallOptions::default());
        assert!(!response.success);
        assert_eq!(response.failure, Some(FailureKind::Spawn));
    }

    #[test]
    fn input_and_ping_are_rejected_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = Plugin::from_manifest(manifest(dir.path(), "missing"));

        let response = plugin.send_input("hi", Duration::from_millis(10));
        assert_eq!(response.failure, Some(FailureKind::NotRunning));
        assert_eq!(response.message, "Plugin not running");
        assert!(!plugin.send_ping());
        assert!(!plugin.is_heartbeat_expired());
        assert_eq!(plugin.stop(), StopOutcome::AlreadyStopped);
        assert_eq!(plugin.state(), PluginState::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn quiet_wait_pings_the_plugin() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("mute.sh");
        fs::write(&script, "#!/bin/sh\ncat > received.bin\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let options = PluginOptions {
            initialize_timeout: Duration::from_millis(300),
            ping_interval: Duration::from_millis(50),
            poll_slice: Duration::from_millis(10),
            exit_grace: Duration::from_millis(500),
            ..PluginOptions::default()
        };
        let plugin = Plugin::new(manifest(dir.path(), "mute.sh"), options, Arc::new(NoopObserver));

        let reply = plugin.initialize();
        assert_eq!(reply.failure, Some(FailureKind::Timeout));
        plugin.stop();

        let received = fs::read(dir.path().join("received.bin")).unwrap();
        let text = String::from_utf8_lossy(&received);
        assert!(text.contains("\"method\":\"initialize\""));
        assert!(text.matches("\"method\":\"ping\"").count() >= 2, "{text}");
    }

    #[test]
    fn library_path_prefers_plugin_libs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(library_path(dir.path()).is_none());

        fs::create_dir(dir.path().join(LIBS_DIR)).unwrap();
        let path = library_path(dir.path()).expect("libs dir should be used");
        let first = env::split_paths(&path).next().unwrap();
        assert_eq!(first, dir.path().join(LIBS_DIR));
    }
}
