//! Reference plugin speaking the framed JSON-RPC protocol over stdin/stdout.
//!
//! Functions: `echo {text}`, `greet {name?}` (opens a session) and
//! `calculate {operation, a, b}`. A `behavior.json` in the working directory can make
//! it misbehave on purpose; see [`Behavior`].

use plugbench_host::protocol::{
    decode_body, decode_length, method, timestamp_millis, ErrorCode, ExecuteParams, Message,
    Notification, Request, Response, HEADER_LEN,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

const BEHAVIOR_FILE: &str = "behavior.json";
const SESSION_END_WORDS: [&str; 4] = ["exit", "quit", "done", "bye"];

/// Fault injection switches.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Behavior {
    /// Keep running after `shutdown` and after stdin closes.
    ignore_shutdown: bool,
    /// Stop answering anything once `initialize` has been answered.
    silent_after_init: bool,
    /// 1-based `execute` call numbers that fail with PLUGIN_ERROR.
    fail_calls: Vec<u32>,
    /// Sleep before answering each `execute`.
    delay_ms: u64,
    /// Follow every `error` with a `complete(false)` after this many milliseconds.
    trailing_complete_ms: Option<u64>,
    /// Write a diagnostic line to stderr before answering each `execute`.
    stderr_chatter: bool,
}

impl Behavior {
    fn load() -> Self {
        fs::read_to_string(BEHAVIOR_FILE)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }
}

struct ExamplePlugin<W> {
    out: W,
    behavior: Behavior,
    calls: u32,
    session_open: bool,
    silent: bool,
}

enum Flow {
    Continue,
    Exit,
}

impl<W: Write> ExamplePlugin<W> {
    fn new(out: W, behavior: Behavior) -> Self {
        Self {
            out,
            behavior,
            calls: 0,
            session_open: false,
            silent: false,
        }
    }

    /// Frame every message into one buffer and write it in one go.
    fn send(&mut self, messages: Vec<Message>) -> io::Result<()> {
        let mut buffer = Vec::new();
        for message in messages {
            let framed = message
                .encode()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            buffer.extend_from_slice(&framed);
        }
        self.out.write_all(&buffer)?;
        self.out.flush()
    }

    /// A failed turn ends with its `error` alone.
    fn fail(&mut self, code: ErrorCode, message: &str) -> io::Result<()> {
        self.send(vec![Notification::error(code.code(), message).into()])?;
        if let Some(delay) = self.behavior.trailing_complete_ms {
            thread::sleep(Duration::from_millis(delay));
            self.send(vec![Notification::complete(false, message, false).into()])?;
        }
        Ok(())
    }

    fn handle(&mut self, message: Message) -> io::Result<Flow> {
        let Message::Request(request) = message else {
            return Ok(Flow::Continue);
        };
        if self.silent {
            return Ok(Flow::Continue);
        }

        match request.method.as_str() {
            method::INITIALIZE => {
                self.send(vec![
                    Response::result(request.id, json!({ "success": true, "name": "example-plugin" })).into(),
                    Notification::log("info", "example plugin initialized").into(),
                ])?;
                self.silent = self.behavior.silent_after_init;
            }
            method::PING => {
                let timestamp = request
                    .params
                    .get("timestamp")
                    .cloned()
                    .unwrap_or_else(|| Value::from(timestamp_millis()));
                self.send(vec![Response::result(request.id, json!({ "timestamp": timestamp })).into()])?;
            }
            method::SHUTDOWN => {
                self.send(vec![Response::result(request.id, json!({ "success": true })).into()])?;
                if !self.behavior.ignore_shutdown {
                    return Ok(Flow::Exit);
                }
            }
            method::EXECUTE => self.execute(&request)?,
            method::INPUT => self.input(&request)?,
            other => {
                let code = ErrorCode::MethodNotFound.code();
                self.send(vec![Response::error(request.id, code, format!("Method not found: {other}")).into()])?;
            }
        }
        Ok(Flow::Continue)
    }

    fn execute(&mut self, request: &Request) -> io::Result<()> {
        self.calls += 1;
        if self.behavior.stderr_chatter {
            eprintln!("example plugin: handling execute #{}", self.calls);
        }
        if self.behavior.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.behavior.delay_ms));
        }
        if self.behavior.fail_calls.contains(&self.calls) {
            let message = format!("Simulated failure on call {}", self.calls);
            return self.fail(ErrorCode::PluginError, &message);
        }

        let Ok(params) = serde_json::from_value::<ExecuteParams>(request.params.clone()) else {
            return self.fail(ErrorCode::InvalidParams, "Malformed execute parameters");
        };
        let args = &params.arguments;
        match params.function.as_str() {
            "echo" => match args.get("text").and_then(Value::as_str) {
                Some(text) => self.send(vec![
                    Notification::stream(text).into(),
                    Notification::complete(true, "", false).into(),
                ]),
                None => self.fail(ErrorCode::InvalidParams, "Missing required parameter: text"),
            },
            "greet" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or("there");
                self.session_open = true;
                let greeting = format!("Hello, {name}! Say something, or 'bye' to finish.");
                self.send(vec![Notification::complete(true, &greeting, true).into()])
            }
            "calculate" => match calculate(args) {
                Ok(answer) => self.send(vec![Notification::complete(true, &answer, false).into()]),
                Err(reason) => self.fail(ErrorCode::InvalidParams, &reason),
            },
            other => self.fail(ErrorCode::MethodNotFound, &format!("Unknown function: {other}")),
        }
    }

    fn input(&mut self, request: &Request) -> io::Result<()> {
        self.send(vec![Response::result(request.id, json!({ "acknowledged": true })).into()])?;
        let content = request
            .params
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        if !self.session_open {
            return self.fail(ErrorCode::InvalidRequest, "No open session");
        }
        if SESSION_END_WORDS.contains(&content.to_ascii_lowercase().as_str()) {
            self.session_open = false;
            return self.send(vec![Notification::complete(true, "Goodbye!", false).into()]);
        }
        let reply = format!("You said: {content}");
        self.send(vec![
            Notification::stream(&reply).into(),
            Notification::complete(true, "", true).into(),
        ])
    }
}

fn calculate(args: &Map<String, Value>) -> Result<String, String> {
    let operation = args
        .get("operation")
        .and_then(Value::as_str)
        .ok_or("Missing required parameter: operation")?;
    let a = args.get("a").and_then(Value::as_f64).ok_or("Missing required parameter: a")?;
    let b = args.get("b").and_then(Value::as_f64).ok_or("Missing required parameter: b")?;
    let result = match operation {
        "add" => a + b,
        "subtract" => a - b,
        "multiply" => a * b,
        "divide" if b == 0.0 => return Err("Division by zero".to_string()),
        "divide" => a / b,
        other => return Err(format!("Unknown operation: {other}")),
    };
    Ok(format!("{a} {operation} {b} = {result}"))
}

/// Read one frame; `None` at end of input.
fn read_message(input: &mut impl Read) -> io::Result<Option<Result<Message, String>>> {
    let mut header = [0u8; HEADER_LEN];
    match input.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = decode_length(&header).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut body = vec![0u8; len];
    input.read_exact(&mut body)?;
    Ok(Some(decode_body(&body).map_err(|err| err.to_string())))
}

fn main() -> io::Result<()> {
    let behavior = Behavior::load();
    let ignore_shutdown = behavior.ignore_shutdown;
    let mut plugin = ExamplePlugin::new(io::stdout().lock(), behavior);
    let mut input = io::stdin().lock();

    while let Some(message) = read_message(&mut input)? {
        let flow = match message {
            Ok(message) => plugin.handle(message)?,
            Err(reason) => {
                plugin.send(vec![Notification::log("error", &format!("Unreadable message: {reason}")).into()])?;
                Flow::Continue
            }
        };
        if let Flow::Exit = flow {
            return Ok(());
        }
    }

    if ignore_shutdown {
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugbench_host::protocol::FrameDecoder;
    use plugbench_host::protocol::PluginEvent;

    fn sent(plugin: &ExamplePlugin<Vec<u8>>) -> Vec<Message> {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&plugin.out);
        std::iter::from_fn(|| decoder.next_frame()).map(Result::unwrap).collect()
    }

    fn events(messages: &[Message]) -> Vec<PluginEvent> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Notification(n) => Some(n.event()),
                _ => None,
            })
            .collect()
    }

    fn execute(plugin: &mut ExamplePlugin<Vec<u8>>, function: &str, arguments: Value) {
        let params = ExecuteParams {
            function: function.into(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
            ..ExecuteParams::default()
        };
        plugin.handle(Request::execute(1, &params).into()).unwrap();
    }

    #[test]
    fn echo_streams_the_text() {
        let mut plugin = ExamplePlugin::new(Vec::new(), Behavior::default());
        execute(&mut plugin, "echo", json!({"text": "hi"}));
        let events = events(&sent(&plugin));
        assert_eq!(events[0], PluginEvent::Stream { data: "hi".into() });
        assert!(matches!(events[1], PluginEvent::Complete { success: true, .. }));
    }

    #[test]
    fn unknown_function_reports_method_not_found() {
        let mut plugin = ExamplePlugin::new(Vec::new(), Behavior::default());
        execute(&mut plugin, "nope", json!({}));
        let events = events(&sent(&plugin));
        assert_eq!(events.len(), 1, "a failure ends with its error alone");
        assert!(matches!(events[0], PluginEvent::Error { code: -32601, .. }));
    }

    #[test]
    fn trailing_complete_follows_the_error() {
        let behavior = Behavior {
            trailing_complete_ms: Some(0),
            ..Behavior::default()
        };
        let mut plugin = ExamplePlugin::new(Vec::new(), behavior);
        execute(&mut plugin, "echo", json!({}));
        let events = events(&sent(&plugin));
        assert!(matches!(events[0], PluginEvent::Error { code: -32602, .. }));
        assert!(matches!(events[1], PluginEvent::Complete { success: false, .. }));
    }

    #[test]
    fn scheduled_failures_hit_the_right_calls() {
        let behavior = Behavior {
            fail_calls: vec![2],
            ..Behavior::default()
        };
        let mut plugin = ExamplePlugin::new(Vec::new(), behavior);
        execute(&mut plugin, "echo", json!({"text": "a"}));
        execute(&mut plugin, "echo", json!({"text": "b"}));
        let events = events(&sent(&plugin));
        assert!(events.contains(&PluginEvent::Error {
            code: -1,
            message: "Simulated failure on call 2".into()
        }));
    }

    #[test]
    fn calculate_divides_and_rejects_zero() {
        let args = json!({"operation": "divide", "a": 9, "b": 3});
        assert_eq!(calculate(args.as_object().unwrap()).unwrap(), "9 divide 3 = 3");
        let args = json!({"operation": "divide", "a": 1, "b": 0});
        assert_eq!(calculate(args.as_object().unwrap()).unwrap_err(), "Division by zero");
    }
}
