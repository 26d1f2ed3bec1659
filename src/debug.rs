//! Debug bridge.
//!
//! Debug sessions run user code in a dedicated VM on a stepping thread, so
//! the message loop stays responsive while the debuggee sits paused inside a
//! line hook. The bridge owns the breakpoint set, forwards stepping commands,
//! and answers inspection requests from the snapshot captured at the last
//! pause rather than a thread round trip. One session at a time; starting a
//! second one fails until the first completes or is stopped.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use mlua::{
    DebugEvent as LuaHookEvent, Function, HookTriggers, Lua, MultiValue, Table, Value, VmState,
};
use serde_json::{Value as JsonValue, json};

use crate::engine::stringify_value;
use crate::protocol::{DebugCommand, DebugRequest, DebugResponse};

const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const STOPPED_MESSAGE: &str = "debug session stopped";
const SNAPSHOT_FN: &str = "__replink_snapshot";

/// Lua-side helper that walks the interrupted frame. Called from inside the
/// hook, where level 2 is the frame the hook fired in; locals whose names
/// start with "(" are compiler temporaries and are skipped.
const SNAPSHOT_HELPER: &str = r#"
function __replink_snapshot()
  local frames = {}
  local level = 2
  while true do
    local info = debug.getinfo(level, "nSl")
    if not info then break end
    frames[#frames + 1] = {
      name = info.name,
      line = info.currentline,
      source = info.short_src,
    }
    level = level + 1
  end
  local locals = {}
  local index = 1
  while true do
    local name, value = debug.getlocal(2, index)
    if not name then break end
    if name:sub(1, 1) ~= "(" then
      locals[#locals + 1] = { name = name, kind = type(value), value = tostring(value) }
    end
    index = index + 1
  end
  return frames, locals
end
"#;

enum SteppingCommand {
    Step(StepMode),
    Stop,
}

#[derive(Debug, Clone, Copy)]
enum StepMode {
    Continue,
    In,
    Over,
    Out,
}

impl StepMode {
    fn resolve(self, depth: i64) -> ResolvedStep {
        match self {
            StepMode::Continue => ResolvedStep::Continue,
            StepMode::In => ResolvedStep::In,
            StepMode::Over => ResolvedStep::Over(depth),
            StepMode::Out => ResolvedStep::Out(depth),
        }
    }
}

/// Step intent anchored to the call depth it was issued at.
#[derive(Debug, Clone, Copy)]
enum ResolvedStep {
    Continue,
    In,
    Over(i64),
    Out(i64),
}

impl ResolvedStep {
    fn pauses_at(self, depth: i64) -> bool {
        match self {
            ResolvedStep::Continue => false,
            ResolvedStep::In => true,
            ResolvedStep::Over(base) => depth <= base,
            ResolvedStep::Out(base) => depth < base,
        }
    }
}

enum SessionEvent {
    Paused(PauseSnapshot),
    Completed {
        result: Option<String>,
        error: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct PauseSnapshot {
    line: u32,
    frames: Vec<FrameSnapshot>,
    locals: Vec<LocalSnapshot>,
}

#[derive(Debug, Clone)]
struct FrameSnapshot {
    name: Option<String>,
    line: Option<u32>,
    source: Option<String>,
}

#[derive(Debug, Clone)]
struct LocalSnapshot {
    name: String,
    kind: String,
    value: String,
}

struct ActiveSession {
    file: String,
    cmd_tx: mpsc::Sender<SteppingCommand>,
    event_rx: mpsc::Receiver<SessionEvent>,
    thread: Option<thread::JoinHandle<()>>,
    pause: Option<PauseSnapshot>,
    stop_flag: Arc<AtomicBool>,
}

pub struct DebugBridge {
    breakpoints: Arc<Mutex<BTreeSet<u32>>>,
    active: Option<ActiveSession>,
}

impl DebugBridge {
    pub fn new() -> Self {
        DebugBridge {
            breakpoints: Arc::new(Mutex::new(BTreeSet::new())),
            active: None,
        }
    }

    /// Answer one debug request. Every request gets exactly one response;
    /// commands that decode to none of the known sub-commands fail naming the
    /// keys that did not match.
    pub fn handle(&mut self, request: &DebugRequest) -> DebugResponse {
        match serde_json::from_value::<DebugCommand>(request.command.clone()) {
            Ok(command) => self.dispatch(&request.id, command),
            Err(_) => {
                let keys = command_keys(&request.command);
                DebugResponse::failure(
                    request.id.clone(),
                    format!("unsupported debug command: {}", keys.join(", ")),
                    json!({ "unmatched_keys": keys }),
                )
            }
        }
    }

    /// Drop the active session, if any, and clear every breakpoint.
    pub fn reset(&mut self) {
        self.abandon_session();
        self.breakpoints.lock().unwrap().clear();
    }

    fn dispatch(&mut self, id: &str, command: DebugCommand) -> DebugResponse {
        match command {
            DebugCommand::StartDebug { file, code } => self.start(id, file, code),
            DebugCommand::SetBreakpoint { file, line } => {
                self.breakpoints.lock().unwrap().insert(line);
                DebugResponse::ok(id, json!({ "status": "ok", "file": file, "line": line }))
            }
            DebugCommand::RemoveBreakpoint { file, line } => {
                self.breakpoints.lock().unwrap().remove(&line);
                DebugResponse::ok(id, json!({ "status": "ok", "file": file, "line": line }))
            }
            DebugCommand::StepOver {} => self.step(id, StepMode::Over),
            DebugCommand::StepIn {} => self.step(id, StepMode::In),
            DebugCommand::StepOut {} => self.step(id, StepMode::Out),
            DebugCommand::Continue {} => self.step(id, StepMode::Continue),
            DebugCommand::GetVariables {} => self.variables(id),
            DebugCommand::GetStacktrace {} => self.stacktrace(id),
            DebugCommand::StopDebug {} => self.stop(id),
        }
    }

    fn start(&mut self, id: &str, file: String, code: String) -> DebugResponse {
        if self.active.is_some() {
            return DebugResponse::failure(id, "a debug session is already active", JsonValue::Null);
        }
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread = spawn_debuggee(
            file.clone(),
            code,
            Arc::clone(&self.breakpoints),
            Arc::clone(&stop_flag),
            cmd_rx,
            event_tx,
        );
        self.active = Some(ActiveSession {
            file,
            cmd_tx,
            event_rx,
            thread: Some(thread),
            pause: None,
            stop_flag,
        });
        self.consume_event(id)
    }

    fn step(&mut self, id: &str, mode: StepMode) -> DebugResponse {
        let send_failed;
        {
            let Some(session) = self.active.as_mut() else {
                return DebugResponse::failure(id, "no active debug session", JsonValue::Null);
            };
            if session.pause.is_none() {
                return DebugResponse::failure(id, "debug session is not paused", JsonValue::Null);
            }
            session.pause = None;
            send_failed = session.cmd_tx.send(SteppingCommand::Step(mode)).is_err();
        }
        if send_failed {
            self.abandon_session();
            return DebugResponse::failure(id, "debug session ended unexpectedly", JsonValue::Null);
        }
        self.consume_event(id)
    }

    /// Wait for the debuggee to pause or complete and turn that into the
    /// response for the command that set it running.
    fn consume_event(&mut self, id: &str) -> DebugResponse {
        enum Outcome {
            Paused { file: String, line: u32 },
            Completed {
                result: Option<String>,
                error: Option<String>,
            },
            TimedOut,
        }
        let outcome = {
            let Some(session) = self.active.as_mut() else {
                return DebugResponse::failure(id, "no active debug session", JsonValue::Null);
            };
            match session.event_rx.recv_timeout(EVENT_WAIT_TIMEOUT) {
                Ok(SessionEvent::Paused(snapshot)) => {
                    let line = snapshot.line;
                    let file = session.file.clone();
                    session.pause = Some(snapshot);
                    Outcome::Paused { file, line }
                }
                Ok(SessionEvent::Completed { result, error }) => {
                    Outcome::Completed { result, error }
                }
                Err(_) => Outcome::TimedOut,
            }
        };
        match outcome {
            Outcome::Paused { file, line } => DebugResponse::ok(
                id,
                json!({ "status": "paused", "file": file, "line": line }),
            ),
            Outcome::Completed { result, error } => {
                self.finish_session();
                DebugResponse::ok(
                    id,
                    json!({ "status": "completed", "result": result, "error": error }),
                )
            }
            Outcome::TimedOut => {
                self.abandon_session();
                DebugResponse::failure(
                    id,
                    "debug session did not report within the wait deadline",
                    JsonValue::Null,
                )
            }
        }
    }

    fn variables(&self, id: &str) -> DebugResponse {
        match self.active.as_ref().and_then(|s| s.pause.as_ref()) {
            Some(snapshot) => {
                let variables: Vec<JsonValue> = snapshot
                    .locals
                    .iter()
                    .map(|l| json!({ "name": l.name, "kind": l.kind, "value": l.value }))
                    .collect();
                DebugResponse::ok(id, json!({ "variables": variables }))
            }
            None => DebugResponse::failure(id, "debug session is not paused", JsonValue::Null),
        }
    }

    fn stacktrace(&self, id: &str) -> DebugResponse {
        match self.active.as_ref().and_then(|s| s.pause.as_ref()) {
            Some(snapshot) => {
                let frames: Vec<JsonValue> = snapshot
                    .frames
                    .iter()
                    .map(|f| json!({ "name": f.name, "line": f.line, "source": f.source }))
                    .collect();
                DebugResponse::ok(id, json!({ "frames": frames }))
            }
            None => DebugResponse::failure(id, "debug session is not paused", JsonValue::Null),
        }
    }

    fn stop(&mut self, id: &str) -> DebugResponse {
        enum Outcome {
            Stopped,
            TimedOut,
        }
        let outcome = {
            let Some(session) = self.active.as_mut() else {
                return DebugResponse::failure(id, "no active debug session", JsonValue::Null);
            };
            session.stop_flag.store(true, Ordering::SeqCst);
            let _ = session.cmd_tx.send(SteppingCommand::Stop);
            let deadline = Instant::now() + EVENT_WAIT_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match session.event_rx.recv_timeout(remaining) {
                    Ok(SessionEvent::Completed { .. }) => break Outcome::Stopped,
                    // A breakpoint pause can race the stop; the queued Stop
                    // command resolves it on the next receive.
                    Ok(SessionEvent::Paused(_)) => continue,
                    Err(_) => break Outcome::TimedOut,
                }
            }
        };
        match outcome {
            Outcome::Stopped => {
                self.finish_session();
                DebugResponse::ok(id, json!({ "status": "stopped" }))
            }
            Outcome::TimedOut => {
                self.abandon_session();
                DebugResponse::failure(
                    id,
                    "debug session did not stop within the wait deadline",
                    JsonValue::Null,
                )
            }
        }
    }

    /// The debuggee reported completion; reap its thread.
    fn finish_session(&mut self) {
        if let Some(mut session) = self.active.take() {
            if let Some(handle) = session.thread.take() {
                let _ = handle.join();
            }
        }
    }

    /// Give up on a session that is not responding. The stop flag ends it at
    /// the next hook point; its thread is left to finish on its own.
    fn abandon_session(&mut self) {
        if let Some(session) = self.active.take() {
            session.stop_flag.store(true, Ordering::SeqCst);
            let _ = session.cmd_tx.send(SteppingCommand::Stop);
        }
    }
}

fn spawn_debuggee(
    file: String,
    code: String,
    breakpoints: Arc<Mutex<BTreeSet<u32>>>,
    stop_flag: Arc<AtomicBool>,
    cmd_rx: mpsc::Receiver<SteppingCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let completion_tx = event_tx.clone();
        let completed = match run_debuggee(&file, code, breakpoints, stop_flag, cmd_rx, event_tx) {
            Ok(result) => SessionEvent::Completed {
                result,
                error: None,
            },
            Err(err) => SessionEvent::Completed {
                result: None,
                error: Some(err.to_string()),
            },
        };
        let _ = completion_tx.send(completed);
    })
}

fn run_debuggee(
    file: &str,
    code: String,
    breakpoints: Arc<Mutex<BTreeSet<u32>>>,
    stop_flag: Arc<AtomicBool>,
    cmd_rx: mpsc::Receiver<SteppingCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> mlua::Result<Option<String>> {
    // The debug standard library stays out of the evaluator VM; the debuggee
    // VM needs it for frame and local inspection.
    let lua = unsafe { Lua::unsafe_new() };
    lua.load(SNAPSHOT_HELPER).set_name("@debugger").exec()?;

    let depth = Cell::new(0i64);
    let mode = Cell::new(ResolvedStep::Continue);
    lua.set_hook(
        HookTriggers::new().every_line().on_calls().on_returns(),
        move |lua, debug| {
            if stop_flag.load(Ordering::SeqCst) {
                return Err(mlua::Error::RuntimeError(STOPPED_MESSAGE.to_string()));
            }
            match debug.event() {
                LuaHookEvent::Call => {
                    depth.set(depth.get() + 1);
                    Ok(VmState::Continue)
                }
                LuaHookEvent::Ret => {
                    depth.set(depth.get() - 1);
                    Ok(VmState::Continue)
                }
                // A tail call replaces the frame, so depth is unchanged.
                LuaHookEvent::TailCall => Ok(VmState::Continue),
                LuaHookEvent::Line => {
                    let line = debug.curr_line();
                    if line < 0 {
                        return Ok(VmState::Continue);
                    }
                    let line = line as u32;
                    let at_breakpoint = breakpoints.lock().unwrap().contains(&line);
                    if !(at_breakpoint || mode.get().pauses_at(depth.get())) {
                        return Ok(VmState::Continue);
                    }
                    let snapshot = capture_snapshot(lua, line);
                    if event_tx.send(SessionEvent::Paused(snapshot)).is_err() {
                        return Err(mlua::Error::RuntimeError(STOPPED_MESSAGE.to_string()));
                    }
                    match cmd_rx.recv() {
                        Ok(SteppingCommand::Step(step)) => {
                            mode.set(step.resolve(depth.get()));
                            Ok(VmState::Continue)
                        }
                        Ok(SteppingCommand::Stop) | Err(_) => {
                            Err(mlua::Error::RuntimeError(STOPPED_MESSAGE.to_string()))
                        }
                    }
                }
                _ => Ok(VmState::Continue),
            }
        },
    );

    let values = lua
        .load(code)
        .set_name(format!("@{file}"))
        .eval::<MultiValue>()?;
    lua.remove_hook();
    let value = values.into_iter().next().unwrap_or(Value::Nil);
    Ok(stringify_value(&lua, &value))
}

/// Best effort: inspection failures produce an empty snapshot, never a hook
/// error that would kill the debuggee.
fn capture_snapshot(lua: &Lua, line: u32) -> PauseSnapshot {
    let mut snapshot = PauseSnapshot {
        line,
        frames: Vec::new(),
        locals: Vec::new(),
    };
    let Ok(helper) = lua.globals().get::<Function>(SNAPSHOT_FN) else {
        return snapshot;
    };
    let Ok((frames, locals)) = helper.call::<(Table, Table)>(()) else {
        return snapshot;
    };
    for entry in frames.sequence_values::<Table>() {
        let Ok(frame) = entry else { continue };
        snapshot.frames.push(FrameSnapshot {
            name: frame.get::<Option<String>>("name").ok().flatten(),
            line: frame.get::<Option<u32>>("line").ok().flatten(),
            source: frame.get::<Option<String>>("source").ok().flatten(),
        });
    }
    for entry in locals.sequence_values::<Table>() {
        let Ok(local) = entry else { continue };
        let Some(name) = local.get::<Option<String>>("name").ok().flatten() else {
            continue;
        };
        snapshot.locals.push(LocalSnapshot {
            name,
            kind: local
                .get::<Option<String>>("kind")
                .ok()
                .flatten()
                .unwrap_or_default(),
            value: local
                .get::<Option<String>>("value")
                .ok()
                .flatten()
                .unwrap_or_default(),
        });
    }
    snapshot
}

fn command_keys(command: &JsonValue) -> Vec<String> {
    match command {
        JsonValue::Object(map) => map.keys().cloned().collect(),
        JsonValue::String(s) => vec![s.clone()],
        JsonValue::Null => vec!["<null>".to_string()],
        JsonValue::Bool(_) => vec!["<boolean>".to_string()],
        JsonValue::Number(_) => vec!["<number>".to_string()],
        JsonValue::Array(_) => vec!["<array>".to_string()],
    }
}
