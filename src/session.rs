//! Worker session lifecycle and message loop.
//!
//! A session owns the engine, the debug bridge, and both channel ends. The
//! worker binds control then output, printing a stdout marker after each step
//! and a final marker immediately before the first blocking read, so the host
//! can sequence its connects without polling. The loop reads one request line
//! at a time and never exits on bad input; only end of stream or a read error
//! ends the session.

use std::error::Error;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use serde_json::json;

use crate::channel::{self, ChannelError, SessionAddress};
use crate::debug::DebugBridge;
use crate::diagnostics;
use crate::display::DisplayPipeline;
use crate::engine::LuaEngine;
use crate::events;
use crate::protocol::{
    ExecutionResult, ExecutionType, HostLineOutcome, HostToWorkerMessage, WorkerToHostMessage,
    classify_host_line,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    ControlChannelBound,
    ControlChannelConnected,
    MessageLoopReady,
    Ready,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::ControlChannelBound => "control_channel_bound",
            SessionState::ControlChannelConnected => "control_channel_connected",
            SessionState::MessageLoopReady => "message_loop_ready",
            SessionState::Ready => "ready",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum SessionError {
    Channel(ChannelError),
    Engine(mlua::Error),
    MissingSessionName,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Channel(err) => write!(f, "channel error: {err}"),
            SessionError::Engine(err) => write!(f, "lua engine error: {err}"),
            SessionError::MissingSessionName => {
                write!(f, "{} is not set; worker mode requires a session id", channel::SESSION_ID_ENV)
            }
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionError::Channel(err) => Some(err),
            SessionError::Engine(err) => Some(err),
            SessionError::MissingSessionName => None,
        }
    }
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        SessionError::Channel(err)
    }
}

impl From<mlua::Error> for SessionError {
    fn from(err: mlua::Error) -> Self {
        SessionError::Engine(err)
    }
}

pub struct Session {
    state: SessionState,
    control: BufReader<Box<dyn Read + Send>>,
    output_tx: mpsc::Sender<WorkerToHostMessage>,
    writer: Option<thread::JoinHandle<()>>,
    engine: LuaEngine,
    bridge: DebugBridge,
    emit_markers: bool,
}

impl Session {
    /// Bind both endpoints for `session_name`, publish the readiness markers,
    /// and wait for the host to connect. Bind failures are fatal; the caller
    /// exits nonzero and the host reads the failure from stdout silence.
    pub fn bind(session_name: &str, runtime_dir: Option<&Path>) -> Result<Session, SessionError> {
        let address = SessionAddress::derive(session_name, runtime_dir)?;
        diagnostics::startup_log(format!("worker binding {}", address.describe()));
        events::log(
            "session_state",
            json!({ "state": SessionState::Uninitialized.as_str() }),
        );

        let control_listener = channel::bind_control(&address)?;
        events::log(
            "session_state",
            json!({ "state": SessionState::ControlChannelBound.as_str() }),
        );
        emit_marker(channel::CONTROL_BOUND_MARKER);

        let output_listener = channel::bind_output(&address)?;
        emit_marker(channel::OUTPUT_BOUND_MARKER);

        // Accept in bind order; the host connects control first.
        let control = control_listener.accept()?;
        let output = output_listener.accept()?;
        diagnostics::startup_log("worker channels connected");
        Session::assemble(control, output, true)
    }

    /// Build a session over already-connected streams. Used where the channel
    /// layer is provided by the caller; no markers are printed.
    pub fn attach(
        control: Box<dyn Read + Send>,
        output: Box<dyn Write + Send>,
    ) -> Result<Session, SessionError> {
        Session::assemble(control, output, false)
    }

    fn assemble(
        control: Box<dyn Read + Send>,
        output: Box<dyn Write + Send>,
        emit_markers: bool,
    ) -> Result<Session, SessionError> {
        let (output_tx, output_rx) = mpsc::channel();
        let writer = channel::spawn_writer(output_rx, output);
        let engine = LuaEngine::new(DisplayPipeline::new(output_tx.clone()))?;
        let mut session = Session {
            state: SessionState::Uninitialized,
            control: BufReader::new(control),
            output_tx,
            writer: Some(writer),
            engine,
            bridge: DebugBridge::new(),
            emit_markers,
        };
        session.set_state(SessionState::ControlChannelConnected);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Clear all user state without tearing the channels down: fresh VM,
    /// no breakpoints, no debug session.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.engine.reset()?;
        self.bridge.reset();
        events::log("session_reset", json!({}));
        Ok(())
    }

    /// Serve requests until the control channel closes.
    pub fn run(&mut self) {
        self.set_state(SessionState::MessageLoopReady);
        if self.emit_markers {
            emit_marker(channel::LOOP_LIVE_MARKER);
        }
        self.set_state(SessionState::Ready);
        let mut line = String::new();
        loop {
            line.clear();
            match self.control.read_line(&mut line) {
                Ok(0) => {
                    events::log("control_channel_eof", json!({}));
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    self.handle_line(trimmed);
                }
                Err(err) => {
                    events::log("control_read_error", json!({ "error": err.to_string() }));
                    break;
                }
            }
        }
        self.set_state(SessionState::Terminated);
    }

    fn handle_line(&mut self, line: &str) {
        match classify_host_line(line) {
            HostLineOutcome::Message(message) => self.handle_message(message),
            HostLineOutcome::UnknownTag(tag) => {
                // No reply for unknown tags; the event log is the only trace.
                events::log("unknown_tag_dropped", json!({ "tag": tag }));
            }
            HostLineOutcome::Malformed { id, detail } => {
                events::log("malformed_request", json!({ "id": id, "detail": detail }));
                let result = ExecutionResult::failed(
                    id,
                    ExecutionType::ReplExecution,
                    format!("unparseable request: {detail}"),
                    0,
                );
                self.send(WorkerToHostMessage::ExecutionComplete(result));
            }
        }
    }

    fn handle_message(&mut self, message: HostToWorkerMessage) {
        match message {
            HostToWorkerMessage::CodeExecution(request) => {
                events::log(
                    "execution_started",
                    json!({ "id": request.id, "kind": "code" }),
                );
                let result = self.engine.execute(&request);
                events::log(
                    "execution_finished",
                    json!({
                        "id": result.id,
                        "success": result.success,
                        "duration_ms": result.duration_ms,
                    }),
                );
                self.send(WorkerToHostMessage::ExecutionComplete(result));
            }
            HostToWorkerMessage::ApiRequest(request) => {
                events::log(
                    "execution_started",
                    json!({ "id": request.id, "kind": "api" }),
                );
                let result = self.engine.execute(&request);
                events::log(
                    "execution_finished",
                    json!({
                        "id": result.id,
                        "success": result.success,
                        "duration_ms": result.duration_ms,
                    }),
                );
                self.send(WorkerToHostMessage::ApiResponse(result));
            }
            HostToWorkerMessage::DebugMessage(request) => {
                let response = self.bridge.handle(&request);
                events::log(
                    "debug_command_handled",
                    json!({ "id": response.id, "success": response.success }),
                );
                self.send(WorkerToHostMessage::DebugMessageResponse(response));
            }
            HostToWorkerMessage::ConnectionTest { id } => {
                self.send(WorkerToHostMessage::ConnectionTestResponse {
                    id,
                    status: "ok".to_string(),
                });
            }
            HostToWorkerMessage::GetWorkspaceVariables { id } => {
                let variables = self.engine.workspace_variables();
                self.send(WorkerToHostMessage::WorkspaceVariables { id, variables });
            }
            HostToWorkerMessage::GetVariableValue { id, name } => {
                let (kind, value) = self.engine.variable_value(&name);
                self.send(WorkerToHostMessage::VariableValue {
                    id,
                    name,
                    kind,
                    value,
                });
            }
        }
    }

    fn send(&self, message: WorkerToHostMessage) {
        let _ = self.output_tx.send(message);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        events::log("session_state", json!({ "state": state.as_str() }));
    }

    /// Tear down in order: every sender clone, including the display pipeline
    /// inside the VM, must drop before the writer join or the join never
    /// returns.
    pub fn shutdown(self) {
        let Session {
            output_tx,
            writer,
            engine,
            bridge,
            control,
            ..
        } = self;
        drop(engine);
        drop(bridge);
        drop(control);
        drop(output_tx);
        if let Some(handle) = writer {
            let _ = handle.join();
        }
    }
}

fn emit_marker(marker: &str) {
    let mut stdout = io::stdout();
    let _ = writeln!(stdout, "{marker}");
    let _ = stdout.flush();
}

/// Worker mode is chosen by argv alone so it wins over any other flag
/// handling in the launcher.
pub fn is_worker_mode() -> bool {
    std::env::args().nth(1).as_deref() == Some("--worker")
}

/// Entry point for `replink --worker`: bind, serve, drain, exit.
pub fn run_worker() -> Result<(), SessionError> {
    let session_name = std::env::var(channel::SESSION_ID_ENV)
        .ok()
        .filter(|name| !name.is_empty())
        .ok_or(SessionError::MissingSessionName)?;
    #[cfg(unix)]
    crate::engine::install_interrupt_handler();
    let mut session = Session::bind(&session_name, None)?;
    session.run();
    session.shutdown();
    Ok(())
}
