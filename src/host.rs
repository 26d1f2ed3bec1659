//! Host-side worker management.
//!
//! The host spawns its own executable in worker mode, sequences the readiness
//! handshake off the worker's stdout markers, and talks over the two session
//! channels. A reader thread files responses into an inbox keyed by request
//! id and display pushes into a bounded artifact queue; callers block on a
//! condvar until their response arrives or a deadline passes. Shutdown closes
//! the control channel, waits for a clean exit, and joins every thread before
//! returning, so a relaunch never races a stale reader.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::channel::{self, ChannelError, SessionAddress};
use crate::diagnostics;
use crate::events;
use crate::protocol::{
    DebugCommand, DebugRequest, DebugResponse, DisplayArtifact, ExecutionRequest, ExecutionResult,
    ExecutionType, HostToWorkerMessage, VariableInfo, WorkerToHostMessage, decode_worker_line,
};

const MARKERS: [&str; 3] = [
    channel::CONTROL_BOUND_MARKER,
    channel::OUTPUT_BOUND_MARKER,
    channel::LOOP_LIVE_MARKER,
];

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub enum HostError {
    Spawn(io::Error),
    Handshake { detail: String },
    Channel(ChannelError),
    Timeout { waiting_for: String },
    ChannelClosed,
    UnexpectedResponse(String),
    Encode(serde_json::Error),
    Io(io::Error),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Spawn(err) => write!(f, "failed to spawn worker: {err}"),
            HostError::Handshake { detail } => write!(f, "worker handshake failed: {detail}"),
            HostError::Channel(err) => write!(f, "{err}"),
            HostError::Timeout { waiting_for } => write!(f, "timed out waiting for {waiting_for}"),
            HostError::ChannelClosed => write!(f, "worker channel closed"),
            HostError::UnexpectedResponse(detail) => {
                write!(f, "unexpected response from worker: {detail}")
            }
            HostError::Encode(err) => write!(f, "failed to encode request: {err}"),
            HostError::Io(err) => write!(f, "worker io error: {err}"),
        }
    }
}

impl Error for HostError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HostError::Spawn(err) | HostError::Io(err) => Some(err),
            HostError::Channel(err) => Some(err),
            HostError::Encode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ChannelError> for HostError {
    fn from(err: ChannelError) -> Self {
        HostError::Channel(err)
    }
}

/// Display pushes waiting for the consumer. Bounded: past `capacity` the
/// oldest artifact is dropped and counted rather than growing without limit.
pub struct ArtifactQueue {
    queue: VecDeque<DisplayArtifact>,
    capacity: usize,
    dropped: u64,
}

impl ArtifactQueue {
    pub fn new(capacity: usize) -> Self {
        ArtifactQueue {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, artifact: DisplayArtifact) {
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(artifact);
    }

    pub fn drain(&mut self) -> Vec<DisplayArtifact> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

struct Inbox {
    responses: VecDeque<WorkerToHostMessage>,
    artifacts: ArtifactQueue,
    disconnected: bool,
}

type SharedInbox = Arc<(Mutex<Inbox>, Condvar)>;

pub type ArtifactCallback = Arc<dyn Fn(&DisplayArtifact) + Send + Sync>;

pub struct HostConfig {
    pub session_name: Option<String>,
    pub runtime_dir: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub artifact_capacity: usize,
    pub on_artifact: Option<ArtifactCallback>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            session_name: None,
            runtime_dir: None,
            handshake_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            artifact_capacity: 64,
            on_artifact: None,
        }
    }
}

pub struct WorkerHandle {
    child: Child,
    session_name: String,
    control_tx: Option<mpsc::Sender<HostToWorkerMessage>>,
    writer: Option<thread::JoinHandle<()>>,
    reader: Option<thread::JoinHandle<()>>,
    stdout_watcher: Option<thread::JoinHandle<()>>,
    stderr_watcher: Option<thread::JoinHandle<()>>,
    inbox: SharedInbox,
    request_timeout: Duration,
    next_request: u64,
}

impl WorkerHandle {
    /// Spawn `current_exe --worker` for a fresh session and complete the
    /// readiness handshake before returning.
    pub fn launch(config: HostConfig) -> Result<WorkerHandle, HostError> {
        let session_name = config
            .session_name
            .clone()
            .unwrap_or_else(channel::generate_session_name);
        let address = SessionAddress::derive(&session_name, config.runtime_dir.as_deref())?;
        let exe = std::env::current_exe().map_err(HostError::Spawn)?;

        let mut command = Command::new(exe);
        command
            .arg("--worker")
            .env(channel::SESSION_ID_ENV, &session_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.runtime_dir {
            command.env(channel::RUNTIME_DIR_ENV, dir);
        }
        let mut child = command.spawn().map_err(HostError::Spawn)?;
        events::log(
            "worker_spawned",
            json!({ "session": session_name, "pid": child.id() }),
        );

        let stdout = child.stdout.take().ok_or_else(|| HostError::Handshake {
            detail: "worker stdout was not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| HostError::Handshake {
            detail: "worker stderr was not captured".to_string(),
        })?;

        let (line_tx, line_rx) = mpsc::channel::<String>();
        let stdout_watcher = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
        let stderr_watcher = thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                diagnostics::startup_log(format!("worker stderr: {line}"));
            }
        });

        let deadline = Instant::now() + config.handshake_timeout;
        let (control, output) = match connect_after_handshake(&address, deadline, &line_rx) {
            Ok(pair) => pair,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };
        events::log("worker_handshake_complete", json!({ "session": session_name }));

        let (control_tx, control_rx) = mpsc::channel();
        let writer = channel::spawn_writer(control_rx, control);

        let inbox: SharedInbox = Arc::new((
            Mutex::new(Inbox {
                responses: VecDeque::new(),
                artifacts: ArtifactQueue::new(config.artifact_capacity),
                disconnected: false,
            }),
            Condvar::new(),
        ));
        let reader = {
            let inbox = Arc::clone(&inbox);
            let on_artifact = config.on_artifact.clone();
            thread::spawn(move || {
                let mut reader = BufReader::new(output);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end_matches(['\r', '\n']);
                            if trimmed.is_empty() {
                                continue;
                            }
                            let Some(message) = decode_worker_line(trimmed) else {
                                events::log(
                                    "undecodable_worker_line",
                                    json!({ "length": trimmed.len() }),
                                );
                                continue;
                            };
                            match message {
                                WorkerToHostMessage::PlotData(artifact) => {
                                    if let Some(callback) = &on_artifact {
                                        callback(&artifact);
                                    }
                                    let (lock, cvar) = &*inbox;
                                    lock.lock().unwrap().artifacts.push(artifact);
                                    cvar.notify_all();
                                }
                                other => {
                                    let (lock, cvar) = &*inbox;
                                    lock.lock().unwrap().responses.push_back(other);
                                    cvar.notify_all();
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }
                let (lock, cvar) = &*inbox;
                lock.lock().unwrap().disconnected = true;
                cvar.notify_all();
            })
        };

        Ok(WorkerHandle {
            child,
            session_name,
            control_tx: Some(control_tx),
            writer: Some(writer),
            reader: Some(reader),
            stdout_watcher: Some(stdout_watcher),
            stderr_watcher: Some(stderr_watcher),
            inbox,
            request_timeout: config.request_timeout,
            next_request: 0,
        })
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn execute(
        &mut self,
        code: &str,
        execution_type: ExecutionType,
    ) -> Result<ExecutionResult, HostError> {
        let id = self.next_request_id("exec");
        self.send(HostToWorkerMessage::CodeExecution(ExecutionRequest {
            id: id.clone(),
            code: code.to_string(),
            execution_type,
        }))?;
        let message = self.await_response(
            |m| matches!(m, WorkerToHostMessage::ExecutionComplete(r) if r.id == id),
            "execution completion",
        )?;
        match message {
            WorkerToHostMessage::ExecutionComplete(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    /// Programmatic evaluation on the api tag. Same engine path as
    /// `execute`, answered as `ApiResponse` so interactive waiters are never
    /// confused by it.
    pub fn api_request(&mut self, code: &str) -> Result<ExecutionResult, HostError> {
        let id = self.next_request_id("api");
        self.send(HostToWorkerMessage::ApiRequest(ExecutionRequest {
            id: id.clone(),
            code: code.to_string(),
            execution_type: ExecutionType::ApiCall,
        }))?;
        let message = self.await_response(
            |m| matches!(m, WorkerToHostMessage::ApiResponse(r) if r.id == id),
            "api response",
        )?;
        match message {
            WorkerToHostMessage::ApiResponse(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    pub fn debug_command(&mut self, command: &DebugCommand) -> Result<DebugResponse, HostError> {
        let value = serde_json::to_value(command).map_err(HostError::Encode)?;
        self.debug_command_raw(value)
    }

    /// Send an arbitrary inner command value. The worker answers unknown
    /// commands with an explicit failure, so this stays total.
    pub fn debug_command_raw(
        &mut self,
        command: serde_json::Value,
    ) -> Result<DebugResponse, HostError> {
        let id = self.next_request_id("debug");
        self.send(HostToWorkerMessage::DebugMessage(DebugRequest {
            id: id.clone(),
            command,
        }))?;
        let message = self.await_response(
            |m| matches!(m, WorkerToHostMessage::DebugMessageResponse(r) if r.id == id),
            "debug response",
        )?;
        match message {
            WorkerToHostMessage::DebugMessageResponse(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    pub fn connection_test(&mut self) -> Result<String, HostError> {
        let id = self.next_request_id("ping");
        self.send(HostToWorkerMessage::ConnectionTest { id: id.clone() })?;
        let message = self.await_response(
            |m| matches!(m, WorkerToHostMessage::ConnectionTestResponse { id: got, .. } if *got == id),
            "connection test response",
        )?;
        match message {
            WorkerToHostMessage::ConnectionTestResponse { status, .. } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    pub fn workspace_variables(&mut self) -> Result<Vec<VariableInfo>, HostError> {
        let id = self.next_request_id("vars");
        self.send(HostToWorkerMessage::GetWorkspaceVariables { id: id.clone() })?;
        let message = self.await_response(
            |m| matches!(m, WorkerToHostMessage::WorkspaceVariables { id: got, .. } if *got == id),
            "workspace variables",
        )?;
        match message {
            WorkerToHostMessage::WorkspaceVariables { variables, .. } => Ok(variables),
            other => Err(unexpected(&other)),
        }
    }

    pub fn variable_value(&mut self, name: &str) -> Result<(String, String), HostError> {
        let id = self.next_request_id("var");
        self.send(HostToWorkerMessage::GetVariableValue {
            id: id.clone(),
            name: name.to_string(),
        })?;
        let message = self.await_response(
            |m| matches!(m, WorkerToHostMessage::VariableValue { id: got, .. } if *got == id),
            "variable value",
        )?;
        match message {
            WorkerToHostMessage::VariableValue { kind, value, .. } => Ok((kind, value)),
            other => Err(unexpected(&other)),
        }
    }

    pub fn drain_artifacts(&self) -> Vec<DisplayArtifact> {
        let (lock, _) = &*self.inbox;
        lock.lock().unwrap().artifacts.drain()
    }

    pub fn dropped_artifacts(&self) -> u64 {
        let (lock, _) = &*self.inbox;
        lock.lock().unwrap().artifacts.dropped()
    }

    /// Deliver SIGINT to the worker so the engine aborts the evaluation in
    /// flight. The worker process stays up.
    pub fn interrupt(&mut self) -> Result<(), HostError> {
        #[cfg(unix)]
        {
            let pid = self.child.id() as i32;
            let rc = unsafe { libc::kill(pid, libc::SIGINT) };
            if rc == 0 {
                events::log("worker_interrupted", json!({ "pid": pid }));
                Ok(())
            } else {
                Err(HostError::Io(io::Error::last_os_error()))
            }
        }
        #[cfg(not(unix))]
        {
            Err(HostError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "interrupt requires unix signals",
            )))
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close the control channel, wait up to `timeout` for a clean exit, and
    /// kill the worker if it is still running. Every helper thread is joined
    /// before return.
    pub fn shutdown(mut self, timeout: Duration) -> Result<ExitStatus, HostError> {
        drop(self.control_tx.take());
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        let deadline = Instant::now() + timeout;
        let status = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = self.child.kill();
                        break self.child.wait().map_err(HostError::Io)?;
                    }
                    thread::sleep(EXIT_POLL_INTERVAL);
                }
                Err(err) => return Err(HostError::Io(err)),
            }
        };
        for handle in [
            self.reader.take(),
            self.stdout_watcher.take(),
            self.stderr_watcher.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.join();
        }
        events::log("worker_exited", json!({ "status": status.code() }));
        Ok(status)
    }

    fn send(&self, message: HostToWorkerMessage) -> Result<(), HostError> {
        let Some(tx) = &self.control_tx else {
            return Err(HostError::ChannelClosed);
        };
        tx.send(message).map_err(|_| HostError::ChannelClosed)
    }

    fn await_response<F>(
        &self,
        matcher: F,
        waiting_for: &str,
    ) -> Result<WorkerToHostMessage, HostError>
    where
        F: Fn(&WorkerToHostMessage) -> bool,
    {
        let deadline = Instant::now() + self.request_timeout;
        let (lock, cvar) = &*self.inbox;
        let mut inbox = lock.lock().unwrap();
        loop {
            if let Some(index) = inbox.responses.iter().position(|m| matcher(m)) {
                return Ok(inbox.responses.remove(index).unwrap());
            }
            if inbox.disconnected {
                return Err(HostError::ChannelClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HostError::Timeout {
                    waiting_for: waiting_for.to_string(),
                });
            }
            let (guard, _) = cvar.wait_timeout(inbox, deadline - now).unwrap();
            inbox = guard;
        }
    }

    fn next_request_id(&mut self, kind: &str) -> String {
        self.next_request += 1;
        format!("{kind}-{}", self.next_request)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        drop(self.control_tx.take());
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn unexpected(message: &WorkerToHostMessage) -> HostError {
    HostError::UnexpectedResponse(format!("{message:?}"))
}

/// Wait out the marker sequence, connecting each channel at the point the
/// protocol allows. Markers arriving out of order fail the handshake.
fn connect_after_handshake(
    address: &SessionAddress,
    deadline: Instant,
    line_rx: &mpsc::Receiver<String>,
) -> Result<
    (
        Box<dyn std::io::Write + Send>,
        Box<dyn std::io::Read + Send>,
    ),
    HostError,
> {
    wait_for_marker(line_rx, channel::CONTROL_BOUND_MARKER, deadline)?;
    wait_for_marker(line_rx, channel::OUTPUT_BOUND_MARKER, deadline)?;
    let control = channel::connect_control(address, remaining(deadline))?;
    let output = channel::connect_output(address, remaining(deadline))?;
    wait_for_marker(line_rx, channel::LOOP_LIVE_MARKER, deadline)?;
    Ok((control, output))
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn wait_for_marker(
    rx: &mpsc::Receiver<String>,
    marker: &'static str,
    deadline: Instant,
) -> Result<(), HostError> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(HostError::Timeout {
                waiting_for: format!("readiness marker {marker}"),
            });
        }
        match rx.recv_timeout(deadline - now) {
            Ok(line) => {
                let line = line.trim();
                if line == marker {
                    return Ok(());
                }
                if MARKERS.contains(&line) {
                    return Err(HostError::Handshake {
                        detail: format!("expected marker {marker}, saw {line}"),
                    });
                }
                // Anything else on stdout is worker chatter, not protocol.
                diagnostics::startup_log(format!("worker stdout: {line}"));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(HostError::Timeout {
                    waiting_for: format!("readiness marker {marker}"),
                });
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(HostError::Handshake {
                    detail: format!("worker exited before marker {marker}"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::now_ms;

    fn artifact(id: &str) -> DisplayArtifact {
        DisplayArtifact {
            id: id.to_string(),
            mime_type: "text/plain".to_string(),
            data: "x".to_string(),
            timestamp: now_ms(),
        }
    }

    #[test]
    fn artifact_queue_drops_oldest_past_capacity() {
        let mut queue = ArtifactQueue::new(2);
        queue.push(artifact("a"));
        queue.push(artifact("b"));
        queue.push(artifact("c"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        let drained = queue.drain();
        assert_eq!(drained[0].id, "b");
        assert_eq!(drained[1].id, "c");
        assert!(queue.is_empty());
    }

    #[test]
    fn artifact_queue_capacity_has_a_floor() {
        let mut queue = ArtifactQueue::new(0);
        queue.push(artifact("a"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn marker_wait_skips_worker_chatter() {
        let (tx, rx) = mpsc::channel();
        tx.send("some banner".to_string()).unwrap();
        tx.send(channel::CONTROL_BOUND_MARKER.to_string()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(wait_for_marker(&rx, channel::CONTROL_BOUND_MARKER, deadline).is_ok());
    }

    #[test]
    fn marker_wait_rejects_out_of_order_markers() {
        let (tx, rx) = mpsc::channel();
        tx.send(channel::OUTPUT_BOUND_MARKER.to_string()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        match wait_for_marker(&rx, channel::CONTROL_BOUND_MARKER, deadline) {
            Err(HostError::Handshake { detail }) => {
                assert!(detail.contains(channel::OUTPUT_BOUND_MARKER));
            }
            other => panic!("expected handshake failure, got {other:?}"),
        }
    }

    #[test]
    fn marker_wait_reports_worker_exit() {
        let (tx, rx) = mpsc::channel::<String>();
        drop(tx);
        let deadline = Instant::now() + Duration::from_secs(1);
        match wait_for_marker(&rx, channel::CONTROL_BOUND_MARKER, deadline) {
            Err(HostError::Handshake { detail }) => assert!(detail.contains("exited")),
            other => panic!("expected handshake failure, got {other:?}"),
        }
    }

    #[test]
    fn marker_wait_times_out_on_silence() {
        let (_tx, rx) = mpsc::channel::<String>();
        let deadline = Instant::now() + Duration::from_millis(30);
        match wait_for_marker(&rx, channel::LOOP_LIVE_MARKER, deadline) {
            Err(HostError::Timeout { waiting_for }) => {
                assert!(waiting_for.contains(channel::LOOP_LIVE_MARKER));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn host_errors_render_with_context() {
        let timeout = HostError::Timeout {
            waiting_for: "execution completion".to_string(),
        };
        assert!(timeout.to_string().contains("execution completion"));
        assert!(HostError::ChannelClosed.to_string().contains("closed"));
    }
}
