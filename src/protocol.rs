//! Wire protocol between the console host and the worker process.
//!
//! Every message travels as one line of JSON with exactly one top-level key;
//! the key names the message kind and the value carries its payload. The
//! control channel carries host-to-worker requests, the output channel carries
//! worker-to-host responses plus unsolicited display pushes. Correlation is by
//! the `id` field the host chooses; the worker echoes it verbatim.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Correlation id stamped on replies to lines whose own id could not be read.
pub const UNPARSEABLE_ID: &str = "unparseable";

/// Requests the host writes to the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostToWorkerMessage {
    CodeExecution(ExecutionRequest),
    ApiRequest(ExecutionRequest),
    DebugMessage(DebugRequest),
    ConnectionTest { id: String },
    GetWorkspaceVariables { id: String },
    GetVariableValue { id: String, name: String },
}

/// Responses and pushes the worker writes to the output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerToHostMessage {
    ExecutionComplete(ExecutionResult),
    ApiResponse(ExecutionResult),
    DebugMessageResponse(DebugResponse),
    ConnectionTestResponse { id: String, status: String },
    WorkspaceVariables { id: String, variables: Vec<VariableInfo> },
    VariableValue { id: String, name: String, kind: String, value: String },
    PlotData(DisplayArtifact),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: String,
    pub code: String,
    pub execution_type: ExecutionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionType {
    ReplExecution,
    FileExecution,
    NotebookCellExecution { cell_id: String },
    ApiCall,
    DebugExecution,
}

/// Outcome of one evaluation. Exactly one of `result` and `error` is set,
/// matching `success`; a successful evaluation of nothing yields both `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: String,
    pub execution_type: ExecutionType,
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: u64,
}

impl ExecutionResult {
    pub fn completed(
        id: impl Into<String>,
        execution_type: ExecutionType,
        result: Option<String>,
        duration_ms: u64,
    ) -> Self {
        ExecutionResult {
            id: id.into(),
            execution_type,
            success: true,
            result,
            error: None,
            duration_ms,
            timestamp: now_ms(),
        }
    }

    pub fn failed(
        id: impl Into<String>,
        execution_type: ExecutionType,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        ExecutionResult {
            id: id.into(),
            execution_type,
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms,
            timestamp: now_ms(),
        }
    }
}

/// Envelope for debug traffic. The inner command is kept as raw JSON so a
/// request whose `id` parses can still be answered when the command itself
/// does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugRequest {
    pub id: String,
    pub command: JsonValue,
}

/// The debug sub-commands the worker understands. Breakpoint edits may arrive
/// before any session is started; stepping and inspection require a paused one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DebugCommand {
    StartDebug { file: String, code: String },
    SetBreakpoint { file: String, line: u32 },
    RemoveBreakpoint { file: String, line: u32 },
    StepOver {},
    StepIn {},
    StepOut {},
    Continue {},
    GetVariables {},
    GetStacktrace {},
    StopDebug {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugResponse {
    pub id: String,
    pub success: bool,
    pub detail: JsonValue,
    pub error: Option<String>,
    pub timestamp: u64,
}

impl DebugResponse {
    pub fn ok(id: impl Into<String>, detail: JsonValue) -> Self {
        DebugResponse {
            id: id.into(),
            success: true,
            detail,
            error: None,
            timestamp: now_ms(),
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>, detail: JsonValue) -> Self {
        DebugResponse {
            id: id.into(),
            success: false,
            detail,
            error: Some(error.into()),
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub kind: String,
    pub preview: String,
}

/// One display push. `data` is the payload verbatim for textual media types
/// and standard base64 for binary ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayArtifact {
    pub id: String,
    pub mime_type: String,
    pub data: String,
    pub timestamp: u64,
}

static ARTIFACT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh display artifact id, unique within and across worker restarts.
pub fn next_artifact_id() -> String {
    let seq = ARTIFACT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("display-{}-{}", now_ms(), seq)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How the worker classified one inbound control line.
#[derive(Debug, Clone, PartialEq)]
pub enum HostLineOutcome {
    Message(HostToWorkerMessage),
    /// Well-formed single-key envelope whose tag is not one of ours.
    UnknownTag(String),
    /// Anything else. `id` is recovered from the payload when readable so the
    /// failure reply still correlates; otherwise it is [`UNPARSEABLE_ID`].
    Malformed { id: String, detail: String },
}

const HOST_TAGS: &[&str] = &[
    "CodeExecution",
    "ApiRequest",
    "DebugMessage",
    "ConnectionTest",
    "GetWorkspaceVariables",
    "GetVariableValue",
];

/// Classify one line read from the control channel.
pub fn classify_host_line(line: &str) -> HostLineOutcome {
    let value: JsonValue = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            return HostLineOutcome::Malformed {
                id: UNPARSEABLE_ID.to_string(),
                detail: format!("invalid json: {err}"),
            };
        }
    };
    let Some(map) = value.as_object() else {
        return HostLineOutcome::Malformed {
            id: UNPARSEABLE_ID.to_string(),
            detail: "request is not a json object".to_string(),
        };
    };
    if map.len() != 1 {
        return HostLineOutcome::Malformed {
            id: UNPARSEABLE_ID.to_string(),
            detail: format!("expected exactly one top-level key, found {}", map.len()),
        };
    }
    let (tag, payload) = map.iter().next().expect("map has one entry");
    if !HOST_TAGS.contains(&tag.as_str()) {
        return HostLineOutcome::UnknownTag(tag.clone());
    }
    match serde_json::from_value::<HostToWorkerMessage>(value.clone()) {
        Ok(message) => HostLineOutcome::Message(message),
        Err(err) => HostLineOutcome::Malformed {
            id: recovered_id(payload),
            detail: format!("malformed {tag} payload: {err}"),
        },
    }
}

fn recovered_id(payload: &JsonValue) -> String {
    payload
        .get("id")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| UNPARSEABLE_ID.to_string())
}

/// Parse one line read from the output channel. The host skips lines that do
/// not decode rather than tearing the connection down.
pub fn decode_worker_line(line: &str) -> Option<WorkerToHostMessage> {
    serde_json::from_str(line).ok()
}

/// Serialize a message as a single newline-free line.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}
