//! Lua execution engine for the worker.
//!
//! One VM per session, owned by the message loop thread. Requests are
//! serialized by an explicit gate, so user code never observes concurrent
//! evaluation. Single expressions evaluate to their value; anything else runs
//! as a chunk whose trailing expression, when there is one, becomes the
//! result.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use mlua::{Function, HookTriggers, Lua, MultiValue, Value, VmState};

use crate::display::DisplayPipeline;
use crate::protocol::{ExecutionRequest, ExecutionResult, ExecutionType, VariableInfo};

const CHUNK_NAME: &str = "@repl";
const PREVIEW_LIMIT: usize = 120;
const INTERRUPT_CHECK_INTERVAL: u32 = 10_000;

static INTERRUPT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Ask the engine to abort the evaluation in flight. Safe from any thread and
/// from signal handlers; the hook picks the flag up within a few thousand
/// instructions.
pub fn request_interrupt() {
    INTERRUPT_REQUESTED.store(true, Ordering::SeqCst);
}

fn take_interrupt() -> bool {
    INTERRUPT_REQUESTED.swap(false, Ordering::SeqCst)
}

#[cfg(unix)]
pub fn install_interrupt_handler() {
    extern "C" fn on_sigint(_sig: libc::c_int) {
        INTERRUPT_REQUESTED.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

/// At most one evaluation runs at a time; the gate makes the invariant
/// explicit instead of leaning on the loop being single threaded.
pub struct ExecutionGate {
    busy: AtomicBool,
}

impl ExecutionGate {
    pub fn new() -> Self {
        ExecutionGate {
            busy: AtomicBool::new(false),
        }
    }

    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(GateGuard { gate: self })
        } else {
            None
        }
    }
}

impl Default for ExecutionGate {
    fn default() -> Self {
        ExecutionGate::new()
    }
}

pub struct GateGuard<'a> {
    gate: &'a ExecutionGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::SeqCst);
    }
}

pub struct LuaEngine {
    lua: Lua,
    gate: ExecutionGate,
    pipeline: DisplayPipeline,
    baseline_globals: BTreeSet<String>,
}

impl LuaEngine {
    pub fn new(pipeline: DisplayPipeline) -> mlua::Result<Self> {
        let lua = Lua::new();
        install_display(&lua, pipeline.clone())?;
        install_interrupt_hook(&lua);
        let baseline_globals = global_names(&lua);
        Ok(LuaEngine {
            lua,
            gate: ExecutionGate::new(),
            pipeline,
            baseline_globals,
        })
    }

    /// Replace the VM with a fresh one, clearing all user state.
    pub fn reset(&mut self) -> mlua::Result<()> {
        *self = LuaEngine::new(self.pipeline.clone())?;
        Ok(())
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    /// Run one request to completion. Never panics and never loses the
    /// correlation id; every outcome, including refusal, is an
    /// [`ExecutionResult`].
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let id = request.id.clone();
        let execution_type = request.execution_type.clone();
        if matches!(execution_type, ExecutionType::DebugExecution) {
            return ExecutionResult::failed(
                id,
                execution_type,
                "debug execution is handled by the debug bridge, not the evaluator",
                0,
            );
        }
        let code = request.code.trim();
        if code.is_empty() {
            return ExecutionResult::completed(id, execution_type, None, 0);
        }
        let Some(_guard) = self.gate.try_acquire() else {
            return ExecutionResult::failed(
                id,
                execution_type,
                "an evaluation is already in flight",
                0,
            );
        };
        // A SIGINT delivered while idle must not kill the next request.
        take_interrupt();
        let function = match self.prepare(code, &execution_type) {
            Ok(function) => function,
            Err(err) => {
                return ExecutionResult::failed(id, execution_type, error_with_traceback(&err), 0);
            }
        };
        let started = Instant::now();
        let outcome = function.call::<MultiValue>(());
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(values) => {
                let value = values.into_iter().next().unwrap_or(Value::Nil);
                let rendered = stringify_value(&self.lua, &value);
                self.pipeline
                    .offer_value(&value, rendered.as_deref(), &request.code);
                ExecutionResult::completed(id, execution_type, rendered, duration_ms)
            }
            Err(err) => {
                ExecutionResult::failed(id, execution_type, error_with_traceback(&err), duration_ms)
            }
        }
    }

    /// Compile without running. Single expressions get an implicit `return`;
    /// multi-statement chunks keep their shape but a trailing expression is
    /// still captured. File contents always take the chunk path.
    fn prepare(&self, code: &str, execution_type: &ExecutionType) -> mlua::Result<Function> {
        if !matches!(execution_type, ExecutionType::FileExecution) {
            if let Ok(function) = self
                .lua
                .load(format!("return {code}"))
                .set_name(CHUNK_NAME)
                .into_function()
            {
                return Ok(function);
            }
        }
        if let Some(candidate) = with_final_expression_return(code) {
            if let Ok(function) = self
                .lua
                .load(candidate)
                .set_name(CHUNK_NAME)
                .into_function()
            {
                return Ok(function);
            }
        }
        self.lua.load(code).set_name(CHUNK_NAME).into_function()
    }

    /// Globals created by user code since the session started, sorted by name.
    pub fn workspace_variables(&self) -> Vec<VariableInfo> {
        let mut variables = Vec::new();
        for entry in self.lua.globals().pairs::<Value, Value>() {
            let Ok((key, value)) = entry else { continue };
            let Value::String(name) = key else { continue };
            let name = name.to_string_lossy().to_string();
            if self.baseline_globals.contains(&name) {
                continue;
            }
            let preview =
                stringify_value(&self.lua, &value).unwrap_or_else(|| "nil".to_string());
            variables.push(VariableInfo {
                name,
                kind: value.type_name().to_string(),
                preview: truncate_preview(preview),
            });
        }
        variables.sort_by(|a, b| a.name.cmp(&b.name));
        variables
    }

    pub fn variable_value(&self, name: &str) -> (String, String) {
        match self.lua.globals().get::<Value>(name) {
            Ok(value) => {
                let kind = value.type_name().to_string();
                let rendered =
                    stringify_value(&self.lua, &value).unwrap_or_else(|| "nil".to_string());
                (kind, rendered)
            }
            Err(err) => ("error".to_string(), err.to_string()),
        }
    }
}

fn install_display(lua: &Lua, pipeline: DisplayPipeline) -> mlua::Result<()> {
    let display = lua.create_function(move |lua, value: Value| {
        let rendered = stringify_value(lua, &value);
        pipeline.display_call(&value, rendered.as_deref());
        Ok(())
    })?;
    lua.globals().set("display", display)
}

fn install_interrupt_hook(lua: &Lua) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(INTERRUPT_CHECK_INTERVAL),
        |_lua, _debug| {
            if take_interrupt() {
                Err(mlua::Error::RuntimeError("interrupted".to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );
}

fn global_names(lua: &Lua) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for entry in lua.globals().pairs::<Value, Value>() {
        let Ok((key, _)) = entry else { continue };
        if let Value::String(name) = key {
            names.insert(name.to_string_lossy().to_string());
        }
    }
    names
}

/// Rewrite `init statements... <expr>` into `init statements... return <expr>`
/// so the chunk yields its trailing expression. The caller verifies the
/// rewrite still compiles before using it.
fn with_final_expression_return(code: &str) -> Option<String> {
    let last_line_start = code.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let last = code[last_line_start..].trim();
    if last.is_empty() || last_line_start == 0 {
        return None;
    }
    let init = &code[..last_line_start];
    Some(format!("{init}return {last}"))
}

/// Render a value for the result field. Total: tostring failures (including
/// raising metamethods) degrade to a typed placeholder instead of an error.
pub(crate) fn stringify_value(lua: &Lua, value: &Value) -> Option<String> {
    match value {
        Value::Nil => None,
        Value::Boolean(b) => Some(b.to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        other => {
            let via_tostring = lua
                .globals()
                .get::<Function>("tostring")
                .ok()
                .and_then(|f| f.call::<mlua::String>(other.clone()).ok())
                .map(|s| s.to_string_lossy().to_string());
            Some(
                via_tostring
                    .unwrap_or_else(|| format!("<{}: conversion failed>", other.type_name())),
            )
        }
    }
}

fn error_with_traceback(err: &mlua::Error) -> String {
    let text = err.to_string();
    if text.contains("stack traceback") {
        text
    } else {
        format!("{text}\nstack traceback:\n\tin evaluated chunk")
    }
}

fn truncate_preview(preview: String) -> String {
    if preview.chars().count() <= PREVIEW_LIMIT {
        return preview;
    }
    let mut truncated: String = preview.chars().take(PREVIEW_LIMIT).collect();
    truncated.push_str("...");
    truncated
}
