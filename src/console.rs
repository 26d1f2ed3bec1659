//! Interactive console over a spawned worker. Lines are evaluated as Lua;
//! `:`-prefixed commands drive the rest of the protocol surface.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use crate::host::{HostConfig, HostError, WorkerHandle};
use crate::protocol::{
    DebugCommand, DebugResponse, DisplayArtifact, ExecutionResult, ExecutionType,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub runtime_dir: Option<PathBuf>,
    pub session_name: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        ConsoleOptions {
            runtime_dir: None,
            session_name: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub fn run_console(options: ConsoleOptions) -> Result<(), Box<dyn std::error::Error>> {
    let worker = WorkerHandle::launch(HostConfig {
        session_name: options.session_name,
        runtime_dir: options.runtime_dir,
        request_timeout: options.request_timeout,
        ..HostConfig::default()
    })?;
    eprintln!(
        "replink console: session={} | commands: :file <path>, :api <code>, :vars, :var <name>, :ping, :interrupt, :quit | debug: :dstart <path>, :break <file>:<line>, :unbreak <file>:<line>, :step, :stepin, :stepout, :cont, :dvars, :stack, :dstop, :debug <json> | Ctrl-D to exit",
        worker.session_name()
    );
    console_loop(worker)
}

fn console_loop(mut worker: WorkerHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let stdin = io::stdin();
    let mut stdin = stdin.lock();
    let mut seen_dropped = 0u64;

    loop {
        write!(stdout, "replink> ")?;
        stdout.flush()?;
        let Some(line) = read_line(&mut stdin)? else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let outcome = match parse_command(trimmed) {
            Some(("quit", _)) | Some(("q", _)) => break,
            Some(("interrupt", _)) => worker.interrupt().map(|()| None),
            Some(("ping", _)) => worker.connection_test().map(Some),
            Some(("file", path)) if !path.is_empty() => match fs::read_to_string(path) {
                Ok(code) => worker
                    .execute(&code, ExecutionType::FileExecution)
                    .map(|result| render_execution(&result, &mut stdout, &mut stderr)),
                Err(err) => {
                    writeln!(stderr, "[replink] cannot read {path}: {err}")?;
                    Ok(None)
                }
            },
            Some(("api", code)) if !code.is_empty() => worker
                .api_request(code)
                .map(|result| render_execution(&result, &mut stdout, &mut stderr)),
            Some(("vars", _)) => worker.workspace_variables().map(|variables| {
                for variable in &variables {
                    let _ = writeln!(
                        stdout,
                        "{}: {} = {}",
                        variable.name, variable.kind, variable.preview
                    );
                }
                Some(format!("{} variable(s)", variables.len()))
            }),
            Some(("var", name)) if !name.is_empty() => worker
                .variable_value(name)
                .map(|(kind, value)| Some(format!("{kind}: {value}"))),
            Some(("dstart", path)) if !path.is_empty() => match fs::read_to_string(path) {
                Ok(code) => worker
                    .debug_command(&DebugCommand::StartDebug {
                        file: path.to_string(),
                        code,
                    })
                    .map(debug_reply),
                Err(err) => {
                    writeln!(stderr, "[replink] cannot read {path}: {err}")?;
                    Ok(None)
                }
            },
            Some((name @ ("break" | "unbreak"), target)) if !target.is_empty() => {
                match parse_breakpoint(target) {
                    Ok((file, line)) => {
                        let command = if name == "break" {
                            DebugCommand::SetBreakpoint { file, line }
                        } else {
                            DebugCommand::RemoveBreakpoint { file, line }
                        };
                        worker.debug_command(&command).map(debug_reply)
                    }
                    Err(err) => {
                        writeln!(stderr, "[replink] {err}")?;
                        Ok(None)
                    }
                }
            }
            Some(("step", _)) => worker.debug_command(&DebugCommand::StepOver {}).map(debug_reply),
            Some(("stepin", _)) => worker.debug_command(&DebugCommand::StepIn {}).map(debug_reply),
            Some(("stepout", _)) => worker
                .debug_command(&DebugCommand::StepOut {})
                .map(debug_reply),
            Some(("cont", _)) => worker.debug_command(&DebugCommand::Continue {}).map(debug_reply),
            Some(("dvars", _)) => worker
                .debug_command(&DebugCommand::GetVariables {})
                .map(debug_reply),
            Some(("stack", _)) => worker
                .debug_command(&DebugCommand::GetStacktrace {})
                .map(debug_reply),
            Some(("dstop", _)) => worker.debug_command(&DebugCommand::StopDebug {}).map(debug_reply),
            Some(("debug", body)) if !body.is_empty() => match serde_json::from_str(body) {
                Ok(command) => worker.debug_command_raw(command).map(debug_reply),
                Err(err) => {
                    writeln!(stderr, "[replink] bad debug command: {err}")?;
                    Ok(None)
                }
            },
            Some((name, _)) => {
                writeln!(stderr, "[replink] unknown command :{name}")?;
                Ok(None)
            }
            None => worker
                .execute(trimmed, ExecutionType::ReplExecution)
                .map(|result| render_execution(&result, &mut stdout, &mut stderr)),
        };

        match outcome {
            Ok(Some(message)) => writeln!(stdout, "{message}")?,
            Ok(None) => {}
            Err(HostError::ChannelClosed) => {
                writeln!(stderr, "[replink] worker disconnected")?;
                break;
            }
            Err(err) => {
                writeln!(stderr, "[replink] {err}")?;
                if !worker.is_alive() {
                    writeln!(stderr, "[replink] worker exited")?;
                    break;
                }
            }
        }

        for artifact in worker.drain_artifacts() {
            render_artifact(&artifact, &mut stderr)?;
        }
        let dropped = worker.dropped_artifacts();
        if dropped > seen_dropped {
            writeln!(
                stderr,
                "[replink] {} display artifact(s) dropped",
                dropped - seen_dropped
            )?;
            seen_dropped = dropped;
        }
        stdout.flush()?;
        stderr.flush()?;
    }

    worker.shutdown(SHUTDOWN_GRACE)?;
    Ok(())
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Split a `:name arg` console command. Plain code lines return `None`.
fn parse_command(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix(':')?;
    match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => Some((name, arg.trim())),
        None => Some((rest, "")),
    }
}

/// Parse the `<file>:<line>` form used by the breakpoint commands.
fn parse_breakpoint(target: &str) -> Result<(String, u32), String> {
    let Some((file, line)) = target.rsplit_once(':') else {
        return Err(format!("expected <file>:<line>, got {target}"));
    };
    if file.is_empty() {
        return Err(format!("expected <file>:<line>, got {target}"));
    }
    let line: u32 = line
        .parse()
        .map_err(|_| format!("invalid line number in {target}"))?;
    Ok((file.to_string(), line))
}

fn debug_reply(response: DebugResponse) -> Option<String> {
    Some(match &response.error {
        Some(error) => format!("debug failed: {error}"),
        None => response.detail.to_string(),
    })
}

fn render_execution(
    result: &ExecutionResult,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> Option<String> {
    if let Some(error) = &result.error {
        let _ = writeln!(stderr, "[replink] error: {error}");
    } else if let Some(value) = &result.result {
        let _ = writeln!(stdout, "{value}");
    }
    None
}

fn render_artifact(artifact: &DisplayArtifact, stderr: &mut impl Write) -> io::Result<()> {
    writeln!(
        stderr,
        "[replink] display id={} mime={} bytes={}",
        artifact.id,
        artifact.mime_type,
        artifact.data.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_splits_name_and_argument() {
        assert_eq!(parse_command(":file demo.lua"), Some(("file", "demo.lua")));
        assert_eq!(parse_command(":vars"), Some(("vars", "")));
        assert_eq!(
            parse_command(":api  print(1) "),
            Some(("api", "print(1)"))
        );
        assert_eq!(parse_command("1 + 1"), None);
    }

    #[test]
    fn render_execution_routes_errors_to_stderr() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let failed = ExecutionResult::failed(
            "exec-1",
            ExecutionType::ReplExecution,
            "boom".to_string(),
            3,
        );
        render_execution(&failed, &mut stdout, &mut stderr);
        assert!(stdout.is_empty());
        assert!(String::from_utf8(stderr).unwrap().contains("boom"));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let completed = ExecutionResult::completed(
            "exec-2",
            ExecutionType::ReplExecution,
            Some("42".to_string()),
            3,
        );
        render_execution(&completed, &mut stdout, &mut stderr);
        assert_eq!(String::from_utf8(stdout).unwrap(), "42\n");
        assert!(stderr.is_empty());
    }

    #[test]
    fn parse_breakpoint_requires_file_and_numeric_line() {
        assert_eq!(
            parse_breakpoint("demo.lua:12"),
            Ok(("demo.lua".to_string(), 12))
        );
        assert_eq!(
            parse_breakpoint("dir/with:colon.lua:3"),
            Ok(("dir/with:colon.lua".to_string(), 3))
        );
        assert!(parse_breakpoint("demo.lua").is_err());
        assert!(parse_breakpoint(":12").is_err());
        assert!(parse_breakpoint("demo.lua:twelve").is_err());
    }

    #[test]
    fn debug_reply_prefers_the_error_line() {
        let failed = DebugResponse::failure(
            "debug-1",
            "no active debug session".to_string(),
            serde_json::json!({}),
        );
        assert_eq!(
            debug_reply(failed),
            Some("debug failed: no active debug session".to_string())
        );
        let ok = DebugResponse::ok("debug-2", serde_json::json!({"paused": true}));
        assert_eq!(debug_reply(ok), Some("{\"paused\":true}".to_string()));
    }

    #[test]
    fn render_artifact_reports_id_and_mime() {
        let mut stderr = Vec::new();
        let artifact = DisplayArtifact {
            id: "display-1-0".to_string(),
            mime_type: "image/png".to_string(),
            data: "aGk=".to_string(),
            timestamp: 0,
        };
        render_artifact(&artifact, &mut stderr).unwrap();
        let text = String::from_utf8(stderr).unwrap();
        assert!(text.contains("display-1-0"));
        assert!(text.contains("image/png"));
    }
}
