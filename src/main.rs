use std::path::PathBuf;
use std::time::Duration;

use replink::console::{self, ConsoleOptions};
use replink::{channel, diagnostics, events, session};

#[derive(Debug)]
struct CliOptions {
    runtime_dir: Option<PathBuf>,
    session_name: Option<String>,
    request_timeout: Duration,
    event_log_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // Worker stdout/stderr feed the host. If the host closes its read end
    // early, a later write would raise SIGPIPE and terminate the process on
    // Unix; ignore it so broken pipes surface as ordinary write errors.
    ignore_sigpipe();
    diagnostics::startup_log("main: entry");

    if session::is_worker_mode() {
        diagnostics::startup_log("main: worker mode");
        events::initialize(
            None,
            events::StartupContext {
                mode: "worker".to_string(),
                session: std::env::var(channel::SESSION_ID_ENV).ok(),
            },
        )?;
        return Ok(session::run_worker()?);
    }

    let options = parse_cli_args()?;
    events::initialize(
        options.event_log_dir.clone(),
        events::StartupContext {
            mode: "console".to_string(),
            session: options.session_name.clone(),
        },
    )?;
    diagnostics::startup_log("main: console mode");
    console::run_console(ConsoleOptions {
        runtime_dir: options.runtime_dir,
        session_name: options.session_name,
        request_timeout: options.request_timeout,
    })
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_cli_args() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    parse_console_args(&mut parser)
}

fn parse_console_args(parser: &mut ArgParser) -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut runtime_dir = None;
    let mut session_name = None;
    let mut request_timeout = Duration::from_secs(30);
    let mut event_log_dir = None;

    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("replink {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--runtime-dir" => {
                let value = parser.next_value("--runtime-dir")?;
                runtime_dir = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--runtime-dir=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --runtime-dir".into());
                }
                runtime_dir = Some(PathBuf::from(value));
            }
            "--session-name" => {
                let value = parser.next_value("--session-name")?;
                session_name = Some(parse_session_name(&value)?);
            }
            _ if arg.starts_with("--session-name=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --session-name".into());
                }
                session_name = Some(parse_session_name(value)?);
            }
            "--timeout" => {
                let value = parser.next_value("--timeout")?;
                request_timeout = parse_timeout_arg(&value)?;
            }
            _ if arg.starts_with("--timeout=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --timeout".into());
                }
                request_timeout = parse_timeout_arg(value)?;
            }
            "--event-log-dir" => {
                let value = parser.next_value("--event-log-dir")?;
                if value.trim().is_empty() {
                    return Err("missing value for --event-log-dir".into());
                }
                event_log_dir = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--event-log-dir=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.trim().is_empty() {
                    return Err("missing value for --event-log-dir".into());
                }
                event_log_dir = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    Ok(CliOptions {
        runtime_dir,
        session_name,
        request_timeout,
        event_log_dir,
    })
}

/// Session names become socket or pipe path components, so only a
/// conservative character set is accepted.
fn parse_session_name(raw: &str) -> Result<String, Box<dyn std::error::Error>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("missing value for --session-name".into());
    }
    let valid = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(format!(
            "invalid --session-name value: {trimmed} (expected alphanumerics, '-', '_' or '.')"
        )
        .into());
    }
    Ok(trimmed.to_string())
}

fn parse_timeout_arg(raw: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let seconds: u64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid --timeout value: {raw} (expected whole seconds)"))?;
    if seconds == 0 {
        return Err(format!("invalid --timeout value: {raw} (must be positive)").into());
    }
    Ok(Duration::from_secs(seconds))
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
replink [--session-name <name>] [--runtime-dir <path>] [--timeout <seconds>] [--event-log-dir <path>]\n\n\
Runs an interactive Lua console backed by a worker subprocess.\n\
--session-name: channel name for this session (default: generated)\n\
--runtime-dir: directory for session channel endpoints (env: REPLINK_RUNTIME_DIR)\n\
--timeout: per-request timeout in seconds (default: 30)\n\
--event-log-dir: optional directory for per-startup JSONL event logs (env: REPLINK_EVENT_LOG_DIR)\n\
--version: print the version and exit"
    );
}
