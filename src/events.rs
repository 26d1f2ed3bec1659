//! Structured event log. One JSONL file per process, opt-in via environment
//! or explicit directory, silent no-op when disabled.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value as JsonValue, json};

pub const EVENT_LOG_DIR_ENV: &str = "REPLINK_EVENT_LOG_DIR";

static LOGGER: OnceLock<Option<Arc<EventLogger>>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct StartupContext {
    pub mode: String,
    pub session: Option<String>,
}

#[derive(Debug)]
struct EventLogger {
    file: Mutex<File>,
    file_path: PathBuf,
    startup_epoch: Instant,
    session_instance_id: String,
    pid: u32,
    seq: AtomicU64,
}

impl EventLogger {
    fn new(dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        fs::create_dir_all(dir)?;
        let unix_ms = unix_ms_now();
        let pid = std::process::id();
        let session_instance_id = format!("{unix_ms}-{pid}");
        let (file, file_path) = create_unique_log_file(dir, unix_ms, pid)?;
        Ok(Self {
            file: Mutex::new(file),
            file_path,
            startup_epoch: Instant::now(),
            session_instance_id,
            pid,
            seq: AtomicU64::new(0),
        })
    }

    fn write_event(&self, event: &str, payload: JsonValue) -> Result<(), std::io::Error> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let line = json!({
            "ts_unix_ms": unix_ms_now(),
            "uptime_ms": self.startup_epoch.elapsed().as_millis(),
            "seq": seq,
            "session_instance_id": self.session_instance_id,
            "pid": self.pid,
            "event": event,
            "payload": payload,
        });
        let mut file = self.file.lock().expect("event logger mutex poisoned");
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

pub fn initialize(
    event_log_dir: Option<PathBuf>,
    context: StartupContext,
) -> Result<(), Box<dyn std::error::Error>> {
    if LOGGER.get().is_some() {
        return Ok(());
    }

    let maybe_dir = resolve_log_dir(event_log_dir);
    let maybe_logger = if let Some(dir) = maybe_dir {
        let logger = Arc::new(EventLogger::new(&dir)?);
        logger.write_event("startup", startup_payload(&context, &logger.file_path))?;
        Some(logger)
    } else {
        None
    };
    let _ = LOGGER.set(maybe_logger);
    Ok(())
}

pub fn log(event: &str, payload: JsonValue) {
    let Some(logger) = current_logger() else {
        return;
    };
    let _ = logger.write_event(event, payload);
}

fn current_logger() -> Option<Arc<EventLogger>> {
    LOGGER.get().and_then(|entry| entry.clone())
}

fn resolve_log_dir(event_log_dir: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = event_log_dir
        && !path.as_os_str().is_empty()
    {
        return Some(path);
    }
    std::env::var_os(EVENT_LOG_DIR_ENV)
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn startup_payload(context: &StartupContext, file_path: &Path) -> JsonValue {
    let cwd = std::env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());
    let argv: Vec<String> = std::env::args().collect();
    json!({
        "mode": context.mode,
        "session": context.session,
        "cwd": cwd,
        "argv": argv,
        "log_file": file_path.to_string_lossy().to_string(),
    })
}

fn create_unique_log_file(
    dir: &Path,
    unix_ms: u128,
    pid: u32,
) -> Result<(File, PathBuf), Box<dyn std::error::Error>> {
    for suffix in 0u32..1_000u32 {
        let name = if suffix == 0 {
            format!("replink-{unix_ms}-{pid}.jsonl")
        } else {
            format!("replink-{unix_ms}-{pid}-{suffix}.jsonl")
        };
        let path = dir.join(name);
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(Box::new(err)),
        }
    }
    Err("failed to allocate unique event log filename after 1000 attempts".into())
}

fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
