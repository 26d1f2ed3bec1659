use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

const STARTUP_LOG_ENV: &str = "REPLINK_DEBUG_STARTUP";
const STARTUP_LOG_PATH_ENV: &str = "REPLINK_DEBUG_STARTUP_FILE";
const STARTUP_LOG_DEFAULT: &str = "replink-startup.log";

static STARTUP_EPOCH: OnceLock<Instant> = OnceLock::new();
static STARTUP_SINK: OnceLock<Option<Mutex<File>>> = OnceLock::new();

fn startup_epoch() -> Instant {
    *STARTUP_EPOCH.get_or_init(Instant::now)
}

fn startup_sink() -> &'static Option<Mutex<File>> {
    STARTUP_SINK.get_or_init(|| {
        let explicit_path = std::env::var(STARTUP_LOG_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        let enabled = explicit_path.is_some()
            || std::env::var(STARTUP_LOG_ENV)
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false);
        if !enabled {
            return None;
        }
        let path = explicit_path.unwrap_or_else(|| STARTUP_LOG_DEFAULT.to_string());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(Mutex::new)
    })
}

/// Append a timestamped line to the startup trace file. Does nothing unless
/// one of the startup debug environment variables is set.
pub fn startup_log(message: impl AsRef<str>) {
    let Some(file) = startup_sink() else { return };
    let elapsed = startup_epoch().elapsed().as_millis();
    if let Ok(mut guard) = file.lock() {
        let _ = writeln!(
            *guard,
            "[replink][startup +{elapsed:>6}ms] {}",
            message.as_ref()
        );
        let _ = guard.flush();
    }
}
