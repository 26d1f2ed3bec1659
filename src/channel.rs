//! Session channel plumbing.
//!
//! Each session uses two unidirectional byte streams: a control channel the
//! host writes requests to and an output channel the worker writes responses
//! and display pushes to. Endpoint names are derived from the session id
//! alone, so both processes compute them independently. On unix the endpoints
//! are domain sockets under the runtime directory; on windows they are named
//! pipes. The worker binds and reports readiness through stdout markers; the
//! host connects only after seeing them.
#![cfg_attr(not(any(unix, windows)), allow(dead_code))]

use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Printed on worker stdout once the control endpoint is bound.
pub const CONTROL_BOUND_MARKER: &str = "REPLINK_CONTROL_CHANNEL_BOUND";
/// Printed once the output endpoint is bound.
pub const OUTPUT_BOUND_MARKER: &str = "REPLINK_OUTPUT_CHANNEL_BOUND";
/// Printed immediately before the worker blocks on its first control read.
pub const LOOP_LIVE_MARKER: &str = "REPLINK_MESSAGE_LOOP_LIVE";

pub const SESSION_ID_ENV: &str = "REPLINK_SESSION_ID";
pub const RUNTIME_DIR_ENV: &str = "REPLINK_RUNTIME_DIR";

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub enum ChannelError {
    Bind {
        endpoint: &'static str,
        source: io::Error,
    },
    Accept {
        endpoint: &'static str,
        source: io::Error,
    },
    Connect {
        endpoint: &'static str,
        source: io::Error,
    },
    InvalidSessionName(String),
    UnsupportedPlatform,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Bind { endpoint, source } => {
                write!(f, "failed to bind {endpoint} channel: {source}")
            }
            ChannelError::Accept { endpoint, source } => {
                write!(f, "failed to accept {endpoint} connection: {source}")
            }
            ChannelError::Connect { endpoint, source } => {
                write!(f, "failed to connect to {endpoint} channel: {source}")
            }
            ChannelError::InvalidSessionName(name) => {
                write!(f, "invalid session name {name:?}: use 1-64 chars from [A-Za-z0-9._-]")
            }
            ChannelError::UnsupportedPlatform => {
                write!(f, "session channels are not supported on this platform")
            }
        }
    }
}

impl Error for ChannelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ChannelError::Bind { source, .. }
            | ChannelError::Accept { source, .. }
            | ChannelError::Connect { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Resolved endpoint names for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAddress {
    session: String,
    #[cfg(unix)]
    control_path: PathBuf,
    #[cfg(unix)]
    output_path: PathBuf,
    #[cfg(windows)]
    control_pipe: String,
    #[cfg(windows)]
    output_pipe: String,
}

impl SessionAddress {
    /// Derive both endpoint names from the session id. `runtime_dir` falls
    /// back to `REPLINK_RUNTIME_DIR`, then the system temp directory; it is
    /// ignored on windows where pipes live in the pipe namespace.
    pub fn derive(session: &str, runtime_dir: Option<&Path>) -> Result<SessionAddress, ChannelError> {
        validate_session_name(session)?;
        #[cfg(unix)]
        {
            let dir = runtime_dir
                .map(Path::to_path_buf)
                .or_else(|| std::env::var_os(RUNTIME_DIR_ENV).map(PathBuf::from))
                .unwrap_or_else(std::env::temp_dir);
            Ok(SessionAddress {
                session: session.to_string(),
                control_path: dir.join(format!("replink-{session}.control.sock")),
                output_path: dir.join(format!("replink-{session}.output.sock")),
            })
        }
        #[cfg(windows)]
        {
            let _ = runtime_dir;
            Ok(SessionAddress {
                session: session.to_string(),
                control_pipe: format!(r"\\.\pipe\replink-{session}-control"),
                output_pipe: format!(r"\\.\pipe\replink-{session}-output"),
            })
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = runtime_dir;
            Err(ChannelError::UnsupportedPlatform)
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Filesystem path of the control socket.
    #[cfg(unix)]
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Filesystem path of the output socket.
    #[cfg(unix)]
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn describe(&self) -> String {
        #[cfg(unix)]
        {
            format!(
                "control={} output={}",
                self.control_path.display(),
                self.output_path.display()
            )
        }
        #[cfg(windows)]
        {
            format!("control={} output={}", self.control_pipe, self.output_pipe)
        }
        #[cfg(not(any(unix, windows)))]
        {
            format!("session={}", self.session)
        }
    }
}

fn validate_session_name(session: &str) -> Result<(), ChannelError> {
    let valid = !session.is_empty()
        && session.len() <= 64
        && session
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ChannelError::InvalidSessionName(session.to_string()))
    }
}

static SESSION_NONCE: AtomicU64 = AtomicU64::new(0);

/// Session name for hosts that did not pick one. Unique per spawn even when
/// several hosts share a machine.
pub fn generate_session_name() -> String {
    let nonce = SESSION_NONCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", std::process::id(), nonce, crate::protocol::now_ms() % 100_000)
}

/// Bound control endpoint, waiting for the host to connect.
pub struct ControlListener {
    #[cfg(unix)]
    inner: std::os::unix::net::UnixListener,
    #[cfg(windows)]
    inner: std::fs::File,
}

/// Bound output endpoint, waiting for the host to connect.
pub struct OutputListener {
    #[cfg(unix)]
    inner: std::os::unix::net::UnixListener,
    #[cfg(windows)]
    inner: std::fs::File,
}

pub fn bind_control(address: &SessionAddress) -> Result<ControlListener, ChannelError> {
    #[cfg(unix)]
    {
        let inner = bind_unix_socket(&address.control_path)
            .map_err(|source| ChannelError::Bind { endpoint: "control", source })?;
        Ok(ControlListener { inner })
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::Storage::FileSystem::PIPE_ACCESS_INBOUND;
        let inner = create_pipe_server(&address.control_pipe, PIPE_ACCESS_INBOUND)
            .map_err(|source| ChannelError::Bind { endpoint: "control", source })?;
        Ok(ControlListener { inner })
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = address;
        Err(ChannelError::UnsupportedPlatform)
    }
}

pub fn bind_output(address: &SessionAddress) -> Result<OutputListener, ChannelError> {
    #[cfg(unix)]
    {
        let inner = bind_unix_socket(&address.output_path)
            .map_err(|source| ChannelError::Bind { endpoint: "output", source })?;
        Ok(OutputListener { inner })
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::Storage::FileSystem::PIPE_ACCESS_OUTBOUND;
        let inner = create_pipe_server(&address.output_pipe, PIPE_ACCESS_OUTBOUND)
            .map_err(|source| ChannelError::Bind { endpoint: "output", source })?;
        Ok(OutputListener { inner })
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = address;
        Err(ChannelError::UnsupportedPlatform)
    }
}

impl ControlListener {
    /// Block until the host connects, then hand back the read side.
    pub fn accept(self) -> Result<Box<dyn Read + Send>, ChannelError> {
        #[cfg(unix)]
        {
            let (stream, _) = self
                .inner
                .accept()
                .map_err(|source| ChannelError::Accept { endpoint: "control", source })?;
            Ok(Box::new(stream))
        }
        #[cfg(windows)]
        {
            wait_for_pipe_client(&self.inner)
                .map_err(|source| ChannelError::Accept { endpoint: "control", source })?;
            Ok(Box::new(self.inner))
        }
        #[cfg(not(any(unix, windows)))]
        {
            Err(ChannelError::UnsupportedPlatform)
        }
    }
}

impl OutputListener {
    /// Block until the host connects, then hand back the write side.
    pub fn accept(self) -> Result<Box<dyn Write + Send>, ChannelError> {
        #[cfg(unix)]
        {
            let (stream, _) = self
                .inner
                .accept()
                .map_err(|source| ChannelError::Accept { endpoint: "output", source })?;
            Ok(Box::new(stream))
        }
        #[cfg(windows)]
        {
            wait_for_pipe_client(&self.inner)
                .map_err(|source| ChannelError::Accept { endpoint: "output", source })?;
            Ok(Box::new(self.inner))
        }
        #[cfg(not(any(unix, windows)))]
        {
            Err(ChannelError::UnsupportedPlatform)
        }
    }
}

/// Host side: open the control channel for writing, retrying until `deadline`.
pub fn connect_control(
    address: &SessionAddress,
    deadline: Duration,
) -> Result<Box<dyn Write + Send>, ChannelError> {
    #[cfg(unix)]
    {
        let stream = connect_unix_socket(&address.control_path, deadline)
            .map_err(|source| ChannelError::Connect { endpoint: "control", source })?;
        Ok(Box::new(stream))
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::GENERIC_WRITE;
        let file = open_pipe_client(&address.control_pipe, GENERIC_WRITE, deadline)
            .map_err(|source| ChannelError::Connect { endpoint: "control", source })?;
        Ok(Box::new(file))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (address, deadline);
        Err(ChannelError::UnsupportedPlatform)
    }
}

/// Host side: open the output channel for reading, retrying until `deadline`.
pub fn connect_output(
    address: &SessionAddress,
    deadline: Duration,
) -> Result<Box<dyn Read + Send>, ChannelError> {
    #[cfg(unix)]
    {
        let stream = connect_unix_socket(&address.output_path, deadline)
            .map_err(|source| ChannelError::Connect { endpoint: "output", source })?;
        Ok(Box::new(stream))
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::GENERIC_READ;
        let file = open_pipe_client(&address.output_pipe, GENERIC_READ, deadline)
            .map_err(|source| ChannelError::Connect { endpoint: "output", source })?;
        Ok(Box::new(file))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (address, deadline);
        Err(ChannelError::UnsupportedPlatform)
    }
}

/// Single writer thread for a channel. Messages that fail to serialize are
/// skipped; the thread exits on the first write error or when every sender is
/// dropped. Each line is flushed before the next receive so readers never wait
/// on a buffered message.
pub fn spawn_writer<T: Serialize + Send + 'static>(
    rx: mpsc::Receiver<T>,
    mut writer: Box<dyn Write + Send>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for message in rx {
            let line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(_) => continue,
            };
            if writer.write_all(line.as_bytes()).is_err() {
                break;
            }
            if writer.write_all(b"\n").is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    })
}

#[cfg(unix)]
fn bind_unix_socket(path: &Path) -> io::Result<std::os::unix::net::UnixListener> {
    clear_stale_socket(path)?;
    std::os::unix::net::UnixListener::bind(path)
}

/// A leftover socket file from a crashed worker would make bind fail with
/// AddrInUse. Probe it: refuse only when something still answers.
#[cfg(unix)]
fn clear_stale_socket(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is in use by a live session", path.display()),
        )),
        Err(_) => match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        },
    }
}

#[cfg(unix)]
fn connect_unix_socket(
    path: &Path,
    deadline: Duration,
) -> io::Result<std::os::unix::net::UnixStream> {
    let started = Instant::now();
    loop {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if started.elapsed() >= deadline {
                    return Err(err);
                }
                thread::sleep(CONNECT_RETRY_INTERVAL);
            }
        }
    }
}

#[cfg(windows)]
fn to_wide_nul(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(windows)]
fn create_pipe_server(name: &str, direction: u32) -> io::Result<std::fs::File> {
    use std::os::windows::io::FromRawHandle;
    use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
    use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_FIRST_PIPE_INSTANCE;
    use windows_sys::Win32::System::Pipes::{
        CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
    };

    let wide = to_wide_nul(name);
    let handle = unsafe {
        CreateNamedPipeW(
            wide.as_ptr(),
            direction | FILE_FLAG_FIRST_PIPE_INSTANCE,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
            1,
            64 * 1024,
            64 * 1024,
            0,
            std::ptr::null(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { std::fs::File::from_raw_handle(handle as _) })
}

#[cfg(windows)]
fn wait_for_pipe_client(server: &std::fs::File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_PIPE_CONNECTED;
    use windows_sys::Win32::System::Pipes::ConnectNamedPipe;

    let ok = unsafe { ConnectNamedPipe(server.as_raw_handle() as _, std::ptr::null_mut()) };
    if ok != 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // The client can connect between CreateNamedPipeW and ConnectNamedPipe.
    if err.raw_os_error() == Some(ERROR_PIPE_CONNECTED as i32) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(windows)]
fn open_pipe_client(name: &str, access: u32, deadline: Duration) -> io::Result<std::fs::File> {
    use std::os::windows::io::FromRawHandle;
    use windows_sys::Win32::Foundation::{
        ERROR_FILE_NOT_FOUND, ERROR_PIPE_BUSY, INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, FILE_ATTRIBUTE_NORMAL, OPEN_EXISTING,
    };
    use windows_sys::Win32::System::Pipes::WaitNamedPipeW;

    let wide = to_wide_nul(name);
    let started = Instant::now();
    loop {
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                access,
                0,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                std::ptr::null_mut(),
            )
        };
        if handle != INVALID_HANDLE_VALUE {
            return Ok(unsafe { std::fs::File::from_raw_handle(handle as _) });
        }
        let err = io::Error::last_os_error();
        let code = err.raw_os_error().map(|c| c as u32);
        let retryable = matches!(code, Some(ERROR_PIPE_BUSY) | Some(ERROR_FILE_NOT_FOUND));
        if !retryable || started.elapsed() >= deadline {
            return Err(err);
        }
        if code == Some(ERROR_PIPE_BUSY) {
            unsafe { WaitNamedPipeW(wide.as_ptr(), 50) };
        } else {
            thread::sleep(CONNECT_RETRY_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_rejects_bad_session_names() {
        for name in ["", "a/b", "has space", "x".repeat(65).as_str()] {
            assert!(matches!(
                SessionAddress::derive(name, None),
                Err(ChannelError::InvalidSessionName(_))
            ));
        }
    }

    #[test]
    fn derive_is_deterministic() {
        let dir = Path::new("/tmp");
        let a = SessionAddress::derive("alpha-1", Some(dir)).unwrap();
        let b = SessionAddress::derive("alpha-1", Some(dir)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.session(), "alpha-1");
    }

    #[cfg(unix)]
    #[test]
    fn control_and_output_endpoints_differ() {
        let dir = Path::new("/tmp");
        let address = SessionAddress::derive("alpha-1", Some(dir)).unwrap();
        assert_ne!(address.control_path, address.output_path);
        assert!(address.describe().contains("alpha-1"));
    }

    #[test]
    fn generated_session_names_are_unique_and_valid() {
        let a = generate_session_name();
        let b = generate_session_name();
        assert_ne!(a, b);
        assert!(validate_session_name(&a).is_ok());
    }

    #[test]
    fn writer_thread_emits_one_line_per_message() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let (tx, rx) = mpsc::channel();
        let handle = spawn_writer(rx, Box::new(buf.clone()));
        tx.send(serde_json::json!({"a": 1})).unwrap();
        tx.send(serde_json::json!({"b": 2})).unwrap();
        drop(tx);
        handle.join().unwrap();

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
        assert!(text.ends_with('\n'));
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use std::io::{BufRead, BufReader};

        fn scratch_address(name: &str) -> (tempfile::TempDir, SessionAddress) {
            let dir = tempfile::tempdir().expect("create temp dir");
            let address = SessionAddress::derive(name, Some(dir.path())).unwrap();
            (dir, address)
        }

        #[test]
        fn control_channel_carries_host_lines_to_worker() {
            let (_dir, address) = scratch_address("chan-smoke");
            let listener = bind_control(&address).unwrap();

            let client = {
                let address = address.clone();
                thread::spawn(move || {
                    let mut writer = connect_control(&address, Duration::from_secs(5)).unwrap();
                    writer.write_all(b"{\"ping\":1}\n").unwrap();
                    writer.flush().unwrap();
                })
            };

            let reader = listener.accept().unwrap();
            let mut lines = BufReader::new(reader);
            let mut line = String::new();
            lines.read_line(&mut line).unwrap();
            assert_eq!(line.trim_end(), r#"{"ping":1}"#);
            client.join().unwrap();
        }

        #[test]
        fn stale_socket_file_is_cleared_on_rebind() {
            let (_dir, address) = scratch_address("chan-stale");
            let listener = bind_control(&address).unwrap();
            // Dropping the listener leaves the socket file behind.
            drop(listener);
            assert!(bind_control(&address).is_ok());
        }

        #[test]
        fn live_socket_is_not_stolen() {
            let (_dir, address) = scratch_address("chan-live");
            let _listener = bind_control(&address).unwrap();
            match bind_control(&address) {
                Err(ChannelError::Bind { source, .. }) => {
                    assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
                }
                other => panic!("expected bind failure, got {:?}", other.err()),
            }
        }
    }
}
