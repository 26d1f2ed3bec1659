#![allow(dead_code)]

use std::error::Error;
use std::path::PathBuf;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub fn resolve_exe() -> TestResult<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_replink") {
        return Ok(PathBuf::from(path));
    }
    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("replink");
    if path.exists() {
        return Ok(path);
    }
    Err("unable to locate replink test binary".into())
}

#[cfg(target_family = "unix")]
pub mod unix {
    use std::process::Stdio;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use replink::channel::{
        CONTROL_BOUND_MARKER, LOOP_LIVE_MARKER, OUTPUT_BOUND_MARKER, RUNTIME_DIR_ENV,
        SESSION_ID_ENV, SessionAddress,
    };
    use replink::events::EVENT_LOG_DIR_ENV;
    use replink::protocol::{ExecutionResult, WorkerToHostMessage, decode_worker_line};
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::UnixStream;
    use tokio::process::{Child, ChildStdout, Command};
    use tokio::time;

    use super::TestResult;

    pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

    static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

    /// One spawned worker with both channels connected and the readiness
    /// handshake already verified in marker order.
    pub struct WorkerFixture {
        pub child: Child,
        pub control: UnixStream,
        pub output: Lines<BufReader<UnixStream>>,
        pub stdout: Lines<BufReader<ChildStdout>>,
        _runtime_dir: tempfile::TempDir,
    }

    pub async fn spawn_worker() -> TestResult<WorkerFixture> {
        let exe = super::resolve_exe()?;
        let runtime_dir = tempfile::tempdir()?;
        let session = format!(
            "it-{}-{}",
            std::process::id(),
            SESSION_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let address = SessionAddress::derive(&session, Some(runtime_dir.path()))?;

        let mut child = Command::new(exe)
            .arg("--worker")
            .env(SESSION_ID_ENV, &session)
            .env(RUNTIME_DIR_ENV, runtime_dir.path())
            .env_remove(EVENT_LOG_DIR_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or("missing child stdout")?;
        let mut stdout = BufReader::new(stdout).lines();

        // Connect only between the second and third markers: both endpoints
        // are bound by then, and the loop marker confirms the accepts landed.
        expect_marker(&mut stdout, CONTROL_BOUND_MARKER).await?;
        expect_marker(&mut stdout, OUTPUT_BOUND_MARKER).await?;
        let control =
            time::timeout(STEP_TIMEOUT, UnixStream::connect(address.control_path())).await??;
        let output =
            time::timeout(STEP_TIMEOUT, UnixStream::connect(address.output_path())).await??;
        expect_marker(&mut stdout, LOOP_LIVE_MARKER).await?;

        Ok(WorkerFixture {
            child,
            control,
            output: BufReader::new(output).lines(),
            stdout,
            _runtime_dir: runtime_dir,
        })
    }

    /// Read stdout until `marker` appears, failing fast if a different
    /// readiness marker shows up first.
    async fn expect_marker(
        stdout: &mut Lines<BufReader<ChildStdout>>,
        marker: &str,
    ) -> TestResult<()> {
        let markers = [CONTROL_BOUND_MARKER, OUTPUT_BOUND_MARKER, LOOP_LIVE_MARKER];
        loop {
            let line = time::timeout(STEP_TIMEOUT, stdout.next_line())
                .await
                .map_err(|_| format!("timed out waiting for marker {marker}"))??
                .ok_or_else(|| format!("worker stdout closed before marker {marker}"))?;
            let line = line.trim();
            if line == marker {
                return Ok(());
            }
            if markers.contains(&line) {
                return Err(format!("expected marker {marker}, saw {line}").into());
            }
        }
    }

    impl WorkerFixture {
        /// Write one raw request line on the control channel.
        pub async fn send_line(&mut self, line: &str) -> TestResult<()> {
            self.control.write_all(line.as_bytes()).await?;
            self.control.write_all(b"\n").await?;
            self.control.flush().await?;
            Ok(())
        }

        /// Next decoded message off the output channel.
        pub async fn next_message(&mut self) -> TestResult<WorkerToHostMessage> {
            let line = self.next_output_line().await?;
            decode_worker_line(&line)
                .ok_or_else(|| format!("undecodable worker line: {line}").into())
        }

        /// Next output line as raw JSON, for asserting exact wire shape.
        pub async fn next_raw(&mut self) -> TestResult<Value> {
            let line = self.next_output_line().await?;
            Ok(serde_json::from_str(&line)?)
        }

        /// Next completion, skipping any display pushes that precede it.
        pub async fn next_completion(&mut self) -> TestResult<ExecutionResult> {
            loop {
                match self.next_message().await? {
                    WorkerToHostMessage::ExecutionComplete(result) => return Ok(result),
                    WorkerToHostMessage::PlotData(_) => continue,
                    other => return Err(format!("expected completion, got {other:?}").into()),
                }
            }
        }

        async fn next_output_line(&mut self) -> TestResult<String> {
            loop {
                let line = time::timeout(STEP_TIMEOUT, self.output.next_line())
                    .await
                    .map_err(|_| "timed out waiting for worker output")??
                    .ok_or("output channel closed")?;
                if line.trim().is_empty() {
                    continue;
                }
                return Ok(line);
            }
        }

        /// Close the control channel and wait for a clean worker exit.
        pub async fn shutdown(mut self) -> TestResult<()> {
            drop(self.control);
            let status = match time::timeout(STEP_TIMEOUT, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => return Err("worker did not exit after control channel closed".into()),
            };
            if !status.success() {
                return Err(format!("worker exit status: {status:?}").into());
            }
            Ok(())
        }
    }
}
