mod common;

#[cfg(target_family = "unix")]
mod unix {
    use std::process::Stdio;
    use std::time::Duration;

    use replink::channel::SESSION_ID_ENV;
    use tokio::process::Command;
    use tokio::time;

    use crate::common::unix::spawn_worker;
    use crate::common::{TestResult, resolve_exe};

    #[tokio::test]
    async fn worker_exits_when_control_channel_closes() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker
            .send_line(r#"{"CodeExecution":{"id":"last","code":"x = 1","execution_type":"ReplExecution"}}"#)
            .await?;
        let result = worker.next_completion().await?;
        assert!(result.success, "error: {:?}", result.error);
        // Dropping the control stream is the only shutdown signal there is.
        worker.shutdown().await
    }

    #[tokio::test]
    async fn worker_refuses_to_start_without_a_session_id() -> TestResult<()> {
        let exe = resolve_exe()?;
        let mut child = Command::new(exe)
            .arg("--worker")
            .env_remove(SESSION_ID_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let status = match time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(status) => status?,
            Err(_) => return Err("worker did not exit without a session id".into()),
        };
        assert!(!status.success(), "worker exit status: {status:?}");
        Ok(())
    }
}
