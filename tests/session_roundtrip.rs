mod common;

#[cfg(target_family = "unix")]
mod unix {
    use crate::common::TestResult;
    use crate::common::unix::{WorkerFixture, spawn_worker};
    use replink::protocol::{DebugResponse, ExecutionType, UNPARSEABLE_ID, WorkerToHostMessage};

    async fn next_debug(worker: &mut WorkerFixture) -> TestResult<DebugResponse> {
        match worker.next_message().await? {
            WorkerToHostMessage::DebugMessageResponse(response) => Ok(response),
            other => Err(format!("expected debug response, got {other:?}").into()),
        }
    }

    #[tokio::test]
    async fn ping_answers_after_marker_handshake() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker.send_line(r#"{"ConnectionTest":{"id":"p1"}}"#).await?;
        match worker.next_message().await? {
            WorkerToHostMessage::ConnectionTestResponse { id, status } => {
                assert_eq!(id, "p1");
                assert_eq!(status, "ok");
            }
            other => panic!("expected connection test response, got {other:?}"),
        }
        worker.shutdown().await
    }

    #[tokio::test]
    async fn repl_addition_round_trips_on_the_wire() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker
            .send_line(r#"{"CodeExecution":{"id":"r1","code":"1+1","execution_type":"ReplExecution"}}"#)
            .await?;
        // The result echo travels first, as a display push.
        let push = worker.next_raw().await?;
        assert_eq!(push["PlotData"]["mime_type"], "text/plain");
        assert_eq!(push["PlotData"]["data"], "2");
        let reply = worker.next_raw().await?;
        let body = &reply["ExecutionComplete"];
        assert_eq!(body["id"], "r1");
        assert_eq!(body["success"], true);
        assert_eq!(body["result"], "2");
        assert!(body["error"].is_null());
        assert_eq!(body["execution_type"], "ReplExecution");
        worker.shutdown().await
    }

    #[tokio::test]
    async fn runtime_error_reports_backtrace_text() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker
            .send_line(r#"{"CodeExecution":{"id":"e1","code":"error('integration boom')","execution_type":"ReplExecution"}}"#)
            .await?;
        let result = worker.next_completion().await?;
        assert_eq!(result.id, "e1");
        assert!(!result.success);
        assert_eq!(result.result, None);
        let error = result.error.as_deref().unwrap_or_default();
        assert!(error.contains("integration boom"));
        assert!(error.contains("stack traceback"));
        worker.shutdown().await
    }

    #[tokio::test]
    async fn file_execution_evaluates_function_definitions() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker
            .send_line(r#"{"CodeExecution":{"id":"f1","code":"local function f(x)\n  return x + 1\nend\nf(41)","execution_type":"FileExecution"}}"#)
            .await?;
        let result = worker.next_completion().await?;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.id, "f1");
        assert_eq!(result.execution_type, ExecutionType::FileExecution);
        assert_eq!(result.result.as_deref(), Some("42"));
        worker.shutdown().await
    }

    #[tokio::test]
    async fn rich_value_pushes_plot_before_completion() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker
            .send_line(r#"{"CodeExecution":{"id":"g1","code":"({ mime = 'image/png', data = string.char(137, 80, 78, 71) })","execution_type":"ReplExecution"}}"#)
            .await?;
        match worker.next_message().await? {
            WorkerToHostMessage::PlotData(artifact) => {
                assert!(!artifact.id.is_empty());
                assert_eq!(artifact.mime_type, "image/png");
                assert_eq!(artifact.data, "iVBORw==");
                assert!(artifact.timestamp > 0);
            }
            other => panic!("expected plot push, got {other:?}"),
        }
        let result = worker.next_completion().await?;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.id, "g1");
        worker.shutdown().await
    }

    #[tokio::test]
    async fn queued_request_waits_for_the_evaluation_in_flight() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        // The second request is on the wire while the first is still spinning;
        // it reading "released" proves it did not start early.
        worker
            .send_line(r#"{"CodeExecution":{"id":"slow","code":"barrier = 'armed'\nlocal deadline = os.clock() + 0.2\nwhile os.clock() < deadline do end\nbarrier = 'released'\nbarrier","execution_type":"ReplExecution"}}"#)
            .await?;
        worker
            .send_line(r#"{"CodeExecution":{"id":"fast","code":"barrier","execution_type":"ReplExecution"}}"#)
            .await?;
        let first = worker.next_completion().await?;
        assert_eq!(first.id, "slow");
        assert_eq!(first.result.as_deref(), Some("released"));
        let second = worker.next_completion().await?;
        assert_eq!(second.id, "fast");
        assert_eq!(second.result.as_deref(), Some("released"));
        worker.shutdown().await
    }

    #[tokio::test]
    async fn unknown_tags_drop_while_unknown_debug_commands_fail() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker.send_line(r#"{"TotallyUnknownTag":{"id":"x1"}}"#).await?;
        worker
            .send_line(r#"{"DebugMessage":{"id":"d1","command":{"UnknownCommand":{}}}}"#)
            .await?;
        worker.send_line(r#"{"ConnectionTest":{"id":"p2"}}"#).await?;
        // Requests are handled in arrival order, so the first response being
        // the debug failure proves the unknown tag produced no reply at all.
        let response = next_debug(&mut worker).await?;
        assert_eq!(response.id, "d1");
        assert!(!response.success);
        let error = response.error.as_deref().unwrap_or_default();
        assert!(error.contains("UnknownCommand"));
        assert_eq!(response.detail["unmatched_keys"][0], "UnknownCommand");
        match worker.next_message().await? {
            WorkerToHostMessage::ConnectionTestResponse { id, .. } => assert_eq!(id, "p2"),
            other => panic!("expected connection test response, got {other:?}"),
        }
        worker.shutdown().await
    }

    #[tokio::test]
    async fn malformed_line_answers_with_sentinel_id() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker.send_line("this is not json").await?;
        let result = worker.next_completion().await?;
        assert_eq!(result.id, UNPARSEABLE_ID);
        assert!(!result.success);
        let error = result.error.as_deref().unwrap_or_default();
        assert!(error.contains("unparseable request"));
        worker.shutdown().await
    }

    #[tokio::test]
    async fn workspace_queries_read_live_state() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker
            .send_line(r#"{"CodeExecution":{"id":"a1","code":"answer = 42","execution_type":"ReplExecution"}}"#)
            .await?;
        let setup = worker.next_completion().await?;
        assert!(setup.success, "error: {:?}", setup.error);
        worker.send_line(r#"{"GetWorkspaceVariables":{"id":"w1"}}"#).await?;
        match worker.next_message().await? {
            WorkerToHostMessage::WorkspaceVariables { id, variables } => {
                assert_eq!(id, "w1");
                assert_eq!(variables.len(), 1);
                assert_eq!(variables[0].name, "answer");
                assert_eq!(variables[0].kind, "number");
                assert_eq!(variables[0].preview, "42");
            }
            other => panic!("expected workspace variables, got {other:?}"),
        }
        worker
            .send_line(r#"{"GetVariableValue":{"id":"v1","name":"answer"}}"#)
            .await?;
        match worker.next_message().await? {
            WorkerToHostMessage::VariableValue {
                id,
                name,
                kind,
                value,
            } => {
                assert_eq!(id, "v1");
                assert_eq!(name, "answer");
                assert_eq!(kind, "number");
                assert_eq!(value, "42");
            }
            other => panic!("expected variable value, got {other:?}"),
        }
        worker.shutdown().await
    }

    #[tokio::test]
    async fn debug_breakpoints_pause_and_resume_over_the_wire() -> TestResult<()> {
        let mut worker = spawn_worker().await?;
        worker
            .send_line(r#"{"DebugMessage":{"id":"b1","command":{"SetBreakpoint":{"file":"demo.lua","line":2}}}}"#)
            .await?;
        let armed = next_debug(&mut worker).await?;
        assert!(armed.success, "error: {:?}", armed.error);

        worker
            .send_line(r#"{"DebugMessage":{"id":"s1","command":{"StartDebug":{"file":"demo.lua","code":"local total = 0\ntotal = total + 1\ntotal = total + 41\nreturn total"}}}}"#)
            .await?;
        let paused = next_debug(&mut worker).await?;
        assert!(paused.success, "error: {:?}", paused.error);
        assert_eq!(paused.detail["status"], "paused");
        assert_eq!(paused.detail["file"], "demo.lua");
        assert_eq!(paused.detail["line"], 2);

        worker
            .send_line(r#"{"DebugMessage":{"id":"v1","command":{"GetVariables":{}}}}"#)
            .await?;
        let variables = next_debug(&mut worker).await?;
        assert!(variables.success);
        let listed = variables.detail["variables"]
            .as_array()
            .ok_or("variables not an array")?
            .clone();
        assert!(
            listed
                .iter()
                .any(|v| v["name"] == "total" && v["value"] == "0")
        );

        worker
            .send_line(r#"{"DebugMessage":{"id":"c1","command":{"Continue":{}}}}"#)
            .await?;
        let finished = next_debug(&mut worker).await?;
        assert!(finished.success, "error: {:?}", finished.error);
        assert_eq!(finished.detail["status"], "completed");
        assert_eq!(finished.detail["result"], "42");
        worker.shutdown().await
    }
}
