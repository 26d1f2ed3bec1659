//! Display capture.
//!
//! Evaluation results and explicit `display(...)` calls are turned into
//! [`DisplayArtifact`] pushes on the output channel. Rich values are plain Lua
//! tables carrying string `mime` and `data` fields; everything else renders as
//! `text/plain` after passing a noise filter. Pushes are fire and forget: a
//! full or closed channel never fails the evaluation that produced the value.

use std::sync::mpsc::Sender;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mlua::{Table, Value};

use crate::protocol::{DisplayArtifact, WorkerToHostMessage, next_artifact_id, now_ms};

#[derive(Clone)]
pub struct DisplayPipeline {
    sender: Sender<WorkerToHostMessage>,
}

impl DisplayPipeline {
    pub fn new(sender: Sender<WorkerToHostMessage>) -> Self {
        DisplayPipeline { sender }
    }

    /// Offer a successful evaluation result. Nil never displays and a plain
    /// table is a bulk container rather than output, so both are dropped.
    pub fn offer_value(&self, value: &Value, rendered: Option<&str>, source: &str) {
        match value {
            Value::Nil => {}
            Value::Table(table) => {
                if let Some((mime, bytes)) = rich_payload(table) {
                    self.push_media(&mime, &bytes);
                }
            }
            _ => {
                if let Some(text) = rendered {
                    if should_display(text, source) {
                        self.push_text(text);
                    }
                }
            }
        }
    }

    /// Handle an explicit `display(value)` call from user code. Unlike
    /// [`offer_value`](Self::offer_value) a non-rich table still renders,
    /// since the user asked for it by name.
    pub fn display_call(&self, value: &Value, rendered: Option<&str>) {
        match value {
            Value::Nil => {}
            Value::Table(table) => {
                if let Some((mime, bytes)) = rich_payload(table) {
                    self.push_media(&mime, &bytes);
                } else if let Some(text) = rendered {
                    if should_display(text, "") {
                        self.push_text(text);
                    }
                }
            }
            _ => {
                if let Some(text) = rendered {
                    if should_display(text, "") {
                        self.push_text(text);
                    }
                }
            }
        }
    }

    fn push_media(&self, mime: &str, bytes: &[u8]) {
        let data = if is_textual_mime(mime) {
            String::from_utf8_lossy(bytes).into_owned()
        } else {
            BASE64.encode(bytes)
        };
        self.push_artifact(mime, data);
    }

    fn push_text(&self, text: &str) {
        self.push_artifact("text/plain", text.to_string());
    }

    fn push_artifact(&self, mime_type: &str, data: String) {
        let artifact = DisplayArtifact {
            id: next_artifact_id(),
            mime_type: mime_type.to_string(),
            data,
            timestamp: now_ms(),
        };
        let _ = self.sender.send(WorkerToHostMessage::PlotData(artifact));
    }
}

/// Extract the rich-value convention from a table: string `mime` and `data`
/// fields, both non-empty. Raw access keeps metamethods out of the decision.
fn rich_payload(table: &Table) -> Option<(String, Vec<u8>)> {
    let mime: mlua::String = table.raw_get::<Option<mlua::String>>("mime").ok().flatten()?;
    let data: mlua::String = table.raw_get::<Option<mlua::String>>("data").ok().flatten()?;
    let mime = mime.to_string_lossy().to_string();
    let bytes = data.as_bytes().to_vec();
    if mime.trim().is_empty() || bytes.is_empty() {
        return None;
    }
    Some((mime, bytes))
}

/// Decide whether rendered text is worth pushing. Total over any string pair
/// and idempotent; rejects the usual incidental noise.
pub fn should_display(text: &str, source: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if matches!(trimmed, "true" | "false" | "nil") {
        return false;
    }
    if is_empty_collection(trimmed) {
        return false;
    }
    let source = source.trim();
    if is_bare_identifier(source) && trimmed == source {
        return false;
    }
    true
}

fn is_empty_collection(text: &str) -> bool {
    let Some(first) = text.chars().next() else {
        return false;
    };
    let Some(last) = text.chars().last() else {
        return false;
    };
    let delimited = matches!((first, last), ('{', '}') | ('[', ']') | ('(', ')'));
    delimited && text[1..text.len() - 1].trim().is_empty()
}

/// A lone variable name, possibly a dotted path like `a.b.c`.
fn is_bare_identifier(source: &str) -> bool {
    if source.is_empty() {
        return false;
    }
    source.split('.').all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}

fn is_textual_mime(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "image/svg+xml"
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;
    use std::sync::mpsc;

    fn pipeline() -> (DisplayPipeline, mpsc::Receiver<WorkerToHostMessage>) {
        let (tx, rx) = mpsc::channel();
        (DisplayPipeline::new(tx), rx)
    }

    fn next_artifact(rx: &mpsc::Receiver<WorkerToHostMessage>) -> DisplayArtifact {
        match rx.try_recv().expect("artifact pushed") {
            WorkerToHostMessage::PlotData(artifact) => artifact,
            other => panic!("expected plot data, got {other:?}"),
        }
    }

    #[test]
    fn filter_rejects_known_noise() {
        let cases = [
            ("", ""),
            ("   ", ""),
            ("true", ""),
            ("false", ""),
            ("nil", ""),
            ("{}", ""),
            ("[]", ""),
            ("()", ""),
            ("{  }", ""),
            ("counter", "counter"),
            ("config.port", " config.port "),
        ];
        for (text, source) in cases {
            assert!(!should_display(text, source), "{text:?} should be rejected");
        }
    }

    #[test]
    fn filter_accepts_ordinary_results() {
        let cases = [
            ("2", "1+1"),
            ("hello", "greet()"),
            ("counter", "fetch_name()"),
            ("{1, 2, 3}", "list"),
            ("-4.5", "x - y"),
        ];
        for (text, source) in cases {
            assert!(should_display(text, source), "{text:?} should be accepted");
        }
    }

    #[test]
    fn filter_is_total_and_idempotent() {
        let inputs: Vec<String> = vec![
            String::new(),
            "\u{0}\u{1}binary-ish".to_string(),
            "日本語のテキスト".to_string(),
            "a".repeat(1 << 16),
            "(".to_string(),
            "{unclosed".to_string(),
        ];
        for text in &inputs {
            let first = should_display(text, "src");
            let second = should_display(text, "src");
            assert_eq!(first, second);
        }
    }

    #[test]
    fn rich_table_pushes_base64_for_binary_mime() {
        let lua = Lua::new();
        let (pipeline, rx) = pipeline();
        let table: Table = lua
            .load(r#"{ mime = "image/png", data = string.char(137, 80, 78, 71) }"#)
            .eval()
            .unwrap();
        pipeline.offer_value(&Value::Table(table), None, "make_plot()");
        let artifact = next_artifact(&rx);
        assert_eq!(artifact.mime_type, "image/png");
        assert_eq!(artifact.data, "iVBORw==");
        assert!(!artifact.id.is_empty());
        assert!(artifact.timestamp > 0);
    }

    #[test]
    fn rich_table_passes_textual_payload_through() {
        let lua = Lua::new();
        let (pipeline, rx) = pipeline();
        let table: Table = lua
            .load(r#"{ mime = "text/html", data = "<b>hi</b>" }"#)
            .eval()
            .unwrap();
        pipeline.offer_value(&Value::Table(table), None, "");
        let artifact = next_artifact(&rx);
        assert_eq!(artifact.mime_type, "text/html");
        assert_eq!(artifact.data, "<b>hi</b>");
    }

    #[test]
    fn plain_table_result_is_not_pushed() {
        let lua = Lua::new();
        let (pipeline, rx) = pipeline();
        let table: Table = lua.load(r#"{ 1, 2, 3 }"#).eval().unwrap();
        pipeline.offer_value(&Value::Table(table), Some("table: 0x1"), "list");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rich_table_with_empty_data_is_not_rich() {
        let lua = Lua::new();
        let (pipeline, rx) = pipeline();
        let table: Table = lua
            .load(r#"{ mime = "image/png", data = "" }"#)
            .eval()
            .unwrap();
        pipeline.offer_value(&Value::Table(table), None, "");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn display_call_renders_non_rich_values() {
        let (pipeline, rx) = pipeline();
        pipeline.display_call(&Value::Integer(42), Some("42"));
        let artifact = next_artifact(&rx);
        assert_eq!(artifact.mime_type, "text/plain");
        assert_eq!(artifact.data, "42");
    }

    #[test]
    fn closed_channel_does_not_panic() {
        let (pipeline, rx) = pipeline();
        drop(rx);
        pipeline.push_text("still fine");
    }
}
