//! IPC protocol for communicating with script child processes
//!
//! One JSON object per line on the child's stdin and stdout. Lines on stdout
//! that are not protocol messages are the script's console output.

use anyhow::{Context, Result};
use scriptlink_runtime::AckId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

/// `type` tag carried by every protocol message
pub const MESSAGE_TYPE: &str = "ipc-event-emitter";

/// Event a child receives when it is asked to shut down
pub const KILL_EVENT: &str = "kill";

/// A protocol message in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    /// `[name, ...args]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emit: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckId>,
    /// Reply arguments, only set on replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
}

impl IpcMessage {
    pub fn emit(name: impl Into<String>, args: Vec<Value>) -> Self {
        let mut emit = Vec::with_capacity(args.len() + 1);
        emit.push(Value::String(name.into()));
        emit.extend(args);
        Self {
            message_type: MESSAGE_TYPE.to_string(),
            emit,
            ack: None,
            args: None,
        }
    }

    /// An emit the child is expected to answer with a reply carrying `ack`
    pub fn request(name: impl Into<String>, args: Vec<Value>, ack: AckId) -> Self {
        Self {
            ack: Some(ack),
            ..Self::emit(name, args)
        }
    }

    pub fn kill() -> Self {
        Self::emit(KILL_EVENT, Vec::new())
    }
}

/// A classified line of child output
#[derive(Debug, Clone, PartialEq)]
pub enum ChildLine {
    /// The child emitted an event
    Emit { name: String, payload: Value },
    /// The child answered a request
    Reply { ack: AckId, payload: Value },
    /// Anything else the child printed
    Console(String),
}

/// Collapse an argument list into one payload: a lone argument is sent as
/// itself, anything else as an array.
pub fn collapse_args(mut args: Vec<Value>) -> Value {
    if args.len() == 1 {
        args.remove(0)
    } else {
        Value::Array(args)
    }
}

/// Classify one line of child stdout. Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Option<ChildLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let Ok(message) = serde_json::from_str::<IpcMessage>(line) else {
        return Some(ChildLine::Console(line.to_string()));
    };
    if message.message_type != MESSAGE_TYPE {
        return Some(ChildLine::Console(line.to_string()));
    }

    let mut emit = message.emit.into_iter();
    match (emit.next(), message.ack) {
        (Some(Value::String(name)), _) => Some(ChildLine::Emit {
            name,
            payload: collapse_args(emit.collect()),
        }),
        (None, Some(ack)) => Some(ChildLine::Reply {
            ack,
            payload: collapse_args(message.args.unwrap_or_default()),
        }),
        _ => Some(ChildLine::Console(line.to_string())),
    }
}

/// IPC writer for sending messages to a child process
pub struct IpcWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a message to the child
    pub async fn send(&mut self, message: &IpcMessage) -> Result<()> {
        let mut line = serde_json::to_vec(message).context("encoding IPC message")?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// IPC reader for receiving lines from a child process
pub struct IpcReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Receive the next non-blank line, or `None` at end of stream
    pub async fn recv(&mut self) -> Result<Option<ChildLine>> {
        while let Some(line) = self.lines.next_line().await? {
            if let Some(parsed) = parse_line(&line) {
                return Ok(Some(parsed));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_emit_with_one_arg_collapses() {
        let line = r#"{"type":"ipc-event-emitter","emit":["ready",{"x":1}]}"#;
        assert_eq!(
            parse_line(line),
            Some(ChildLine::Emit {
                name: "ready".into(),
                payload: json!({"x": 1})
            })
        );
    }

    #[test]
    fn test_emit_with_many_args_stays_array() {
        let line = r#"{"type":"ipc-event-emitter","emit":["pos",1,2]}"#;
        assert_eq!(
            parse_line(line),
            Some(ChildLine::Emit {
                name: "pos".into(),
                payload: json!([1, 2])
            })
        );

        let bare = r#"{"type":"ipc-event-emitter","emit":["tick"]}"#;
        assert_eq!(
            parse_line(bare),
            Some(ChildLine::Emit {
                name: "tick".into(),
                payload: json!([])
            })
        );
    }

    #[test]
    fn test_reply_line() {
        let line = r#"{"type":"ipc-event-emitter","ack":4,"args":["pong"]}"#;
        assert_eq!(
            parse_line(line),
            Some(ChildLine::Reply {
                ack: 4,
                payload: json!("pong")
            })
        );
    }

    #[test]
    fn test_other_output_is_console() {
        assert_eq!(parse_line("  hello world \n"), Some(ChildLine::Console("hello world".into())));
        assert_eq!(
            parse_line(r#"{"type":"other","emit":["x"]}"#),
            Some(ChildLine::Console(r#"{"type":"other","emit":["x"]}"#.into()))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn test_request_serializes_ack() {
        let encoded = serde_json::to_value(IpcMessage::request("ping", vec![json!(1)], 9)).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "ipc-event-emitter", "emit": ["ping", 1], "ack": 9})
        );
        assert_eq!(
            serde_json::to_value(IpcMessage::kill()).unwrap(),
            json!({"type": "ipc-event-emitter", "emit": ["kill"]})
        );
    }

    #[tokio::test]
    async fn test_writer_and_reader_share_framing() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = IpcWriter::new(client);
        let mut reader = IpcReader::new(server);

        writer.send(&IpcMessage::emit("ping", vec![json!(2)])).await.unwrap();
        drop(writer);

        assert_eq!(
            reader.recv().await.unwrap(),
            Some(ChildLine::Emit {
                name: "ping".into(),
                payload: json!(2)
            })
        );
        assert_eq!(reader.recv().await.unwrap(), None);
    }
}
