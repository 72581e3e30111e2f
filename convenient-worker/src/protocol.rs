//! Line-oriented worker protocol
//!
//! Every message is one JSON object terminated by a newline. The host sends a
//! handshake once per process lifetime, then one `command` per job; the worker
//! answers each with a message carrying the same `id`.
//!
//! ```text
//! -> {"type":"handshake","id":0,"protocol_version":"0","capabilities":[]}
//! <- {"type":"handshake","id":0,"protocol_version":"0","capabilities":[]}
//! -> {"type":"command","id":1,"args_path":"/tmp/1.args","stdout_path":"/tmp/1.out","stderr_path":"/tmp/1.err"}
//! <- {"type":"result","id":1,"exit_code":0}
//! ```

use crate::error::{WorkerError, WorkerResult};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::trace;

/// Protocol version sent in the handshake
pub const PROTOCOL_VERSION: &str = "0";

/// File locations of a single job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// File holding the job arguments
    pub args_path: PathBuf,
    /// File the worker writes the job's stdout into
    pub stdout_path: PathBuf,
    /// File the worker writes the job's stderr into
    pub stderr_path: PathBuf,
}

/// Host side of the worker protocol
pub trait CommandSender: Send {
    /// Perform the capability handshake
    fn handshake(&mut self, message_id: u64) -> WorkerResult<()>;

    /// Send a job
    fn send(&mut self, message_id: u64, command: &WorkerCommand) -> WorkerResult<()>;

    /// Block until the worker answers `message_id`, returning the job's exit code
    fn receive_command_response(&mut self, message_id: u64) -> WorkerResult<i32>;

    /// Tell the worker no more jobs follow
    fn close(&mut self) -> WorkerResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Message {
    Handshake {
        id: u64,
        protocol_version: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    Command {
        id: u64,
        args_path: PathBuf,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
    },
    Result {
        id: u64,
        exit_code: i32,
    },
    Error {
        id: u64,
        message: String,
    },
}

/// Newline-delimited JSON protocol over any writer/reader pair
pub struct JsonLineProtocol<W, R> {
    writer: Option<W>,
    reader: R,
}

impl<W: Write + Send, R: BufRead + Send> JsonLineProtocol<W, R> {
    /// Wrap the process's stdin and stdout
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            writer: Some(writer),
            reader,
        }
    }

    fn write_message(&mut self, message: &Message) -> WorkerResult<()> {
        let writer = self.writer.as_mut().ok_or(WorkerError::ProcessExited)?;
        let line = serde_json::to_string(message)?;
        trace!("-> {}", line);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn read_message(&mut self) -> WorkerResult<Message> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(WorkerError::ProcessExited);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        trace!("<- {}", line.trim_end());
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Consume the protocol, returning the reader
    pub fn into_reader(self) -> R {
        self.reader
    }
}

impl<W: Write + Send, R: BufRead + Send> CommandSender for JsonLineProtocol<W, R> {
    fn handshake(&mut self, message_id: u64) -> WorkerResult<()> {
        self.write_message(&Message::Handshake {
            id: message_id,
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Vec::new(),
        })?;

        match self.read_message()? {
            Message::Handshake {
                id,
                protocol_version,
                ..
            } => {
                if id != message_id {
                    return Err(WorkerError::UnexpectedMessageId {
                        expected: message_id,
                        actual: id,
                    });
                }
                if protocol_version != PROTOCOL_VERSION {
                    return Err(WorkerError::Protocol(format!(
                        "unsupported protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
                    )));
                }
                Ok(())
            }
            other => Err(WorkerError::Protocol(format!(
                "expected handshake response, got {other:?}"
            ))),
        }
    }

    fn send(&mut self, message_id: u64, command: &WorkerCommand) -> WorkerResult<()> {
        self.write_message(&Message::Command {
            id: message_id,
            args_path: command.args_path.clone(),
            stdout_path: command.stdout_path.clone(),
            stderr_path: command.stderr_path.clone(),
        })
    }

    fn receive_command_response(&mut self, message_id: u64) -> WorkerResult<i32> {
        let (id, outcome) = match self.read_message()? {
            Message::Result { id, exit_code } => (id, Ok(exit_code)),
            Message::Error { id, message } => (id, Err(WorkerError::Protocol(message))),
            other => {
                return Err(WorkerError::Protocol(format!(
                    "expected job result, got {other:?}"
                )));
            }
        };
        if id != message_id {
            return Err(WorkerError::UnexpectedMessageId {
                expected: message_id,
                actual: id,
            });
        }
        outcome
    }

    fn close(&mut self) -> WorkerResult<()> {
        // Dropping the writer closes the worker's stdin.
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn protocol(input: &str) -> JsonLineProtocol<Vec<u8>, Cursor<Vec<u8>>> {
        JsonLineProtocol::new(Vec::new(), Cursor::new(input.as_bytes().to_vec()))
    }

    fn sent(p: &JsonLineProtocol<Vec<u8>, Cursor<Vec<u8>>>) -> String {
        String::from_utf8(p.writer.clone().unwrap()).unwrap()
    }

    #[test]
    fn test_handshake_round() {
        let mut p = protocol("{\"type\":\"handshake\",\"id\":0,\"protocol_version\":\"0\",\"capabilities\":[]}\n");
        p.handshake(0).unwrap();
        let out = sent(&p);
        assert!(out.contains("\"type\":\"handshake\""));
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_handshake_rejects_wrong_id() {
        let mut p = protocol("{\"type\":\"handshake\",\"id\":3,\"protocol_version\":\"0\"}\n");
        assert!(matches!(
            p.handshake(0),
            Err(WorkerError::UnexpectedMessageId { expected: 0, actual: 3 })
        ));
    }

    #[test]
    fn test_command_and_result() {
        let mut p = protocol("\n{\"type\":\"result\",\"id\":7,\"exit_code\":2}\n");
        let command = WorkerCommand {
            args_path: "/t/7.args".into(),
            stdout_path: "/t/7.out".into(),
            stderr_path: "/t/7.err".into(),
        };
        p.send(7, &command).unwrap();
        assert_eq!(p.receive_command_response(7).unwrap(), 2);

        let out = sent(&p);
        assert!(out.contains("\"args_path\":\"/t/7.args\""));
        assert!(out.contains("\"id\":7"));
    }

    #[test]
    fn test_eof_is_process_exit() {
        let mut p = protocol("");
        assert!(matches!(p.receive_command_response(1), Err(WorkerError::ProcessExited)));
    }

    #[test]
    fn test_error_message_is_protocol_error() {
        let mut p = protocol("{\"type\":\"error\",\"id\":1,\"message\":\"bad args\"}\n");
        match p.receive_command_response(1) {
            Err(WorkerError::Protocol(msg)) => assert_eq!(msg, "bad args"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_send_after_close_fails() {
        let mut p = protocol("");
        p.close().unwrap();
        let command = WorkerCommand {
            args_path: "a".into(),
            stdout_path: "b".into(),
            stderr_path: "c".into(),
        };
        assert!(matches!(p.send(1, &command), Err(WorkerError::ProcessExited)));
    }
}
