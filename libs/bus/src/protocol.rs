//! Wire format: outbound command framing and the inbound parser.
//!
//! The parser is a two-state machine over an accumulating buffer:
//!
//! - `AwaitingControlLine`: wait for a CRLF-terminated line and classify it
//!   as `MSG`, `+OK`, `-ERR`, `PING`, `PONG`, `INFO` or unknown
//! - `AwaitingMsgPayload`: after a `MSG` line, wait until the declared number
//!   of payload bytes plus the trailing CRLF are buffered
//!
//! Incomplete input is never an error; the parser keeps what it has and
//! resumes once more bytes arrive.

use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::options::ConnectInfo;

pub const CRLF: &[u8] = b"\r\n";

/// Largest payload accepted from the broker (64 MB).
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";

// =============================================================================
// Outbound Commands
// =============================================================================

pub fn connect(info: &ConnectInfo<'_>) -> Result<Bytes, serde_json::Error> {
    let body = serde_json::to_vec(info)?;
    let mut buf = BytesMut::with_capacity(body.len() + 10);
    buf.put_slice(b"CONNECT ");
    buf.put_slice(&body);
    buf.put_slice(CRLF);
    Ok(buf.freeze())
}

pub fn publish(subject: &str, reply: Option<&str>, payload: &[u8]) -> Bytes {
    let header = match reply {
        Some(reply) => format!("PUB {} {} {}\r\n", subject, reply, payload.len()),
        None => format!("PUB {} {}\r\n", subject, payload.len()),
    };
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(CRLF);
    buf.freeze()
}

pub fn subscribe(subject: &str, queue: Option<&str>, sid: u64) -> Bytes {
    match queue {
        Some(queue) => Bytes::from(format!("SUB {subject} {queue} {sid}\r\n")),
        None => Bytes::from(format!("SUB {subject} {sid}\r\n")),
    }
}

pub fn unsubscribe(sid: u64, max: Option<u64>) -> Bytes {
    match max {
        Some(max) => Bytes::from(format!("UNSUB {sid} {max}\r\n")),
        None => Bytes::from(format!("UNSUB {sid}\r\n")),
    }
}

// =============================================================================
// Inbound Operations
// =============================================================================

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// One operation received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Msg(Message),
    Ok,
    Err(String),
    Ping,
    Pong,
    Info(String),
    Unknown(String),
}

#[derive(Debug)]
enum ParseState {
    AwaitingControlLine,
    AwaitingMsgPayload {
        subject: String,
        sid: u64,
        reply: Option<String>,
        size: usize,
    },
}

/// Incremental parser for the broker's byte stream.
#[derive(Debug)]
pub struct Parser {
    buf: BytesMut,
    state: ParseState,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            state: ParseState::AwaitingControlLine,
        }
    }

    /// Appends bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read directly into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet consumed by a complete operation.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete operation, or `None` if more input is needed.
    pub fn next_op(&mut self) -> Result<Option<ServerOp>, ProtocolError> {
        loop {
            match mem::replace(&mut self.state, ParseState::AwaitingControlLine) {
                ParseState::AwaitingControlLine => {
                    let Some(pos) = find_crlf(&self.buf) else {
                        return Ok(None);
                    };

                    let line = self.buf.split_to(pos + CRLF.len());
                    let line = std::str::from_utf8(&line[..pos])
                        .map_err(|_| ProtocolError::InvalidUtf8)?;

                    match parse_control_line(line)? {
                        ControlLine::Msg {
                            subject,
                            sid,
                            reply,
                            size,
                        } => {
                            self.state = ParseState::AwaitingMsgPayload {
                                subject,
                                sid,
                                reply,
                                size,
                            };
                        }
                        ControlLine::Op(op) => return Ok(Some(op)),
                    }
                }
                ParseState::AwaitingMsgPayload {
                    subject,
                    sid,
                    reply,
                    size,
                } => {
                    if self.buf.len() < size + CRLF.len() {
                        self.state = ParseState::AwaitingMsgPayload {
                            subject,
                            sid,
                            reply,
                            size,
                        };
                        return Ok(None);
                    }

                    let payload = self.buf.split_to(size).freeze();
                    let terminator = self.buf.split_to(CRLF.len());
                    if &terminator[..] != CRLF {
                        return Err(ProtocolError::MissingTerminator);
                    }

                    return Ok(Some(ServerOp::Msg(Message {
                        subject,
                        sid,
                        reply,
                        payload,
                    })));
                }
            }
        }
    }

    /// Drops buffered input, e.g. after the connection was replaced.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = ParseState::AwaitingControlLine;
    }
}

enum ControlLine {
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        size: usize,
    },
    Op(ServerOp),
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|w| w == CRLF)
}

fn parse_control_line(line: &str) -> Result<ControlLine, ProtocolError> {
    let trimmed = line.trim_start();
    let (verb, rest) = match trimmed.find(char::is_whitespace) {
        Some(pos) => (&trimmed[..pos], trimmed[pos..].trim()),
        None => (trimmed, ""),
    };

    let op = match verb.to_ascii_uppercase().as_str() {
        "MSG" => return parse_msg_args(line, rest),
        "+OK" => ServerOp::Ok,
        "-ERR" => ServerOp::Err(rest.trim_matches('\'').to_string()),
        "PING" => ServerOp::Ping,
        "PONG" => ServerOp::Pong,
        "INFO" if !rest.is_empty() => ServerOp::Info(rest.to_string()),
        _ => ServerOp::Unknown(line.to_string()),
    };

    Ok(ControlLine::Op(op))
}

fn parse_msg_args(line: &str, args: &str) -> Result<ControlLine, ProtocolError> {
    let malformed = || ProtocolError::MalformedMsg(line.to_string());
    let parts: Vec<&str> = args.split_whitespace().collect();

    let (subject, sid, reply, size) = match parts.as_slice() {
        [subject, sid, size] => (*subject, *sid, None, *size),
        [subject, sid, reply, size] => (*subject, *sid, Some(*reply), *size),
        _ => return Err(malformed()),
    };

    let sid = sid.parse::<u64>().map_err(|_| malformed())?;
    let size = size.parse::<usize>().map_err(|_| malformed())?;
    if size > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(size));
    }

    Ok(ControlLine::Msg {
        subject: subject.to_string(),
        sid,
        reply: reply.map(str::to_string),
        size,
    })
}
