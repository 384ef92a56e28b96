// STOMP frame codec over a WebSocket text transport.
//
// Frames are text: a command line, header lines (`key:value`), a blank
// line, then the body terminated by a NUL byte. A bare EOL between frames
// is a heartbeat. The codec is incremental: callers feed raw bytes as they
// arrive and drain complete frames.

use bytes::{BufMut, BytesMut};

use super::error::{RelayError, Result};

/// Upper bound on a single frame, headers and body included.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Send,
    Disconnect,
    Message,
    Error,
    /// Anything else on the wire. Carried through untouched.
    Other(String),
}

impl Command {
    pub fn from_name(name: &str) -> Self {
        match name {
            "CONNECT" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "SEND" => Self::Send,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "ERROR" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Send => "SEND",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::Other(name) => name,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// CONNECTED reply sent after a successful handshake.
    pub fn connected(session_id: &str, heartbeat_ms: u64) -> Self {
        Self::new(Command::Connected)
            .with_header("version", "1.2")
            .with_header("session", session_id)
            .with_header("heart-beat", &format!("{heartbeat_ms},{heartbeat_ms}"))
    }

    /// MESSAGE frame delivering a JSON body to one subscription.
    pub fn message(destination: &str, subscription: &str, message_id: &str, body: &str) -> Self {
        Self::new(Command::Message)
            .with_header("destination", destination)
            .with_header("subscription", subscription)
            .with_header("message-id", message_id)
            .with_header("content-type", "application/json")
            .with_header("content-length", &body.len().to_string())
            .with_body(body.as_bytes().to_vec())
    }

    /// ERROR frame surfaced to the client before dropping it or the frame.
    pub fn error(message: &str) -> Self {
        Self::new(Command::Error)
            .with_header("message", message)
            .with_body(message.as_bytes().to_vec())
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        buf.put_slice(self.command.name().as_bytes());
        buf.put_u8(b'\n');
        for (k, v) in &self.headers {
            buf.put_slice(k.as_bytes());
            buf.put_u8(b':');
            buf.put_slice(v.as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);
        buf
    }

    /// Encoded frame as a String, for WebSocket text messages.
    pub fn encode_string(&self) -> String {
        String::from_utf8_lossy(&self.encode()).into_owned()
    }

    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|_| RelayError::Protocol("frame body is not valid UTF-8".into()))
    }
}

// ---------------------------------------------------------------------------
// Incremental decoding
// ---------------------------------------------------------------------------

/// One decoded unit off the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum StompEvent {
    Frame(Frame),
    Heartbeat,
}

/// Streaming decoder. Feed raw transport bytes, drain complete events.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete event, or `None` when more bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<StompEvent>> {
        // Bare EOL between frames is a heartbeat.
        match self.buffer.first() {
            None => return Ok(None),
            Some(b'\n') => {
                let _ = self.buffer.split_to(1);
                return Ok(Some(StompEvent::Heartbeat));
            }
            Some(b'\r') => {
                if self.buffer.len() < 2 {
                    return Ok(None);
                }
                if self.buffer[1] != b'\n' {
                    return Err(RelayError::Protocol("stray CR before frame".into()));
                }
                let _ = self.buffer.split_to(2);
                return Ok(Some(StompEvent::Heartbeat));
            }
            Some(_) => {}
        }

        let Some(head_end) = find_blank_line(&self.buffer) else {
            if self.buffer.len() > MAX_FRAME_SIZE {
                return Err(RelayError::Protocol("frame header block too large".into()));
            }
            return Ok(None);
        };

        let (command, headers) = parse_head(&self.buffer[..head_end])?;
        let body_start = head_end;

        let frame_end = match header_value(&headers, "content-length") {
            Some(raw) => {
                let len: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| RelayError::Protocol("invalid content-length header".into()))?;
                // The cap applies to the declared size, not the bytes
                // buffered so far.
                let end = body_start
                    .checked_add(len)
                    .filter(|&end| end <= MAX_FRAME_SIZE)
                    .ok_or_else(|| RelayError::Protocol("frame exceeds maximum size".into()))?;
                if end + 1 > self.buffer.len() {
                    return Ok(None);
                }
                if self.buffer[end] != 0 {
                    return Err(RelayError::Protocol(
                        "frame body not NUL-terminated after content-length".into(),
                    ));
                }
                end
            }
            None => match self.buffer[body_start..].iter().position(|&b| b == 0) {
                Some(offset) => body_start + offset,
                None => {
                    if self.buffer.len() > MAX_FRAME_SIZE {
                        return Err(RelayError::Protocol("unterminated frame too large".into()));
                    }
                    return Ok(None);
                }
            },
        };

        if frame_end > MAX_FRAME_SIZE {
            return Err(RelayError::Protocol("frame exceeds maximum size".into()));
        }

        let body = self.buffer[body_start..frame_end].to_vec();
        // Consume the frame and its NUL terminator.
        let _ = self.buffer.split_to(frame_end + 1);

        Ok(Some(StompEvent::Frame(Frame {
            command,
            headers,
            body,
        })))
    }
}

/// Offset one past the blank line ending the header block, if present.
fn find_blank_line(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    loop {
        let nl = buf[pos..].iter().position(|&b| b == b'\n')? + pos;
        let line = strip_cr(&buf[pos..nl]);
        if line.is_empty() && pos > 0 {
            return Some(nl + 1);
        }
        pos = nl + 1;
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn parse_head(head: &[u8]) -> Result<(Command, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| RelayError::Protocol("frame head is not valid UTF-8".into()))?;
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RelayError::Protocol("missing frame command".into()))?;
    let command = Command::from_name(command_line);

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RelayError::Protocol(format!("malformed header line: {line:?}")))?;
        headers.push((name.to_string(), value.to_string()));
    }
    Ok((command, headers))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
