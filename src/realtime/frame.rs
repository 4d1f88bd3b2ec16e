//! STOMP 1.2 frames as carried in WebSocket text messages.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header")]
    InvalidEscape,
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame truncated")]
    Truncated,
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    // CONNECT and CONNECTED headers are sent verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins when a header is repeated.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, access_token: Option<&str>, heart_beat: HeartBeat) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", heart_beat.to_string());
        if let Some(token) = access_token {
            frame = frame.header("access", token);
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).header("receipt", receipt)
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');

        for (key, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(key));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(key);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decodes every frame in one transport message. Heart-beat EOLs yield nothing.
    pub fn decode_all(text: &str) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        let mut rest = text.as_bytes();
        while let Some((frame, consumed)) = decode_one(rest)? {
            frames.push(frame);
            rest = &rest[consumed..];
        }
        Ok(frames)
    }
}

fn decode_one(input: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    let start = input
        .iter()
        .position(|b| *b != b'\n' && *b != b'\r')
        .unwrap_or(input.len());
    if start == input.len() {
        return Ok(None);
    }

    let mut pos = start;

    let command: Command = read_line(input, &mut pos)?.parse()?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let line = read_line(input, &mut pos)?;
        if line.is_empty() {
            break;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(key)?, unescape_header(value)?));
        } else {
            headers.push((key.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(v.clone()))
        })
        .transpose()?;

    let rest = &input[pos..];
    let (body, consumed) = match content_length {
        Some(len) => {
            if rest.len() < len {
                return Err(FrameError::Truncated);
            }
            // The NUL after a sized body is mandatory.
            if rest.get(len).is_some_and(|b| *b != 0) {
                return Err(FrameError::Truncated);
            }
            (&rest[..len], (len + 1).min(rest.len()))
        }
        None => match rest.iter().position(|b| *b == 0) {
            Some(nul) => (&rest[..nul], nul + 1),
            None => (rest, rest.len()),
        },
    };

    let body = String::from_utf8(body.to_vec()).map_err(|_| FrameError::InvalidUtf8)?;
    Ok(Some((
        Frame {
            command,
            headers,
            body,
        },
        pos + consumed,
    )))
}

fn read_line<'a>(input: &'a [u8], pos: &mut usize) -> Result<&'a str, FrameError> {
    let rel = input[*pos..]
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(FrameError::Truncated)?;
    let mut line = &input[*pos..*pos + rel];
    *pos += rel + 1;
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape),
        }
    }
    Ok(out)
}

/// `heart-beat` header value: what a peer can send and wants to receive, in ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub send_ms: u64,
    pub receive_ms: u64,
}

impl HeartBeat {
    pub fn new(send_ms: u64, receive_ms: u64) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (send, receive) = value.split_once(',')?;
        Some(Self {
            send_ms: send.trim().parse().ok()?,
            receive_ms: receive.trim().parse().ok()?,
        })
    }

    /// Interval at which the client must send an EOL, given the server's header.
    pub fn outgoing_interval(self, server: HeartBeat) -> Option<Duration> {
        if self.send_ms == 0 || server.receive_ms == 0 {
            return None;
        }
        Some(Duration::from_millis(self.send_ms.max(server.receive_ms)))
    }

    /// Interval at which the server promised to send something, given its header.
    pub fn incoming_interval(self, server: HeartBeat) -> Option<Duration> {
        if self.receive_ms == 0 || server.send_ms == 0 {
            return None;
        }
        Some(Duration::from_millis(self.receive_ms.max(server.send_ms)))
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_escapes_headers_and_sizes_body() {
        let frame = Frame::send("/pub/chat/message/3", r#"{"content":"a:b"}"#)
            .header("x-note", "line\nbreak:colon\\slash");
        let wire = frame.encode();

        assert!(wire.starts_with("SEND\ndestination:/pub/chat/message/3\n"));
        assert!(wire.contains("x-note:line\\nbreak\\ccolon\\\\slash\n"));
        assert!(wire.contains("content-length:17\n"));
        assert!(wire.ends_with("\n\n{\"content\":\"a:b\"}\0"));

        let decoded = Frame::decode_all(&wire).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].get("x-note"), Some("line\nbreak:colon\\slash"));
        assert_eq!(decoded[0].body, r#"{"content":"a:b"}"#);
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let frame = Frame::connect("moimate.example", Some("a:b"), HeartBeat::new(10000, 10000));
        let wire = frame.encode();
        assert!(wire.contains("access:a:b\n"));
        assert!(wire.contains("heart-beat:10000,10000\n"));
    }

    #[test]
    fn content_length_allows_embedded_nul() {
        let wire = "MESSAGE\ndestination:/sub/x\ncontent-length:5\n\nab\0cd\0";
        let frames = Frame::decode_all(wire).unwrap();
        assert_eq!(frames[0].body, "ab\0cd");
    }

    #[test]
    fn heartbeats_and_multiple_frames() {
        let wire = "\n\r\nRECEIPT\nreceipt-id:1\n\n\0\nMESSAGE\nsubscription:sub-1\n\nhello\0\n";
        let frames = Frame::decode_all(wire).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Receipt);
        assert_eq!(frames[1].get("subscription"), Some("sub-1"));
        assert_eq!(frames[1].body, "hello");

        assert!(Frame::decode_all("\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(
            Frame::decode_all("BOGUS\n\n\0"),
            Err(FrameError::UnknownCommand("BOGUS".into()))
        );
        assert_eq!(
            Frame::decode_all("MESSAGE\nno-colon\n\n\0"),
            Err(FrameError::MalformedHeader("no-colon".into()))
        );
        assert_eq!(
            Frame::decode_all("MESSAGE\nk:bad\\t\n\n\0"),
            Err(FrameError::InvalidEscape)
        );
        assert_eq!(
            Frame::decode_all("MESSAGE\ncontent-length:10\n\nshort\0"),
            Err(FrameError::Truncated)
        );
    }

    #[test]
    fn first_repeated_header_wins() {
        let frame = Frame::decode_all("MESSAGE\nfoo:1\nfoo:2\n\n\0").unwrap().remove(0);
        assert_eq!(frame.get("foo"), Some("1"));
    }

    #[test]
    fn heart_beat_negotiation() {
        let client = HeartBeat::new(10000, 10000);
        assert_eq!(
            client.outgoing_interval(HeartBeat::parse("0,20000").unwrap()),
            Some(Duration::from_millis(20000))
        );
        assert_eq!(client.outgoing_interval(HeartBeat::parse("0,0").unwrap()), None);
        assert_eq!(
            client.incoming_interval(HeartBeat::parse("25000,0").unwrap()),
            Some(Duration::from_millis(25000))
        );
        assert_eq!(client.incoming_interval(HeartBeat::parse("0,20000").unwrap()), None);
        assert_eq!(
            HeartBeat::new(10000, 0).incoming_interval(HeartBeat::parse("5000,5000").unwrap()),
            None
        );
        assert_eq!(HeartBeat::parse("nope"), None);
    }
}
