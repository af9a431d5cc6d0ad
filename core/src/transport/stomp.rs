/// STOMP 1.2 frame codec (text frames carried in websocket messages)
use crate::error::{Result, SyncError};
use std::fmt;

/// Protocol version we speak
pub const STOMP_VERSION: &str = "1.2";

/// A bare EOL is a heartbeat
pub const HEARTBEAT: &str = "\n";

/// Frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => {
                return Err(SyncError::Protocol(format!("Unknown STOMP command: {}", other)));
            }
        })
    }

    /// CONNECT and CONNECTED headers are never escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header (repeated headers: first one wins)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, token: &str, heartbeat_out_ms: u64, heartbeat_in_ms: u64) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", STOMP_VERSION)
            .with_header("host", host)
            .with_header(
                "heart-beat",
                format!("{},{}", heartbeat_out_ms, heartbeat_in_ms),
            )
            .with_header("Authorization", format!("Bearer {}", token))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header("id", id)
    }

    pub fn send(destination: &str, json_body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(json_body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).with_header("receipt", receipt)
    }

    /// Heart-beat header as (cx, cy) milliseconds
    pub fn heartbeat(&self) -> Option<(u64, u64)> {
        let (x, y) = self.header("heart-beat")?.split_once(',')?;
        Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
    }

    /// Serialize to wire text, NUL-terminated
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse every frame in a websocket message; heartbeats yield nothing
    pub fn decode_all(raw: &str) -> Result<Vec<StompFrame>> {
        let mut frames = Vec::new();
        let mut rest = raw;
        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                break;
            }
            let (frame, consumed) = Self::decode_one(rest)?;
            frames.push(frame);
            rest = &rest[consumed..];
        }
        Ok(frames)
    }

    fn decode_one(input: &str) -> Result<(StompFrame, usize)> {
        let mut pos = 0;
        let mut lines = Vec::new();
        loop {
            let nl = input[pos..]
                .find('\n')
                .ok_or_else(|| SyncError::Protocol("Unterminated STOMP header block".to_string()))?;
            let line = input[pos..pos + nl].trim_end_matches('\r');
            pos += nl + 1;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let (command_line, header_lines) = lines
            .split_first()
            .ok_or_else(|| SyncError::Protocol("Missing STOMP command".to_string()))?;
        let command = Command::parse(command_line)?;

        let mut headers = Vec::with_capacity(header_lines.len());
        for line in header_lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| SyncError::Protocol(format!("Malformed header: {}", line)))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| SyncError::Protocol(format!("Bad content-length: {}", v)))
            })
            .transpose()?;

        let (body, consumed) = match content_length {
            Some(len) => {
                let end = pos
                    .checked_add(len)
                    .ok_or_else(|| SyncError::Protocol("Truncated STOMP body".to_string()))?;
                let body = input
                    .get(pos..end)
                    .ok_or_else(|| SyncError::Protocol("Truncated STOMP body".to_string()))?;
                if input.as_bytes().get(end) != Some(&0) {
                    return Err(SyncError::Protocol("Missing NUL after body".to_string()));
                }
                (body, end + 1)
            }
            None => {
                let nul = input[pos..]
                    .find('\0')
                    .ok_or_else(|| SyncError::Protocol("Missing NUL terminator".to_string()))?;
                (&input[pos..pos + nul], pos + nul + 1)
            }
        };

        Ok((
            StompFrame {
                command,
                headers,
                body: body.to_string(),
            },
            consumed,
        ))
    }
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

fn unescape_header(raw: &str) -> Result<String> {
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
            other => {
                return Err(SyncError::Protocol(format!(
                    "Invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_frame_layout() {
        let frame = StompFrame::connect("localhost", "tok", 4000, 4000);
        let wire = frame.encode();
        assert!(wire.starts_with("CONNECT\naccept-version:1.2\nhost:localhost\n"));
        assert!(wire.contains("heart-beat:4000,4000\n"));
        assert!(wire.contains("Authorization:Bearer tok\n"));
        assert!(wire.ends_with("\n\n\0"));
    }

    #[test]
    fn test_decode_message_with_content_length() {
        // content-length lets the body carry a NUL
        let raw = "MESSAGE\ndestination:/topic/5\nsubscription:sub-1\ncontent-length:10\n\n{\"id\":42}\0\0\n";
        let frames = StompFrame::decode_all(raw).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body, "{\"id\":42}\0");
        assert_eq!(frames[0].header("subscription"), Some("sub-1"));
    }

    #[test]
    fn test_decode_without_content_length_and_heartbeats() {
        let raw = "\n\nMESSAGE\ndestination:/topic/public\n\nhello\0\nRECEIPT\nreceipt-id:r1\n\n\0";
        let frames = StompFrame::decode_all(raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Message);
        assert_eq!(frames[0].body, "hello");
        assert_eq!(frames[1].command, Command::Receipt);
        assert!(StompFrame::decode_all(HEARTBEAT).unwrap().is_empty());
    }

    #[test]
    fn test_header_escaping() {
        let frame = StompFrame::new(Command::Send)
            .with_header("destination", "/app/a:b")
            .with_body("x");
        let wire = frame.encode();
        assert!(wire.contains("destination:/app/a\\cb\n"));
        let decoded = StompFrame::decode_all(&wire).unwrap();
        assert_eq!(decoded[0].header("destination"), Some("/app/a:b"));
        assert_eq!(decoded[0].body, "x");
    }

    #[test]
    fn test_connected_heartbeat_header() {
        let raw = "CONNECTED\nversion:1.2\nheart-beat:0,10000\n\n\0";
        let frames = StompFrame::decode_all(raw).unwrap();
        assert_eq!(frames[0].heartbeat(), Some((0, 10000)));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(StompFrame::decode_all("BOGUS\n\n\0").is_err());
        assert!(StompFrame::decode_all("MESSAGE\nno-colon\n\n\0").is_err());
        assert!(StompFrame::decode_all("MESSAGE\ndestination:/x\n\nbody-without-nul").is_err());
        assert!(StompFrame::decode_all("SEND\nbad:\\x\n\n\0").is_err());
    }

    #[test]
    fn test_oversized_content_length_is_an_error() {
        let raw = "MESSAGE\ndestination:/topic/public\ncontent-length:18446744073709551615\n\nx\0";
        assert!(matches!(
            StompFrame::decode_all(raw),
            Err(SyncError::Protocol(_))
        ));
        let short = "MESSAGE\ndestination:/topic/public\ncontent-length:40\n\nx\0";
        assert!(StompFrame::decode_all(short).is_err());
    }
}
