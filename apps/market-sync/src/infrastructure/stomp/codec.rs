//! STOMP 1.2 Frame Codec
//!
//! Encodes and decodes STOMP frames carried in WebSocket text messages.
//!
//! # Frame Layout
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//!
//! Header names and values are escaped (`\\`, `\n`, `\c`, `\r`) except on
//! `CONNECT` and `CONNECTED` frames. A `content-length` header fixes the body
//! length in bytes; otherwise the body runs to the first NUL. Bare EOLs
//! between frames are heart-beats.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::credentials::AccessToken;

/// Frame terminator.
const NUL: char = '\0';

/// A heart-beat is a single end-of-line.
pub const HEARTBEAT: &str = "\n";

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Command line is not a STOMP command.
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),

    /// Header line has no `:` separator.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    /// Header contains an undefined escape sequence.
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    /// `content-length` is not a byte count.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    /// Frame ended before its terminator.
    #[error("incomplete frame")]
    Incomplete,

    /// `heart-beat` header is not `<cx>,<cy>`.
    #[error("invalid heart-beat header: {0}")]
    InvalidHeartBeat(String),
}

// =============================================================================
// Commands
// =============================================================================

/// STOMP commands used by the client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Client: open a session.
    Connect,
    /// Client: publish a message.
    Send,
    /// Client: register for a destination.
    Subscribe,
    /// Client: cancel a subscription.
    Unsubscribe,
    /// Client: close the session.
    Disconnect,
    /// Server: session accepted.
    Connected,
    /// Server: message for a subscription.
    Message,
    /// Server: receipt for a client frame.
    Receipt,
    /// Server: error, connection will close.
    Error,
}

impl Command {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Whether headers of this command are written without escaping.
    const fn raw_headers(self) -> bool {
        matches!(self, Self::Connect | Self::Connected)
    }
}

impl FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" | "STOMP" => Self::Connect,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "CONNECTED" => Self::Connected,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(CodecError::UnknownCommand(other.to_string())),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Heart-beat
// =============================================================================

/// A `heart-beat` header value: `<outgoing>,<incoming>` in milliseconds.
///
/// Zero means the sender cannot send (outgoing) or does not want to
/// receive (incoming) heart-beats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// Smallest interval at which the sender can emit beats.
    pub outgoing: Duration,
    /// Desired interval at which the sender wants to receive beats.
    pub incoming: Duration,
}

impl HeartBeat {
    /// Create a heart-beat value.
    #[must_use]
    pub const fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    /// Parse a `heart-beat` header.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidHeartBeat` if the value is not two integers.
    pub fn parse(value: &str) -> Result<Self, CodecError> {
        let invalid = || CodecError::InvalidHeartBeat(value.to_string());
        let (cx, cy) = value.split_once(',').ok_or_else(invalid)?;
        let cx: u64 = cx.trim().parse().map_err(|_| invalid())?;
        let cy: u64 = cy.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(Duration::from_millis(cx), Duration::from_millis(cy)))
    }

    /// Render as a header value.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing.as_millis(), self.incoming.as_millis())
    }
}

/// Heart-beat intervals agreed for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeatSchedule {
    /// How often the client sends a beat; `None` disables sending.
    pub send_every: Option<Duration>,
    /// How often the server promises a beat; `None` disables checking.
    pub expect_every: Option<Duration>,
}

/// Negotiate intervals from the client's `CONNECT` and the server's `CONNECTED`.
///
/// A direction is disabled if either side sent 0 for it; otherwise the
/// interval is the larger of the two values.
#[must_use]
pub fn negotiate(client: HeartBeat, server: HeartBeat) -> HeartBeatSchedule {
    let pick = |ours: Duration, theirs: Duration| {
        (!ours.is_zero() && !theirs.is_zero()).then(|| ours.max(theirs))
    };

    HeartBeatSchedule {
        send_every: pick(client.outgoing, server.incoming),
        expect_every: pick(client.incoming, server.outgoing),
    }
}

// =============================================================================
// Frame
// =============================================================================

/// One STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names keep their first value on lookup.
    pub headers: Vec<(String, String)>,
    /// Frame body.
    pub body: String,
}

impl Frame {
    /// Create a frame without headers or body.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// `CONNECT` frame for a STOMP 1.2 session.
    #[must_use]
    pub fn connect(host: &str, heart_beat: HeartBeat, token: Option<&AccessToken>) -> Self {
        let frame = Self::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", heart_beat.header_value());

        match token {
            Some(token) => frame.header("Authorization", token.bearer_header()),
            None => frame,
        }
    }

    /// `SUBSCRIBE` frame.
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    /// `UNSUBSCRIBE` frame.
    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    /// `SEND` frame with a JSON body.
    #[must_use]
    pub fn send(destination: &str, body: &str) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    /// `DISCONNECT` frame requesting a receipt.
    #[must_use]
    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).header("receipt", receipt)
    }

    /// Encode to wire text, including the NUL terminator.
    ///
    /// Adds `content-length` for non-empty bodies unless already present.
    #[must_use]
    pub fn encode(&self) -> String {
        let raw = self.command.raw_headers();
        let mut out = String::with_capacity(64 + self.body.len());

        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if raw {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            } else {
                escape_into(&mut out, name);
                out.push(':');
                escape_into(&mut out, value);
            }
            out.push('\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode every frame in a WebSocket text message.
///
/// Heart-beat EOLs before, between, and after frames are skipped, so a
/// heart-beat-only message yields no frames.
///
/// # Errors
///
/// Returns `CodecError` if any frame is malformed.
pub fn decode(text: &str) -> Result<Vec<Frame>, CodecError> {
    let mut frames = Vec::new();
    let mut rest = text;

    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Ok(frames);
        }

        let (frame, remaining) = decode_one(rest)?;
        frames.push(frame);
        rest = remaining;
    }
}

fn decode_one(input: &str) -> Result<(Frame, &str), CodecError> {
    let (command_line, mut rest) = split_line(input).ok_or(CodecError::Incomplete)?;
    let command: Command = command_line.parse()?;
    let raw = command.raw_headers();

    let mut headers = Vec::new();
    loop {
        let (line, remaining) = split_line(rest).ok_or(CodecError::Incomplete)?;
        rest = remaining;
        if line.is_empty() {
            break;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.to_string()))?;
        if raw {
            headers.push((name.to_string(), value.to_string()));
        } else {
            headers.push((unescape(name)?, unescape(value)?));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| CodecError::InvalidContentLength(value.clone()))
        })
        .transpose()?;

    let (body, rest) = match content_length {
        Some(length) => {
            let body = rest.get(..length).ok_or(CodecError::Incomplete)?;
            let after = rest.get(length..).ok_or(CodecError::Incomplete)?;
            let after = after.strip_prefix(NUL).ok_or(CodecError::Incomplete)?;
            (body, after)
        }
        None => rest.split_once(NUL).ok_or(CodecError::Incomplete)?,
    };

    let frame = Frame {
        command,
        headers,
        body: body.to_string(),
    };
    Ok((frame, rest))
}

/// Split off one line, accepting `\n` or `\r\n`.
fn split_line(input: &str) -> Option<(&str, &str)> {
    let (line, rest) = input.split_once('\n')?;
    Some((line.strip_suffix('\r').unwrap_or(line), rest))
}

fn escape_into(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

fn unescape(value: &str) -> Result<String, CodecError> {
    if !value.contains('\\') {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('r') => out.push('\r'),
            _ => return Err(CodecError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}
