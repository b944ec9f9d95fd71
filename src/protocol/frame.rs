//! STOMP 1.2 frame codec.
//!
//! Frames travel as WebSocket text messages. A single message may carry
//! several NUL-terminated frames, and bare EOLs between frames are
//! heart-beats.
//!
//! # Format
//!
//! ```text
//! COMMAND
//! header1:value1
//! header2:value2
//!
//! body^@
//! ```
//!
//! Header names and values are escaped (`\\`, `\n`, `\r`, `\c`) in every
//! frame except `CONNECT` and `CONNECTED`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Frame terminator.
const NUL: char = '\0';

/// Protocol versions offered in CONNECT.
const ACCEPT_VERSION: &str = "1.2,1.1";

// ============================================================================
// Command
// ============================================================================

/// Frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client handshake.
    Connect,
    /// Client handshake (STOMP 1.2 alias).
    Stomp,
    /// Server handshake acknowledgement.
    Connected,
    /// Client publish.
    Send,
    /// Client subscribe.
    Subscribe,
    /// Client unsubscribe.
    Unsubscribe,
    /// Client teardown.
    Disconnect,
    /// Server push for a subscription.
    Message,
    /// Server acknowledgement of a `receipt` header.
    Receipt,
    /// Server error; the server closes the connection after sending it.
    Error,
}

impl Command {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Parses a wire name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for unknown commands.
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(Error::protocol(format!("Unknown command: {other:?}"))),
        })
    }

    /// Handshake frames carry headers verbatim.
    #[inline]
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names keep the first value.
    pub headers: Vec<(String, String)>,
    /// Frame body.
    pub body: String,
}

// ============================================================================
// Frame - Constructors
// ============================================================================

impl Frame {
    /// Creates an empty frame.
    #[inline]
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[inline]
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the CONNECT handshake frame.
    ///
    /// `heart_beat` is `(outgoing_ms, incoming_ms)` from the client's view.
    #[must_use]
    pub fn connect(host: &str, heart_beat: (u64, u64)) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", format!("{},{}", heart_beat.0, heart_beat.1))
    }

    /// Builds a SUBSCRIBE frame.
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    /// Builds an UNSUBSCRIBE frame.
    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header("id", id)
    }

    /// Builds a SEND frame with a JSON body.
    #[must_use]
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        let body = body.into();
        Self::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_header("content-length", body.len().to_string())
            .with_body(body)
    }

    /// Builds a DISCONNECT frame requesting a receipt.
    #[must_use]
    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).with_header("receipt", receipt)
    }
}

// ============================================================================
// Frame - Accessors
// ============================================================================

impl Frame {
    /// Returns the first value of a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the `destination` header.
    #[inline]
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.header("destination")
    }

    /// Parses the `heart-beat` header as `(cx, cy)` milliseconds.
    #[must_use]
    pub fn heart_beat(&self) -> Option<(u64, u64)> {
        let (x, y) = self.header("heart-beat")?.split_once(',')?;
        Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
    }

    /// Human readable description of an ERROR frame.
    #[must_use]
    pub fn error_message(&self) -> String {
        match (self.header("message"), self.body.trim()) {
            (Some(message), "") => message.to_string(),
            (Some(message), body) => format!("{message}: {body}"),
            (None, "") => "broker sent ERROR without details".to_string(),
            (None, body) => body.to_string(),
        }
    }
}

// ============================================================================
// Frame - Encoding
// ============================================================================

impl Frame {
    /// Encodes the frame including the NUL terminator.
    #[must_use]
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(32 + self.body.len() + self.headers.len() * 24);

        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if escape {
                escape_into(&mut out, name);
                out.push(':');
                escape_into(&mut out, value);
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }
}

// ============================================================================
// Frame - Decoding
// ============================================================================

impl Frame {
    /// Parses every frame in a WebSocket text message.
    ///
    /// Heart-beat EOLs are skipped, so a pure heart-beat yields an empty vec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if any frame is malformed.
    pub fn parse_all(input: &str) -> Result<Vec<Self>> {
        let mut frames = Vec::new();
        let mut rest = input;

        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                break;
            }

            let (frame, consumed) = Self::parse_one(rest)?;
            frames.push(frame);
            rest = &rest[consumed..];
        }

        Ok(frames)
    }

    /// Parses one frame from the start of `input`.
    ///
    /// Returns the frame and the number of bytes consumed.
    fn parse_one(input: &str) -> Result<(Self, usize)> {
        let mut pos = 0;

        let command_line = next_line(input, &mut pos)
            .ok_or_else(|| Error::protocol("Frame has no command line"))?;
        let command = Command::parse(command_line)?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let line = next_line(input, &mut pos)
                .ok_or_else(|| Error::protocol("Unterminated header block"))?;
            if line.is_empty() {
                break;
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::protocol(format!("Malformed header: {line:?}")))?;

            if escape {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let body_start = pos;
        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .parse::<usize>()
                    .map_err(|_| Error::protocol(format!("Invalid content-length: {value:?}")))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                let end = body_start
                    .checked_add(len)
                    .ok_or_else(|| Error::protocol("Invalid content-length"))?;
                if input.as_bytes().get(end) != Some(&0) {
                    return Err(Error::protocol("Body does not match content-length"));
                }
                end
            }
            None => {
                let offset = input[body_start..]
                    .find(NUL)
                    .ok_or_else(|| Error::protocol("Missing NUL terminator"))?;
                body_start + offset
            }
        };

        let body = input
            .get(body_start..body_end)
            .ok_or_else(|| Error::protocol("Body is not valid UTF-8"))?
            .to_string();

        Ok((
            Self {
                command,
                headers,
                body,
            },
            body_end + 1,
        ))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Reads one EOL-terminated line, accepting `\r\n`.
fn next_line<'a>(input: &'a str, pos: &mut usize) -> Option<&'a str> {
    let rest = &input[*pos..];
    let idx = rest.find('\n')?;
    let line = &rest[..idx];
    *pos += idx + 1;
    Some(line.strip_suffix('\r').unwrap_or(line))
}

fn escape_into(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(Error::protocol(format!(
                    "Undefined header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }

    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
