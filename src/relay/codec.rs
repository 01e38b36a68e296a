//! KC868 relay controller text protocol.
//!
//! Inbound frames are ASCII, terminated by a single NUL byte, with fields
//! separated by `-`:
//!
//! ```text
//! RELAY-SCAN_DEVICE-CHANNEL_32,OK
//! RELAY-READ-1,3,1,OK
//! RELAY-SET-1,3,0,OK
//! HOST-<a>-<b>-SCAN_DEVICE-CHANNEL_32,OK
//! HOST-<a>-<b>-<cmd>-1,3,1,OK
//! ```
//!
//! `HOST` frames carry one extra leading field and are kept distinct from
//! `RELAY` frames through [`Origin`]; only their field layout is known.
//!
//! Outbound commands are written as raw ASCII without a terminator.

use std::fmt;
use thiserror::Error;

/// Byte that terminates every inbound frame.
pub const FRAME_TERMINATOR: u8 = 0;

const FIELD_SEPARATOR: char = '-';
const PAYLOAD_SEPARATOR: char = ',';

/// Minimum number of `-` fields in a `HOST` frame.
const HOST_MIN_FIELDS: usize = 5;

/// Reasons a frame is rejected. Rejected frames are logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("frame is not valid UTF-8")]
    NotUtf8,

    #[error("expected at least {expected} fields, got {actual} in {frame:?}")]
    TooFewFields {
        expected: usize,
        actual: usize,
        frame: String,
    },

    #[error("unknown frame prefix {0:?}")]
    UnknownPrefix(String),

    #[error("unknown relay command {0:?}")]
    UnknownCommand(String),

    #[error("payload {payload:?} has no {what}")]
    MissingPayloadField { what: &'static str, payload: String },

    #[error("invalid relay count {0:?}")]
    InvalidRelayCount(String),

    #[error("invalid relay state {0:?}, expected \"0\" or \"1\"")]
    InvalidState(String),
}

/// Which frame family a report was carried in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Relay,
    Host,
}

/// Decoded content of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Reply to `RELAY-SCAN_DEVICE-NOW`.
    Scan { relay_count: u32 },
    /// Current state of one relay, from a READ or SET reply.
    State { switch_id: String, on: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub origin: Origin,
    pub report: Report,
}

/// Decode one frame. A trailing terminator and surrounding whitespace are ignored.
pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
    let text = std::str::from_utf8(raw).map_err(|_| FrameError::NotUtf8)?;
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Err(FrameError::Empty);
    }

    let fields = Fields::split(text);
    fields.require(2)?;

    match fields.get(0) {
        Some("RELAY") => decode_relay(&fields),
        Some("HOST") => decode_host(&fields),
        Some(other) => Err(FrameError::UnknownPrefix(other.to_string())),
        None => Err(FrameError::Empty),
    }
}

fn decode_relay(fields: &Fields<'_>) -> Result<Frame, FrameError> {
    let command = fields.field(1)?;
    let report = match command {
        "SCAN_DEVICE" => scan_report(fields.field(2)?)?,
        "READ" | "SET" => state_report(fields.field(2)?)?,
        other => return Err(FrameError::UnknownCommand(other.to_string())),
    };
    Ok(Frame {
        origin: Origin::Relay,
        report,
    })
}

fn decode_host(fields: &Fields<'_>) -> Result<Frame, FrameError> {
    fields.require(HOST_MIN_FIELDS)?;
    let payload = fields.field(4)?;
    let report = if fields.field(3)? == "SCAN_DEVICE" {
        scan_report(payload)?
    } else {
        state_report(payload)?
    };
    Ok(Frame {
        origin: Origin::Host,
        report,
    })
}

/// `CHANNEL_32,OK` -> 32. The count is the second `_` segment.
fn scan_report(payload: &str) -> Result<Report, FrameError> {
    let device = payload
        .split('_')
        .nth(1)
        .ok_or_else(|| FrameError::MissingPayloadField {
            what: "relay count",
            payload: payload.to_string(),
        })?;
    let count = device.split(PAYLOAD_SEPARATOR).next().unwrap_or_default();
    let relay_count = count
        .trim()
        .parse()
        .map_err(|_| FrameError::InvalidRelayCount(count.to_string()))?;
    Ok(Report::Scan { relay_count })
}

/// `1,3,1,OK` -> relay 3 on
fn state_report(payload: &str) -> Result<Report, FrameError> {
    let mut parts = payload.split(PAYLOAD_SEPARATOR).skip(1);
    let missing = |what| FrameError::MissingPayloadField {
        what,
        payload: payload.to_string(),
    };

    let switch_id = parts
        .next()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing("switch id"))?;
    let on = match parts.next().map(str::trim) {
        Some("1") => true,
        Some("0") => false,
        Some(other) => return Err(FrameError::InvalidState(other.to_string())),
        None => return Err(missing("state")),
    };

    Ok(Report::State {
        switch_id: switch_id.to_string(),
        on,
    })
}

/// `-` separated view of a frame with bounds-checked access.
struct Fields<'a> {
    frame: &'a str,
    parts: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn split(frame: &'a str) -> Self {
        Self {
            frame,
            parts: frame.split(FIELD_SEPARATOR).collect(),
        }
    }

    fn get(&self, index: usize) -> Option<&'a str> {
        self.parts.get(index).copied()
    }

    fn require(&self, expected: usize) -> Result<(), FrameError> {
        if self.parts.len() < expected {
            return Err(FrameError::TooFewFields {
                expected,
                actual: self.parts.len(),
                frame: self.frame.to_string(),
            });
        }
        Ok(())
    }

    fn field(&self, index: usize) -> Result<&'a str, FrameError> {
        self.require(index + 1)?;
        Ok(self.parts[index])
    }
}

/// Commands sent to the relay controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch one relay on or off.
    Set { switch_id: String, on: bool },
    /// Ask for the state of one relay.
    Read { relay: u32 },
    /// Wake the controller before a scan.
    Test,
    /// Ask the controller how many relays it has.
    ScanDevice,
    /// Keep-alive.
    Ping,
}

impl Command {
    pub fn set(switch_id: impl Into<String>, on: bool) -> Self {
        Command::Set {
            switch_id: switch_id.into(),
            on,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Set { switch_id, on } => {
                write!(f, "RELAY-SET-1,{},{}", switch_id, if *on { '1' } else { '0' })
            }
            Command::Read { relay } => write!(f, "RELAY-READ-1,{}", relay),
            // The trailing space is what the controller firmware expects.
            Command::Test => f.write_str("RELAY-TEST-NOW "),
            Command::ScanDevice => f.write_str("RELAY-SCAN_DEVICE-NOW"),
            Command::Ping => f.write_str("ping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(switch_id: &str, on: bool) -> Report {
        Report::State {
            switch_id: switch_id.to_string(),
            on,
        }
    }

    #[test]
    fn test_decode_read_and_set() {
        let frame = decode(b"RELAY-READ-1,3,1,OK\0").unwrap();
        assert_eq!(frame.origin, Origin::Relay);
        assert_eq!(frame.report, state("3", true));

        let frame = decode(b"RELAY-SET-1,12,0,OK\0").unwrap();
        assert_eq!(frame.report, state("12", false));

        // Without the trailing status field
        let frame = decode(b"RELAY-READ-1,7,1").unwrap();
        assert_eq!(frame.report, state("7", true));
    }

    #[test]
    fn test_decode_relay_scan() {
        let frame = decode(b"RELAY-SCAN_DEVICE-CHANNEL_32,OK\0").unwrap();
        assert_eq!(frame.report, Report::Scan { relay_count: 32 });
    }

    #[test]
    fn test_decode_host_frames() {
        let frame = decode(b"HOST-RELAY-1-SCAN_DEVICE-CHANNEL_4,OK\0").unwrap();
        assert_eq!(frame.origin, Origin::Host);
        assert_eq!(frame.report, Report::Scan { relay_count: 4 });

        let frame = decode(b"HOST-RELAY-1-READ-1,2,1,OK\0").unwrap();
        assert_eq!(frame.origin, Origin::Host);
        assert_eq!(frame.report, state("2", true));
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert_eq!(decode(b"\0"), Err(FrameError::Empty));
        assert_eq!(
            decode(b"GARBAGE-READ-1,1,1"),
            Err(FrameError::UnknownPrefix("GARBAGE".to_string()))
        );
        assert!(matches!(
            decode(b"RELAY"),
            Err(FrameError::TooFewFields { expected: 2, .. })
        ));
        assert!(matches!(
            decode(b"HOST-RELAY-1-READ"),
            Err(FrameError::TooFewFields { expected: 5, .. })
        ));
        assert_eq!(
            decode(b"RELAY-TEST-OK"),
            Err(FrameError::UnknownCommand("TEST".to_string()))
        );
        assert!(matches!(
            decode(b"RELAY-READ"),
            Err(FrameError::TooFewFields { expected: 3, .. })
        ));
        assert!(matches!(
            decode(b"RELAY-READ-1"),
            Err(FrameError::MissingPayloadField { what: "switch id", .. })
        ));
        assert!(matches!(
            decode(b"RELAY-SET-1,4"),
            Err(FrameError::MissingPayloadField { what: "state", .. })
        ));
        assert_eq!(
            decode(b"RELAY-READ-1,4,ON"),
            Err(FrameError::InvalidState("ON".to_string()))
        );
        assert_eq!(decode(&[0xff, 0xfe, 0x00]), Err(FrameError::NotUtf8));
    }

    #[test]
    fn test_relay_count_is_second_underscore_segment() {
        let frame = decode(b"RELAY-SCAN_DEVICE-CHANNEL_8_EXT,OK\0").unwrap();
        assert_eq!(frame.report, Report::Scan { relay_count: 8 });
    }

    #[test]
    fn test_decode_rejects_bad_relay_count() {
        assert!(matches!(
            decode(b"RELAY-SCAN_DEVICE-CHANNEL"),
            Err(FrameError::MissingPayloadField { what: "relay count", .. })
        ));
        assert_eq!(
            decode(b"RELAY-SCAN_DEVICE-CHANNEL_x,OK"),
            Err(FrameError::InvalidRelayCount("x".to_string()))
        );
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::set("3", true).encode(), b"RELAY-SET-1,3,1");
        assert_eq!(Command::set("5", false).encode(), b"RELAY-SET-1,5,0");
        assert_eq!(Command::Read { relay: 2 }.encode(), b"RELAY-READ-1,2");
        assert_eq!(Command::Test.encode(), b"RELAY-TEST-NOW ");
        assert_eq!(Command::ScanDevice.encode(), b"RELAY-SCAN_DEVICE-NOW");
        assert_eq!(Command::Ping.encode(), b"ping");
    }
}
