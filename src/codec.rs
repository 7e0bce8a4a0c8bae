//! Text grammar shared by every retrieval strategy.
//!
//! ```text
//! <unixMillisTimestamp>@<name1>=<value1>#<idx1>;<name2>=<value2>#<idx2>;...;
//! ```
//!
//! Network devices send one such record per datagram. Driver-backed devices
//! assemble the same record from their driver readings, so both strategies go
//! through [`decode`] before samples reach a signal's history.

use chrono::{DateTime, NaiveDateTime, TimeDelta};
use std::fmt::Write;

/// Offset applied to the sender's Unix timestamp to get local sample time.
pub const LOCAL_TIME_OFFSET_HOURS: i64 = 2;

const TIMESTAMP_SEPARATOR: char = '@';
const SEGMENT_SEPARATOR: char = ';';
const VALUE_SEPARATOR: char = '=';
const CHANNEL_SEPARATOR: char = '#';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Missing '@' between timestamp and channel section")]
    MissingSeparator,

    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("Timestamp {0} ms is out of range")]
    TimestampOutOfRange(i64),
}

/// One `name=value#channel` segment.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEntry {
    pub signal: String,
    pub value: f64,
    pub channel: usize,
}

/// A decoded retrieve record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetrieveFrame {
    pub timestamp_ms: i64,
    pub entries: Vec<FrameEntry>,
    /// Segments that could not be parsed and were dropped.
    pub malformed: usize,
}

impl RetrieveFrame {
    pub fn new(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            entries: Vec::new(),
            malformed: 0,
        }
    }

    pub fn push(&mut self, signal: impl Into<String>, value: f64, channel: usize) {
        self.entries.push(FrameEntry {
            signal: signal.into(),
            value,
            channel,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Local time of the samples in this record.
    pub fn sample_time(&self) -> Result<NaiveDateTime, DecodeError> {
        sample_time(self.timestamp_ms)
    }
}

/// Convert a sender timestamp into local sample time.
pub fn sample_time(timestamp_ms: i64) -> Result<NaiveDateTime, DecodeError> {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|utc| utc.naive_utc())
        .and_then(|utc| utc.checked_add_signed(TimeDelta::hours(LOCAL_TIME_OFFSET_HOURS)))
        .ok_or(DecodeError::TimestampOutOfRange(timestamp_ms))
}

/// Parse a retrieve record.
///
/// Structural problems (no `@`, unreadable timestamp) reject the whole record.
/// Individual segments that do not parse are skipped and counted in
/// [`RetrieveFrame::malformed`]. Empty segments, such as the one after the
/// trailing `;`, are ignored.
pub fn decode(datagram: &str) -> Result<RetrieveFrame, DecodeError> {
    let datagram = datagram.trim();
    let (timestamp, section) = datagram
        .split_once(TIMESTAMP_SEPARATOR)
        .ok_or(DecodeError::MissingSeparator)?;

    let timestamp_ms: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| DecodeError::InvalidTimestamp(timestamp.to_string()))?;

    let mut frame = RetrieveFrame::new(timestamp_ms);
    for segment in section.split(SEGMENT_SEPARATOR) {
        if segment.trim().is_empty() {
            continue;
        }
        match parse_segment(segment) {
            Some(entry) => frame.entries.push(entry),
            None => {
                log::debug!("Dropping malformed segment '{}'", segment);
                frame.malformed += 1;
            }
        }
    }

    Ok(frame)
}

fn parse_segment(segment: &str) -> Option<FrameEntry> {
    let (signal, rest) = segment.split_once(VALUE_SEPARATOR)?;
    let (value, channel) = rest.split_once(CHANNEL_SEPARATOR)?;

    let signal = signal.trim();
    if signal.is_empty() {
        return None;
    }

    Some(FrameEntry {
        signal: signal.to_string(),
        value: value.trim().parse().ok()?,
        channel: channel.trim().parse().ok()?,
    })
}

/// Render a record in wire form, every segment terminated by `;`.
pub fn encode(frame: &RetrieveFrame) -> String {
    let mut out = format!("{}{}", frame.timestamp_ms, TIMESTAMP_SEPARATOR);
    for entry in &frame.entries {
        let _ = write!(
            out,
            "{}{}{}{}{}{}",
            entry.signal,
            VALUE_SEPARATOR,
            entry.value,
            CHANNEL_SEPARATOR,
            entry.channel,
            SEGMENT_SEPARATOR
        );
    }
    out
}
