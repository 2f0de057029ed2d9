//! Text messages exchanged with network clients.
//!
//! Clients send fixed-position command lines:
//!
//! ```text
//! P,M,TT,F,U,X,L,S,A,V\r
//! ```
//!
//! and receive snapshot lines with the raw value of every field:
//!
//! ```text
//! power,mode,temp,fan,turbo,xfan,light,sleep,swingAuto,swingPos\r\n
//! ```

use std::{fmt, num::ParseIntError, str::FromStr};

use bytes::{Bytes, BytesMut, BufMut, Buf};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::state::GreeState;

/// Characters in a command line before the terminator.
pub const COMMAND_LENGTH: usize = 20;

/// Positions of the `,` delimiters in a command line.
const DELIMITERS: [usize; 9] = [1, 3, 6, 8, 10, 12, 14, 16, 18];

/// Longest line buffered while waiting for a terminator.
pub const MAX_LINE_LENGTH: usize = 256;


#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("command too short ({0} bytes)")]
    TooShort(usize),
    #[error("expected ',' at position {0}")]
    MisplacedDelimiter(usize),
    #[error("expected line terminator at position {COMMAND_LENGTH}")]
    MissingTerminator,
}

/// A parsed command line.
///
/// Values are kept as received; [Command::apply] hands them to the state
/// setters which do the range checks and coercions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command {
    pub power: bool,
    pub mode: u8,
    pub temperature: i32,
    pub fan_speed: i32,
    pub turbo: bool,
    pub xfan: bool,
    pub light: bool,
    pub sleep: bool,
    pub swing_auto: bool,
    pub swing_position: u8,
}

impl Command {
    /// Parse a command line. Any format error rejects the whole line.
    pub fn parse(line: &[u8]) -> Result<Self, CommandError> {
        if line.len() < COMMAND_LENGTH {
            return Err(CommandError::TooShort(line.len()));
        }

        if let Some(&position) = DELIMITERS.iter().find(|&&i| line[i] != b',') {
            return Err(CommandError::MisplacedDelimiter(position));
        }

        match line.get(COMMAND_LENGTH) {
            Some(b'\r' | b'\n') => (),
            _ => return Err(CommandError::MissingTerminator),
        }

        fn flag(c: u8) -> bool {
            c == b'1'
        }

        fn digit(c: u8) -> u8 {
            c.wrapping_sub(b'0')
        }

        Ok(Self {
            power: flag(line[0]),
            mode: digit(line[2]),
            temperature: parse_permissive(&line[4..6]),
            fan_speed: i32::from(line[7]) - i32::from(b'0'),
            turbo: flag(line[9]),
            xfan: flag(line[11]),
            light: flag(line[13]),
            sleep: flag(line[15]),
            swing_auto: flag(line[17]),
            swing_position: digit(line[19]),
        })
    }

    /// Apply to `state` field by field, in wire order.
    pub fn apply(&self, state: &mut GreeState) {
        state.set_power(self.power);
        state.set_mode(self.mode);
        state.set_temperature(self.temperature);
        state.set_fan_speed(self.fan_speed);
        state.set_turbo(self.turbo);
        state.set_xfan(self.xfan);
        state.set_light(self.light);
        state.set_sleep(self.sleep);
        state.set_vertical_swing(self.swing_auto, self.swing_position);
    }

    /// Serialise as a command line.
    ///
    /// Single character fields are written as their offset from `'0'`,
    /// so swing position 11 goes out as `;`.
    pub fn to_line(&self) -> String {
        fn flag(on: bool) -> char {
            if on { '1' } else { '0' }
        }

        fn digit(value: u8) -> char {
            char::from(b'0'.wrapping_add(value))
        }

        let fan = u8::try_from(self.fan_speed.clamp(0, 9)).unwrap_or_default();

        format!(
            "{},{},{:02},{},{},{},{},{},{},{}\n",
            flag(self.power),
            digit(self.mode),
            self.temperature.clamp(0, 99),
            digit(fan),
            flag(self.turbo),
            flag(self.xfan),
            flag(self.light),
            flag(self.sleep),
            flag(self.swing_auto),
            digit(self.swing_position),
        )
    }
}

impl From<&GreeState> for Command {
    fn from(state: &GreeState) -> Self {
        Self {
            power: state.power(),
            mode: state.mode(),
            temperature: state.temperature().into(),
            fan_speed: state.fan_speed().into(),
            turbo: state.turbo(),
            xfan: state.xfan(),
            light: state.light(),
            sleep: state.sleep(),
            swing_auto: state.vertical_swing_auto(),
            swing_position: state.vertical_swing_position(),
        }
    }
}

impl From<&StateReport> for Command {
    fn from(report: &StateReport) -> Self {
        Self {
            power: report.power,
            mode: report.mode,
            temperature: report.temperature.into(),
            fan_speed: report.fan_speed.into(),
            turbo: report.turbo,
            xfan: report.xfan,
            light: report.light,
            sleep: report.sleep,
            swing_auto: report.swing_auto,
            swing_position: report.swing_position,
        }
    }
}

/// Leading blanks, an optional sign, then digits up to the first non-digit.
/// No digits reads as 0.
fn parse_permissive(field: &[u8]) -> i32 {
    let mut rest = field;

    while let [b' ' | b'\t', tail @ ..] = rest {
        rest = tail;
    }

    let negative = match rest {
        [b'-', tail @ ..] => { rest = tail; true },
        [b'+', tail @ ..] => { rest = tail; false },
        _ => false,
    };

    let value = rest.iter()
        .take_while(|c| c.is_ascii_digit())
        .fold(0i32, |acc, c| acc.saturating_mul(10).saturating_add(i32::from(c - b'0')));

    if negative { -value } else { value }
}


/// The canonical text form of a state, as published to subscribers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot(Bytes);

impl Snapshot {
    pub fn of(state: &GreeState) -> Self {
        let line = format!(
            "{},{},{},{},{},{},{},{},{},{}\r\n",
            u8::from(state.power()),
            state.mode(),
            state.temperature(),
            state.fan_speed(),
            u8::from(state.turbo()),
            u8::from(state.xfan()),
            u8::from(state.light()),
            u8::from(state.sleep()),
            u8::from(state.vertical_swing_auto()),
            state.vertical_swing_position(),
        );

        Self(Bytes::from(line))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Nothing has been published yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}


#[derive(Error, Debug)]
pub enum ReportError {
    #[error("expected 10 fields, got {0}")]
    FieldCount(usize),
    #[error("field {index} is not a number")]
    InvalidField {
        index: usize,
        #[source]
        source: ParseIntError
    },
}

/// A snapshot line as read back by a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateReport {
    pub power: bool,
    pub mode: u8,
    pub temperature: u8,
    pub fan_speed: u8,
    pub turbo: bool,
    pub xfan: bool,
    pub light: bool,
    pub sleep: bool,
    pub swing_auto: bool,
    pub swing_position: u8,
}

impl FromStr for StateReport {
    type Err = ReportError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields = line.trim()
            .split(',')
            .enumerate()
            .map(|(index, field)| field.parse::<u8>().map_err(|source| ReportError::InvalidField { index, source }))
            .collect::<Result<Vec<_>, _>>()?;

        let [power, mode, temperature, fan_speed, turbo, xfan, light, sleep, swing_auto, swing_position] = fields[..] else {
            return Err(ReportError::FieldCount(fields.len()));
        };

        Ok(Self {
            power: power == 1,
            mode,
            temperature,
            fan_speed,
            turbo: turbo == 1,
            xfan: xfan == 1,
            light: light == 1,
            sleep: sleep == 1,
            swing_auto: swing_auto == 1,
            swing_position,
        })
    }
}


/// Splits a client byte stream into command lines and writes snapshots.
///
/// Each decoded line keeps its terminator (`\r` or `\n`), since the command
/// format checks for it.
#[derive(Default)]
pub struct LineCodec {
    /// Dropping an over-long line until its terminator shows up.
    discarding: bool
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;

    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let end = src.iter().position(|&b| b == b'\r' || b == b'\n');

            match end {
                Some(end) if self.discarding => {
                    src.advance(end + 1);
                    self.discarding = false;
                },
                Some(end) => {
                    return Ok(Some(src.split_to(end + 1).freeze()))
                },
                None => {
                    if src.len() > MAX_LINE_LENGTH {
                        tracing::debug!(len = src.len(), "discarding over-long line");
                        src.clear();
                        self.discarding = true;
                    }
                    return Ok(None)
                },
            }
        }
    }
}

impl Encoder<Snapshot> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, snapshot: Snapshot, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(snapshot.as_bytes().len());
        dst.put(snapshot.as_bytes());
        Ok(())
    }
}
