//! Gree device state frame.
//!
//! Every Gree style remote sends the complete controllable state of the
//! unit as one 8 byte blob. All reads and writes go through [GreeState] so
//! that the cross-field rules (power mirror bit, Auto locked to 25C, Dry
//! locked to fan 1, swing position enumerations) hold after every mutation.

use std::fmt;

use packed_struct::prelude::*;
use strum_macros::Display;

/// Size of the state frame in bytes.
pub const STATE_LENGTH: usize = 8;

pub const MIN_TEMP: u8 = 16;
pub const MAX_TEMP: u8 = 30;

/// Auto mode is locked to this setpoint.
pub const AUTO_TEMP: u8 = 25;

pub const FAN_AUTO: u8 = 0;
pub const FAN_MIN: u8 = 1;
pub const FAN_MAX: u8 = 3;

// byte 0
const MODE_MASK: u8 = 0b0000_0111;
const POWER1_MASK: u8 = 0b0000_1000;
const FAN_MASK: u8 = 0b0011_0000;
const FAN_SHIFT: u32 = 4;
const SWING_AUTO_MASK: u8 = 0b0100_0000;
const SLEEP_MASK: u8 = 0b1000_0000;

// byte 1
const TEMP_MASK: u8 = 0b0000_1111;

// byte 2
const TURBO_MASK: u8 = 0b0001_0000;
const LIGHT_MASK: u8 = 0b0010_0000;
const POWER2_MASK: u8 = 0b0100_0000;
const XFAN_MASK: u8 = 0b1000_0000;

// byte 4
const SWING_POS_MASK: u8 = 0b0000_1111;

/// Power off, fan auto, mode auto, 25C, toggles off.
/// Bytes 3, 5 and 7 carry the protocol padding.
const DEFAULT_STATE: [u8; STATE_LENGTH] = [0x00, 0x09, 0x00, 0x50, 0x00, 0x20, 0x00, 0x50];

const BLOCK_CHECKSUM_START: u8 = 10;


#[derive(PrimitiveEnum_u8, Display, Clone, Copy, Debug, PartialEq, Eq)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Mode {
    Auto = 0,
    Cool = 1,
    Dry = 2,
    Fan = 3,
    Heat = 4
}

/// Vertical swing positions valid while the swing auto bit is clear.
#[derive(PrimitiveEnum_u8, Display, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManualPosition {
    /// Keep whatever position the vane was left in.
    #[strum(serialize = "Last Pos")]
    LastPosition = 0,
    Top = 2,
    #[strum(serialize = "Upper Middle")]
    UpperMiddle = 3,
    Middle = 4,
    #[strum(serialize = "Lower Middle")]
    LowerMiddle = 5,
    Bottom = 6
}

/// Vertical swing positions valid while the swing auto bit is set.
#[derive(PrimitiveEnum_u8, Display, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoPosition {
    Auto = 1,
    #[strum(serialize = "Auto From Bottom")]
    FromBottom = 7,
    #[strum(serialize = "Auto From Middle")]
    FromMiddle = 9,
    #[strum(serialize = "Auto From Top")]
    FromTop = 11
}

/// Vertical swing setting.
///
/// The frame stores the auto bit and the position nibble separately; this
/// keeps the position tied to the enumeration its bit selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerticalSwing {
    Manual(ManualPosition),
    Automatic(AutoPosition)
}

impl VerticalSwing {
    /// Interpret `position` in the enumeration selected by `automatic`.
    ///
    /// Positions outside that enumeration become [ManualPosition::LastPosition]
    /// or [AutoPosition::Auto] respectively.
    pub fn new(automatic: bool, position: u8) -> Self {
        if automatic {
            Self::Automatic(AutoPosition::from_primitive(position).unwrap_or(AutoPosition::Auto))
        } else {
            Self::Manual(ManualPosition::from_primitive(position).unwrap_or(ManualPosition::LastPosition))
        }
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self, Self::Automatic(_))
    }

    /// Native position code.
    pub fn position(&self) -> u8 {
        match self {
            Self::Manual(position) => position.to_primitive(),
            Self::Automatic(position) => position.to_primitive(),
        }
    }
}

impl Default for VerticalSwing {
    fn default() -> Self {
        Self::Automatic(AutoPosition::Auto)
    }
}


/// Gree/Kelvinator block checksum of `state`.
///
/// Sums the low nibbles of the first four bytes and the high nibbles of the
/// remaining bytes, excluding the last byte which holds the checksum.
pub fn block_checksum(state: &[u8]) -> u8 {
    let covered = state.len().saturating_sub(1);

    let sum = state[..covered].iter()
        .enumerate()
        .fold(BLOCK_CHECKSUM_START, |sum, (i, byte)| {
            let nibble = if i < 4 { byte & 0x0f } else { byte >> 4 };
            sum.wrapping_add(nibble)
        });

    sum & 0x0f
}

/// Write the checksum of `state` into the top nibble of its last byte.
/// The low nibble is left untouched.
pub fn write_checksum(state: &mut [u8]) {
    let sum = block_checksum(state);

    if let Some(last) = state.last_mut() {
        *last = (sum << 4) | (*last & 0x0f);
    }
}

/// Does the top nibble of the last byte match the checksum of `state`?
pub fn valid_checksum(state: &[u8]) -> bool {
    match state.last() {
        Some(last) => last >> 4 == block_checksum(state),
        None => false,
    }
}


/// One complete state of the air conditioner.
#[derive(Clone, PartialEq, Eq)]
pub struct GreeState {
    raw: [u8; STATE_LENGTH]
}

impl Default for GreeState {
    fn default() -> Self {
        Self {
            raw: DEFAULT_STATE
        }
    }
}

impl GreeState {
    /// Take captured bytes verbatim. Nothing is coerced and the checksum is
    /// not repaired; see [GreeState::has_valid_checksum].
    pub fn from_raw(raw: [u8; STATE_LENGTH]) -> Self {
        Self { raw }
    }

    /// Frame bytes ready to transmit (checksum recomputed).
    pub fn raw(&mut self) -> [u8; STATE_LENGTH] {
        self.fixup();
        self.raw
    }

    /// Frame bytes as currently stored.
    pub fn as_bytes(&self) -> &[u8; STATE_LENGTH] {
        &self.raw
    }

    /// Recompute the checksum. Must run before every transmission.
    pub fn fixup(&mut self) {
        write_checksum(&mut self.raw);
    }

    pub fn has_valid_checksum(&self) -> bool {
        valid_checksum(&self.raw)
    }

    pub fn set_power(&mut self, on: bool) {
        self.set_bit(0, POWER1_MASK, on);
        self.set_bit(2, POWER2_MASK, on);
    }

    pub fn power(&self) -> bool {
        self.raw[0] & POWER1_MASK != 0
    }

    /// Set the temperature in degrees C, clamped to 16..=30.
    ///
    /// While the mode is Auto the setpoint is forced to 25 regardless of `celsius`.
    pub fn set_temperature(&mut self, celsius: i32) {
        let mut celsius = celsius.clamp(MIN_TEMP.into(), MAX_TEMP.into()) as u8;

        if self.mode() == Mode::Auto as u8 {
            celsius = AUTO_TEMP;
        }

        self.raw[1] = (self.raw[1] & !TEMP_MASK) | (celsius - MIN_TEMP);
    }

    /// Temperature in degrees C.
    pub fn temperature(&self) -> u8 {
        (self.raw[1] & TEMP_MASK) + MIN_TEMP
    }

    /// Set the fan speed, 0 is auto and 1-3 the fixed speeds.
    ///
    /// Dry mode is always locked to speed 1.
    pub fn set_fan_speed(&mut self, speed: i32) {
        let mut speed = speed.clamp(FAN_AUTO.into(), FAN_MAX.into()) as u8;

        if self.mode() == Mode::Dry as u8 {
            speed = FAN_MIN;
        }

        self.raw[0] = (self.raw[0] & !FAN_MASK) | (speed << FAN_SHIFT);
    }

    pub fn fan_speed(&self) -> u8 {
        (self.raw[0] & FAN_MASK) >> FAN_SHIFT
    }

    /// Set the native mode code. Unknown codes select Auto.
    ///
    /// Selecting Auto forces the temperature to 25, selecting Dry forces the fan to 1.
    pub fn set_mode(&mut self, mode: u8) {
        let mode = match Mode::from_primitive(mode) {
            Some(Mode::Auto) | None => {
                self.set_temperature(AUTO_TEMP.into());
                Mode::Auto
            },
            Some(Mode::Dry) => {
                self.set_fan_speed(FAN_MIN.into());
                Mode::Dry
            },
            Some(mode) => mode,
        };

        self.raw[0] = (self.raw[0] & !MODE_MASK) | mode.to_primitive();
    }

    /// Native mode code as stored. Frames built with [GreeState::from_raw]
    /// may hold codes outside [Mode].
    pub fn mode(&self) -> u8 {
        self.raw[0] & MODE_MASK
    }

    pub fn known_mode(&self) -> Option<Mode> {
        Mode::from_primitive(self.mode())
    }

    pub fn set_light(&mut self, on: bool) {
        self.set_bit(2, LIGHT_MASK, on);
    }

    pub fn light(&self) -> bool {
        self.raw[2] & LIGHT_MASK != 0
    }

    pub fn set_xfan(&mut self, on: bool) {
        self.set_bit(2, XFAN_MASK, on);
    }

    pub fn xfan(&self) -> bool {
        self.raw[2] & XFAN_MASK != 0
    }

    pub fn set_sleep(&mut self, on: bool) {
        self.set_bit(0, SLEEP_MASK, on);
    }

    pub fn sleep(&self) -> bool {
        self.raw[0] & SLEEP_MASK != 0
    }

    pub fn set_turbo(&mut self, on: bool) {
        self.set_bit(2, TURBO_MASK, on);
    }

    pub fn turbo(&self) -> bool {
        self.raw[2] & TURBO_MASK != 0
    }

    /// Write the swing auto bit, then `position` coerced per [VerticalSwing::new].
    pub fn set_vertical_swing(&mut self, automatic: bool, position: u8) {
        self.set_swing(VerticalSwing::new(automatic, position));
    }

    pub fn set_swing(&mut self, swing: VerticalSwing) {
        self.set_bit(0, SWING_AUTO_MASK, swing.is_automatic());
        self.raw[4] = (self.raw[4] & !SWING_POS_MASK) | swing.position();
    }

    pub fn vertical_swing_auto(&self) -> bool {
        self.raw[0] & SWING_AUTO_MASK != 0
    }

    /// Native swing position code as stored.
    pub fn vertical_swing_position(&self) -> u8 {
        self.raw[4] & SWING_POS_MASK
    }

    /// Swing setting, with the stored position coerced into the enumeration
    /// the auto bit selects.
    pub fn vertical_swing(&self) -> VerticalSwing {
        VerticalSwing::new(self.vertical_swing_auto(), self.vertical_swing_position())
    }

    fn set_bit(&mut self, byte: usize, mask: u8, on: bool) {
        if on {
            self.raw[byte] |= mask;
        } else {
            self.raw[byte] &= !mask;
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "On" } else { "Off" }
}

fn position_name(position: u8) -> Option<String> {
    ManualPosition::from_primitive(position).map(|p| p.to_string())
        .or_else(|| AutoPosition::from_primitive(position).map(|p| p.to_string()))
}

/// Human readable summary of every field.
impl fmt::Display for GreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = self.mode();
        match self.known_mode() {
            Some(known) => write!(f, "Power: {}, Mode: {mode} ({known})", on_off(self.power()))?,
            None => write!(f, "Power: {}, Mode: {mode} (UNKNOWN)", on_off(self.power()))?,
        }

        write!(f, ", Temp: {}C", self.temperature())?;

        let fan = self.fan_speed();
        match fan {
            FAN_AUTO => write!(f, ", Fan: {fan} (AUTO)")?,
            FAN_MAX => write!(f, ", Fan: {fan} (MAX)")?,
            _ => write!(f, ", Fan: {fan}")?,
        }

        write!(f, ", Turbo: {}, XFan: {}, Light: {}, Sleep: {}",
            on_off(self.turbo()), on_off(self.xfan()), on_off(self.light()), on_off(self.sleep()))?;

        let swing_mode = if self.vertical_swing_auto() { "Auto" } else { "Manual" };
        let position = self.vertical_swing_position();
        write!(f, ", Swing Vertical Mode: {swing_mode}, Swing Vertical Pos: {position}")?;

        match position_name(position) {
            Some(name) => write!(f, " ({name})"),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for GreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GreeState({:02x?})", self.raw)
    }
}
