//! Device-agnostic ("standard") air conditioner vocabulary.
//!
//! Lets clients speak in generic modes, fan speeds and swing positions
//! without knowing the native Gree codes.

use packed_struct::PrimitiveEnum;
use strum_macros::{Display, EnumIter, EnumString};

use super::message::StateReport;
use super::state::{GreeState, Mode, VerticalSwing, ManualPosition, AutoPosition, FAN_AUTO, FAN_MIN, FAN_MAX};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum OperationMode {
    Auto,
    Cool,
    Heat,
    Dry,
    Fan
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum FanSpeed {
    Auto,
    Min,
    Low,
    Medium,
    High,
    Max
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum SwingV {
    Auto,
    Highest,
    High,
    Middle,
    Low,
    Lowest
}

impl From<OperationMode> for Mode {
    fn from(value: OperationMode) -> Self {
        match value {
            OperationMode::Auto => Self::Auto,
            OperationMode::Cool => Self::Cool,
            OperationMode::Heat => Self::Heat,
            OperationMode::Dry => Self::Dry,
            OperationMode::Fan => Self::Fan,
        }
    }
}

impl From<Mode> for OperationMode {
    fn from(value: Mode) -> Self {
        match value {
            Mode::Auto => Self::Auto,
            Mode::Cool => Self::Cool,
            Mode::Dry => Self::Dry,
            Mode::Fan => Self::Fan,
            Mode::Heat => Self::Heat,
        }
    }
}

impl OperationMode {
    /// Standard mode for a native mode code; unknown codes are Auto.
    pub fn from_native(mode: u8) -> Self {
        Mode::from_primitive(mode).map(Self::from).unwrap_or(Self::Auto)
    }
}

impl FanSpeed {
    /// Native fan speed.
    ///
    /// The unit only has three fixed speeds, so Low and Medium both map to
    /// the second highest one.
    pub fn native(self) -> u8 {
        match self {
            FanSpeed::Auto => FAN_AUTO,
            FanSpeed::Min => FAN_MIN,
            FanSpeed::Low | FanSpeed::Medium => FAN_MAX - 1,
            FanSpeed::High | FanSpeed::Max => FAN_MAX,
        }
    }

    pub fn from_native(speed: u8) -> Self {
        match speed {
            FAN_MAX => FanSpeed::Max,
            s if s == FAN_MAX - 1 => FanSpeed::Medium,
            FAN_MIN => FanSpeed::Min,
            _ => FanSpeed::Auto,
        }
    }
}

impl From<SwingV> for VerticalSwing {
    fn from(value: SwingV) -> Self {
        match value {
            SwingV::Highest => Self::Manual(ManualPosition::Top),
            SwingV::High => Self::Manual(ManualPosition::UpperMiddle),
            SwingV::Middle => Self::Manual(ManualPosition::Middle),
            SwingV::Low => Self::Manual(ManualPosition::LowerMiddle),
            SwingV::Lowest => Self::Manual(ManualPosition::Bottom),
            SwingV::Auto => Self::Automatic(AutoPosition::Auto),
        }
    }
}

impl From<VerticalSwing> for SwingV {
    fn from(value: VerticalSwing) -> Self {
        match value {
            VerticalSwing::Manual(ManualPosition::Top) => Self::Highest,
            VerticalSwing::Manual(ManualPosition::UpperMiddle) => Self::High,
            VerticalSwing::Manual(ManualPosition::Middle) => Self::Middle,
            VerticalSwing::Manual(ManualPosition::LowerMiddle) => Self::Low,
            VerticalSwing::Manual(ManualPosition::Bottom) => Self::Lowest,
            VerticalSwing::Manual(ManualPosition::LastPosition) | VerticalSwing::Automatic(_) => Self::Auto,
        }
    }
}


/// Complete unit state in standard terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StdState {
    pub power: bool,
    pub mode: OperationMode,
    pub celsius: i32,
    pub fan: FanSpeed,
    pub swing_v: SwingV,
    pub turbo: bool,
    pub light: bool,

    /// Keep the fan running after cooling to dry the coil (native "XFan").
    pub clean: bool,

    pub sleep: bool,
}

impl Default for StdState {
    fn default() -> Self {
        GreeState::default().to_std()
    }
}

impl GreeState {
    pub fn to_std(&self) -> StdState {
        StdState {
            power: self.power(),
            mode: OperationMode::from_native(self.mode()),
            celsius: self.temperature().into(),
            fan: FanSpeed::from_native(self.fan_speed()),
            swing_v: self.vertical_swing().into(),
            turbo: self.turbo(),
            light: self.light(),
            clean: self.xfan(),
            sleep: self.sleep(),
        }
    }

    /// Apply every field of `std` through the native setters, so the usual
    /// Auto/Dry coercions apply.
    pub fn apply_std(&mut self, std: &StdState) {
        self.set_power(std.power);
        self.set_mode(Mode::from(std.mode) as u8);
        self.set_temperature(std.celsius);
        self.set_fan_speed(std.fan.native().into());
        self.set_swing(std.swing_v.into());
        self.set_turbo(std.turbo);
        self.set_light(std.light);
        self.set_xfan(std.clean);
        self.set_sleep(std.sleep);
    }

    pub fn from_std(std: &StdState) -> Self {
        let mut state = Self::default();
        state.apply_std(std);
        state
    }
}

impl From<&StateReport> for StdState {
    fn from(report: &StateReport) -> Self {
        StdState {
            power: report.power,
            mode: OperationMode::from_native(report.mode),
            celsius: report.temperature.into(),
            fan: FanSpeed::from_native(report.fan_speed),
            swing_v: VerticalSwing::new(report.swing_auto, report.swing_position).into(),
            turbo: report.turbo,
            light: report.light,
            clean: report.xfan,
            sleep: report.sleep,
        }
    }
}
