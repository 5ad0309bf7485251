// src/gcode.rs - Command templates for manual printer control
use std::fmt;
use std::str::FromStr;

use crate::config::PrinterProfile;
use crate::error::{ConnectorError, Result};

pub const EMERGENCY_STOP: &str = "M112";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub fn letter(self) -> char {
        match self {
            Self::X => 'X',
            Self::Y => 'Y',
            Self::Z => 'Z',
            Self::E => 'E',
        }
    }

    /// Maximum feed rate configured for this axis.
    pub fn speed(self, profile: &PrinterProfile) -> f64 {
        match self {
            Self::X => profile.axes.x,
            Self::Y => profile.axes.y,
            Self::Z => profile.axes.z,
            Self::E => profile.axes.e,
        }
    }
}

impl FromStr for Axis {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Ok(Self::X),
            "y" => Ok(Self::Y),
            "z" => Ok(Self::Z),
            "e" => Ok(Self::E),
            _ => Err(ConnectorError::InvalidArgument(format!("unknown axis '{}'", s))),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A heater addressed by the host: `tool`, `toolN`, `bed` or `chamber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heater {
    /// `None` means the currently selected tool.
    Tool(Option<u32>),
    Bed,
    Chamber,
}

impl FromStr for Heater {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tool" => Ok(Self::Tool(None)),
            "bed" => Ok(Self::Bed),
            "chamber" => Ok(Self::Chamber),
            _ => tool_number(s)
                .map(|n| Self::Tool(Some(n)))
                .ok_or_else(|| ConnectorError::InvalidArgument(format!("unknown heater '{}'", s))),
        }
    }
}

fn tool_number(name: &str) -> Option<u32> {
    name.strip_prefix("tool")?.parse().ok()
}

/// Move the given axes. Without an explicit speed the slowest configured axis
/// speed among them is used; a speed of zero or less leaves out the feed rate.
pub fn jog(axes: &[(Axis, f64)], relative: bool, speed: Option<f64>, profile: &PrinterProfile) -> Result<Vec<String>> {
    if axes.is_empty() {
        return Err(ConnectorError::InvalidArgument("jog needs at least one axis".to_string()));
    }
    let moves: Vec<String> = axes
        .iter()
        .map(|(axis, amount)| format!("{}{}", axis.letter(), amount))
        .collect();
    let mut command = format!("G0 {}", moves.join(" "));

    let speed = speed.unwrap_or_else(|| {
        axes.iter()
            .map(|(axis, _)| axis.speed(profile))
            .fold(f64::INFINITY, f64::min)
    });
    if speed > 0.0 {
        command.push_str(&format!(" F{}", speed));
    }

    Ok(if relative {
        vec!["G91".to_string(), command, "G90".to_string()]
    } else {
        vec!["G90".to_string(), command]
    })
}

pub fn home(axes: &[Axis]) -> Vec<String> {
    let mut command = String::from("G28");
    for axis in axes {
        command.push_str(&format!(" {}0", axis.letter()));
    }
    vec!["G91".to_string(), command, "G90".to_string()]
}

/// Relative extrusion; the speed never exceeds the configured E speed.
pub fn extrude(amount: f64, speed: Option<f64>, profile: &PrinterProfile) -> Vec<String> {
    let max_speed = profile.axes.e;
    let speed = speed.map_or(max_speed, |s| s.min(max_speed));
    vec![
        "G91".to_string(),
        "M83".to_string(),
        format!("G1 E{} F{}", amount, speed),
        "M82".to_string(),
        "G90".to_string(),
    ]
}

pub fn set_temperature(heater: Heater, value: f64, profile: &PrinterProfile) -> String {
    match heater {
        Heater::Tool(Some(n)) if profile.extruder.count > 1 && !profile.extruder.shared_nozzle => {
            format!("M104 T{} S{}", n, value)
        }
        Heater::Tool(_) => format!("M104 S{}", value),
        Heater::Bed => format!("M140 S{}", value),
        Heater::Chamber => format!("M141 S{}", value),
    }
}

/// `tool1` selects `T1`.
pub fn change_tool(tool: &str) -> Result<String> {
    tool_number(tool)
        .map(|n| format!("T{}", n))
        .ok_or_else(|| ConnectorError::InvalidArgument(format!("unknown tool '{}'", tool)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_jog_uses_slowest_axis() {
        let profile = PrinterProfile::default();
        let commands = jog(&[(Axis::X, 10.0), (Axis::Z, -0.5)], true, None, &profile).unwrap();
        assert_eq!(commands, vec!["G91", "G0 X10 Z-0.5 F200", "G90"]);
    }

    #[test]
    fn test_absolute_jog_without_feed_rate() {
        let profile = PrinterProfile::default();
        let commands = jog(&[(Axis::Y, 100.0)], false, Some(0.0), &profile).unwrap();
        assert_eq!(commands, vec!["G90", "G0 Y100"]);
        assert!(jog(&[], true, None, &profile).is_err());
    }

    #[test]
    fn test_home_and_extrude() {
        assert_eq!(home(&[Axis::X, Axis::Y]), vec!["G91", "G28 X0 Y0", "G90"]);
        assert_eq!(home(&[]), vec!["G91", "G28", "G90"]);

        let profile = PrinterProfile::default();
        assert_eq!(
            extrude(5.0, Some(1000.0), &profile),
            vec!["G91", "M83", "G1 E5 F300", "M82", "G90"]
        );
        assert_eq!(extrude(-2.5, Some(120.0), &profile)[2], "G1 E-2.5 F120");
    }

    #[test]
    fn test_temperature_targets() {
        let mut profile = PrinterProfile::default();
        assert_eq!(set_temperature("tool1".parse().unwrap(), 210.0, &profile), "M104 S210");
        assert_eq!(set_temperature("bed".parse().unwrap(), 60.0, &profile), "M140 S60");
        assert_eq!(set_temperature("chamber".parse().unwrap(), 35.0, &profile), "M141 S35");

        profile.extruder.count = 2;
        assert_eq!(set_temperature("tool1".parse().unwrap(), 210.0, &profile), "M104 T1 S210");
        assert_eq!(set_temperature(Heater::Tool(None), 200.0, &profile), "M104 S200");
        profile.extruder.shared_nozzle = true;
        assert_eq!(set_temperature("tool1".parse().unwrap(), 210.0, &profile), "M104 S210");

        assert!("hotend".parse::<Heater>().is_err());
    }

    #[test]
    fn test_change_tool() {
        assert_eq!(change_tool("tool2").unwrap(), "T2");
        assert!(change_tool("bed").is_err());
        assert_eq!("z".parse::<Axis>().unwrap(), Axis::Z);
    }
}
