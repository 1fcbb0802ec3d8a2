/*
  waddle, a robot control server.
  Copyright (C) 2022 Rice Eclipse.

  waddle is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  waddle is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Loading and validating configurations for the robot controller.

use std::fmt::Display;
use std::io::Read;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
/// A configuration for the entire robot controller.
///
/// Every field has a default matching the values the robot actually runs
/// with, so a configuration file only needs to name the fields it wants to
/// override. All time-valued fields are in seconds.
pub struct Configuration {
    /// The baud rate of the serial link to the microcontroller.
    pub baud_rate: u32,
    /// Speeds whose magnitude adjusts below this percentage are below the
    /// hardware dead-band and are sent as 0.
    pub min_speed: f64,
    /// The largest allowed target speed magnitude, in percent.
    pub max_speed: f64,
    /// The largest allowed difference between the left and right target
    /// speeds, in percent.
    pub max_turn_speed: f64,
    /// The largest allowed change in a sent speed per driver tick, in
    /// percent.
    pub max_acceleration: f64,
    /// The largest allowed braking speed, which is also the largest per-tick
    /// speed change while braking.
    pub max_braking: f64,
    /// A multiplicative trim applied to both sides, in `[0, 1]`.
    pub speed_adjust: f64,
    /// A multiplicative trim applied to the left side only, in `[0, 1]`.
    pub left_speed_adjust: f64,
    /// A multiplicative trim applied to the right side only, in `[0, 1]`.
    pub right_speed_adjust: f64,
    /// The lower bound on the time between driver ticks.
    pub min_update_interval: f64,
    /// How long to wait between attempts to reset an unhealthy link.
    pub time_between_reset_attempts: f64,
    /// Seconds since the last client request after which the robot is
    /// stopped.
    pub client_timeout: f64,
    /// Seconds since the last control command after which the robot starts
    /// braking on its own.
    pub control_timeout_brake: f64,
    /// Seconds since the last control command after which the robot is
    /// stopped outright.
    pub control_timeout_stop: f64,
    /// The braking intensity used when braking due to a control timeout.
    pub timeout_brake_speed: f64,
    /// The liveness beacon file watched by the external watchdog.
    pub file_touch_path: String,
    /// How often to touch the liveness beacon file.
    pub file_touch_interval: f64,
    /// The floor on the supervisor loop period.
    pub loop_min_interval: f64,
    /// Temperature at or below which the driver overtemperature alerts clear.
    pub driver_safe_temperature: f64,
    /// Temperature at or above which the driver overtemperature warning sets.
    pub driver_warn_temperature: f64,
    /// Temperature at or above which the driver overtemperature estop sets.
    pub driver_estop_temperature: f64,
    /// Voltage at or above which the battery alerts clear.
    pub battery_safe_voltage: f64,
    /// Voltage at or below which the battery warning sets.
    pub battery_warn_voltage: f64,
    /// Voltage at or below which the battery estop sets.
    pub battery_estop_voltage: f64,
    /// Distance in inches at or below which (on both sonars) the sonar
    /// warning sets.
    pub sonar_warn_distance: i64,
    /// Distance in inches at or above which (on both sonars) the sonar
    /// warning clears.
    pub sonar_safe_distance: i64,
    /// Left/right RPM difference at or below which the encoder warning
    /// clears.
    pub encoder_safe_delta: f64,
    /// Left/right RPM difference at or above which the encoder warning sets.
    pub encoder_warn_delta: f64,
    /// The top-side resistance of the battery voltage divider, in ohms.
    pub battery_divider_r1: f64,
    /// The bottom-side resistance of the battery voltage divider, in ohms.
    pub battery_divider_r2: f64,
    /// The number of magnets on each wheel encoder ring.
    pub encoder_magnets: u32,
    /// The trailing window over which encoder RPM is computed.
    pub encoder_window: f64,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            baud_rate: 9600,
            min_speed: 5.0,
            max_speed: 95.0,
            max_turn_speed: 50.0,
            max_acceleration: 3.0,
            max_braking: 20.0,
            speed_adjust: 1.0,
            left_speed_adjust: 1.0,
            right_speed_adjust: 0.95,
            min_update_interval: 0.2,
            time_between_reset_attempts: 0.5,
            client_timeout: 5.0,
            control_timeout_brake: 3.0,
            control_timeout_stop: 8.0,
            timeout_brake_speed: 2.0,
            file_touch_path: "/tmp/server-monitor-alive".into(),
            file_touch_interval: 1.0,
            loop_min_interval: 0.05,
            driver_safe_temperature: 30.0,
            driver_warn_temperature: 40.0,
            driver_estop_temperature: 70.0,
            battery_safe_voltage: 22.0,
            battery_warn_voltage: 20.0,
            battery_estop_voltage: 15.0,
            sonar_warn_distance: 40,
            sonar_safe_distance: 60,
            encoder_safe_delta: 100.0,
            encoder_warn_delta: 200.0,
            battery_divider_r1: 100_000.0,
            battery_divider_r2: 10_000.0,
            encoder_magnets: 2,
            encoder_window: 10.0,
        }
    }
}

#[derive(Debug)]
/// The set of errors that can occur when validating a configuration.
pub enum Error {
    /// The configuration was malformed and could not be parsed into a
    /// `Configuration` object.
    Malformed(serde_json::Error),
    /// A parameter was outside its allowed range.
    OutOfRange {
        /// The name of the offending parameter.
        name: &'static str,
        /// The smallest allowed value.
        min: f64,
        /// The largest allowed value.
        max: f64,
    },
    /// A set of hysteresis thresholds was not correctly ordered.
    /// The string names the group of thresholds at fault.
    BadThresholds(&'static str),
}

impl Configuration {
    /// Construct a new `Configuration` by parsing some readable source.
    /// Will also check the configuration to determine that there are no logical inconsistencies in
    /// its definition.
    ///
    /// # Errors
    ///
    /// This function will return errors in line with the definition of `Error` in this module.
    pub fn parse(source: &mut impl Read) -> Result<Configuration, Error> {
        let config: Configuration = serde_json::from_reader(source).map_err(Error::Malformed)?;
        config.validate()?;
        Ok(config)
    }

    /// Check this configuration for logical inconsistencies.
    ///
    /// # Errors
    ///
    /// This function will return an `Err` describing the first inconsistency
    /// found.
    pub fn validate(&self) -> Result<(), Error> {
        in_range("max_speed", self.max_speed, 1.0, 100.0)?;
        in_range("max_turn_speed", self.max_turn_speed, 1.0, 200.0)?;
        in_range("min_speed", self.min_speed, 0.0, 99.0)?;
        in_range("max_acceleration", self.max_acceleration, 1.0, 200.0)?;
        in_range("max_braking", self.max_braking, 1.0, 200.0)?;
        in_range("speed_adjust", self.speed_adjust, 0.0, 1.0)?;
        in_range("left_speed_adjust", self.left_speed_adjust, 0.0, 1.0)?;
        in_range("right_speed_adjust", self.right_speed_adjust, 0.0, 1.0)?;
        in_range("timeout_brake_speed", self.timeout_brake_speed, 0.0, self.max_braking)?;

        for (name, value) in [
            ("min_update_interval", self.min_update_interval),
            ("time_between_reset_attempts", self.time_between_reset_attempts),
            ("client_timeout", self.client_timeout),
            ("control_timeout_brake", self.control_timeout_brake),
            ("control_timeout_stop", self.control_timeout_stop),
            ("file_touch_interval", self.file_touch_interval),
            ("loop_min_interval", self.loop_min_interval),
            ("encoder_window", self.encoder_window),
        ] {
            in_range(name, value, 0.0, f64::MAX)?;
        }

        // hysteresis pairs must leave a gap between set and clear, or a
        // single noisy reading could flap the alert
        if self.driver_safe_temperature >= self.driver_warn_temperature
            || self.driver_warn_temperature > self.driver_estop_temperature
        {
            return Err(Error::BadThresholds("driver temperature"));
        }
        if self.battery_safe_voltage <= self.battery_warn_voltage
            || self.battery_warn_voltage < self.battery_estop_voltage
        {
            return Err(Error::BadThresholds("battery voltage"));
        }
        if self.sonar_warn_distance >= self.sonar_safe_distance {
            return Err(Error::BadThresholds("sonar distance"));
        }
        if self.encoder_safe_delta >= self.encoder_warn_delta {
            return Err(Error::BadThresholds("encoder delta"));
        }

        if self.battery_divider_r2 <= 0.0 || self.battery_divider_r1 < 0.0 {
            return Err(Error::BadThresholds("battery divider"));
        }
        if self.encoder_magnets == 0 {
            return Err(Error::OutOfRange {
                name: "encoder_magnets",
                min: 1.0,
                max: f64::MAX,
            });
        }

        Ok(())
    }
}

/// Check that `value` lies in `[minimum, maximum]`.
fn in_range(name: &'static str, value: f64, minimum: f64, maximum: f64) -> Result<(), Error> {
    if value >= minimum && value <= maximum {
        Ok(())
    } else {
        Err(Error::OutOfRange {
            name,
            min: minimum,
            max: maximum,
        })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Malformed(json_err) => {
                write!(f, "Failed to parse JSON for configuration: {json_err}")
            }
            Error::OutOfRange { name, min, max } => {
                write!(f, "{name} must be between {min} and {max}")
            }
            Error::BadThresholds(which) => {
                write!(f, "{which} thresholds are not correctly ordered")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    /// Test that an empty configuration gives the stock parameters.
    fn empty_config() {
        let mut cursor = Cursor::new("{}");
        let config = Configuration::parse(&mut cursor).unwrap();
        assert_eq!(config, Configuration::default());
    }

    #[test]
    /// Test that overridden fields land and unnamed fields keep their
    /// defaults.
    fn partial_config() {
        let config_str = r#"{
            "max_speed": 80,
            "max_acceleration": 5,
            "right_speed_adjust": 1.0,
            "file_touch_path": "/tmp/beacon"
        }"#;

        let mut cursor = Cursor::new(config_str);
        let config = Configuration::parse(&mut cursor).unwrap();

        assert_eq!(config.max_speed, 80.0);
        assert_eq!(config.max_acceleration, 5.0);
        assert_eq!(config.right_speed_adjust, 1.0);
        assert_eq!(config.file_touch_path, "/tmp/beacon");
        assert_eq!(config.min_speed, 5.0);
        assert_eq!(config.client_timeout, 5.0);
    }

    #[test]
    /// Test that a speed bound outside its legal range is rejected.
    fn speed_out_of_range() {
        let mut cursor = Cursor::new(r#"{"max_speed": 150}"#);
        assert!(matches!(
            Configuration::parse(&mut cursor),
            Err(Error::OutOfRange {
                name: "max_speed",
                ..
            })
        ));
    }

    #[test]
    /// Test that overlapping hysteresis thresholds are rejected.
    fn overlapping_thresholds() {
        let mut cursor = Cursor::new(r#"{"driver_safe_temperature": 45}"#);
        assert!(matches!(
            Configuration::parse(&mut cursor),
            Err(Error::BadThresholds("driver temperature"))
        ));
    }

    #[test]
    /// Test that illegal JSON is rejected as malformed.
    fn malformed_json() {
        let mut cursor = Cursor::new("{max_speed: 80");
        assert!(matches!(
            Configuration::parse(&mut cursor),
            Err(Error::Malformed(_))
        ));
    }
}
