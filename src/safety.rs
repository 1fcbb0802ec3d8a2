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

//! Sensor-driven safety alerts.
//!
//! Every alert has a distinct set threshold and clear threshold, so a sensor
//! hovering near a single boundary cannot flap the flag on and off with every
//! reading. A missing sensor value is no new information and leaves its
//! alerts alone.

use serde::Serialize;

use crate::config::Configuration;

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// The current alert flags, reported in the monitor status.
pub struct Alerts {
    /// The motor driver is hot enough to worry about.
    pub driver_overtemp_warn: bool,
    /// The motor driver is hot enough to stop the robot.
    pub driver_overtemp_estop: bool,
    /// The battery is low.
    pub battery_warn: bool,
    /// The battery is so low the robot must stop before it browns out.
    pub battery_estop: bool,
    /// Both sonars see something close ahead.
    pub sonar_warn: bool,
    /// The wheels disagree about how fast the robot is going.
    pub encoder_warn: bool,
}

/// A snapshot of the derived sensor values the checker consumes.
/// `None` means the sensor has not produced a value yet.
pub struct SafetyInputs {
    /// Smoothed motor driver temperature, in degrees C.
    pub driver_temperature: Option<f64>,
    /// Smoothed battery voltage, in volts.
    pub battery_voltage: Option<f64>,
    /// Latest (left, right) sonar distances, in inches.
    pub sonar_distances: (Option<i64>, Option<i64>),
    /// Latest (left, right) wheel RPM estimates.
    pub encoder_rpms: (Option<f64>, Option<f64>),
}

/// Watches the sensor suite and decides when the robot must not be allowed
/// to keep driving.
pub struct SafetyChecker {
    driver_safe_temperature: f64,
    driver_warn_temperature: f64,
    driver_estop_temperature: f64,
    battery_safe_voltage: f64,
    battery_warn_voltage: f64,
    battery_estop_voltage: f64,
    sonar_warn_distance: i64,
    sonar_safe_distance: i64,
    encoder_safe_delta: f64,
    encoder_warn_delta: f64,
    alerts: Alerts,
}

impl SafetyChecker {
    #[must_use]
    /// Construct a checker with the thresholds in `config` and all alerts
    /// clear.
    pub fn new(config: &Configuration) -> SafetyChecker {
        SafetyChecker {
            driver_safe_temperature: config.driver_safe_temperature,
            driver_warn_temperature: config.driver_warn_temperature,
            driver_estop_temperature: config.driver_estop_temperature,
            battery_safe_voltage: config.battery_safe_voltage,
            battery_warn_voltage: config.battery_warn_voltage,
            battery_estop_voltage: config.battery_estop_voltage,
            sonar_warn_distance: config.sonar_warn_distance,
            sonar_safe_distance: config.sonar_safe_distance,
            encoder_safe_delta: config.encoder_safe_delta,
            encoder_warn_delta: config.encoder_warn_delta,
            alerts: Alerts::default(),
        }
    }

    /// Update every alert from the latest sensor values.
    pub fn check(&mut self, inputs: &SafetyInputs) {
        if let Some(temperature) = inputs.driver_temperature {
            set_or_clear(
                &mut self.alerts.driver_overtemp_estop,
                temperature >= self.driver_estop_temperature,
                temperature <= self.driver_safe_temperature,
            );
            set_or_clear(
                &mut self.alerts.driver_overtemp_warn,
                temperature >= self.driver_warn_temperature,
                temperature <= self.driver_safe_temperature,
            );
        }

        if let Some(voltage) = inputs.battery_voltage {
            set_or_clear(
                &mut self.alerts.battery_estop,
                voltage <= self.battery_estop_voltage,
                voltage >= self.battery_safe_voltage,
            );
            set_or_clear(
                &mut self.alerts.battery_warn,
                voltage <= self.battery_warn_voltage,
                voltage >= self.battery_safe_voltage,
            );
        }

        if let (Some(left), Some(right)) = inputs.sonar_distances {
            set_or_clear(
                &mut self.alerts.sonar_warn,
                left.max(right) <= self.sonar_warn_distance,
                left.min(right) >= self.sonar_safe_distance,
            );
        }

        if let (Some(left), Some(right)) = inputs.encoder_rpms {
            let delta = (left - right).abs();
            set_or_clear(
                &mut self.alerts.encoder_warn,
                delta >= self.encoder_warn_delta,
                delta <= self.encoder_safe_delta,
            );
        }
    }

    #[must_use]
    /// Whether the robot must be stopped right now.
    pub fn should_estop(&self) -> bool {
        self.alerts.driver_overtemp_estop || self.alerts.battery_estop
    }

    #[must_use]
    /// The current alert flags.
    pub fn alerts(&self) -> Alerts {
        self.alerts
    }
}

/// Apply a hysteresis transition to `flag`: assert on `set`, retract on
/// `clear`, and hold in between.
fn set_or_clear(flag: &mut bool, set: bool, clear: bool) {
    if set {
        *flag = true;
    } else if clear {
        *flag = false;
    }
}
