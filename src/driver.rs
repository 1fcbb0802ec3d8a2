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

//! The speed controller for the drive motors.
//!
//! Clients set target speeds; the driver walks the actually-sent speeds
//! toward the targets one tick at a time, limited by the acceleration cap (or
//! the braking cap, when braking and slowing down), trimmed per side, and
//! squashed to zero inside the hardware dead-band. Each tick emits at most
//! one `V` motor command on the link.

use std::{
    fmt::Display,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    config::Configuration,
    link::{self, Link, SerialLine},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Which motor an operation applies to.
pub enum Motor {
    /// The left motor only.
    Left,
    /// The right motor only.
    Right,
    /// Both motors together.
    Both,
}

#[derive(Debug)]
/// The ways in which a driver operation can be refused or fail.
pub enum Error {
    /// A speed or braking value was out of range, or the requested targets
    /// would turn too hard. The string says which limit was violated.
    Parameter(String),
    /// The motor controller is in emergency stop; speed changes are not
    /// accepted until a `go`.
    Stopped,
    /// The command could not be delivered on the link.
    Link(link::Error),
}

impl From<link::Error> for Error {
    fn from(err: link::Error) -> Self {
        Error::Link(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Parameter(s) => write!(f, "{s}"),
            Error::Stopped => write!(f, "cannot change speed while emergency stopped"),
            Error::Link(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
/// A serializable summary of the driver's state, reported to clients.
pub struct DriverStatus {
    /// The left target speed, in percent.
    pub target_left: f64,
    /// The right target speed, in percent.
    pub target_right: f64,
    /// The left speed most recently walked toward the target, in percent.
    pub last_left: f64,
    /// The right speed most recently walked toward the target, in percent.
    pub last_right: f64,
    /// The current braking intensity; zero when not braking.
    pub braking_speed: f64,
    /// Seconds since the last tick that emitted a motor command.
    pub seconds_since_update: Option<f64>,
}

/// The mutable speed state, guarded by one lock so ticks and target changes
/// never interleave halfway.
struct Speeds {
    /// (left, right) targets, in percent.
    target: [f64; 2],
    /// (left, right) speeds last walked toward the targets, in percent.
    last: [f64; 2],
    /// The per-tick change cap while braking; zero means not braking.
    braking: f64,
    /// When `tick` last emitted a motor command.
    last_update: Option<Instant>,
}

/// The speed controller.
///
/// The driver holds no reference to the link; callers pass it in, which keeps
/// ownership flowing strictly downward from the robot.
pub struct Driver {
    min_speed: f64,
    max_speed: f64,
    max_turn_speed: f64,
    max_acceleration: f64,
    max_braking: f64,
    speed_adjust: f64,
    /// (left, right) multiplicative trims.
    side_adjust: [f64; 2],
    min_update_interval: Duration,
    speeds: Mutex<Speeds>,
}

impl Driver {
    #[must_use]
    /// Construct a driver with the limits in `config`, at rest.
    pub fn new(config: &Configuration) -> Driver {
        Driver {
            min_speed: config.min_speed,
            max_speed: config.max_speed,
            max_turn_speed: config.max_turn_speed,
            max_acceleration: config.max_acceleration,
            max_braking: config.max_braking,
            speed_adjust: config.speed_adjust,
            side_adjust: [config.left_speed_adjust, config.right_speed_adjust],
            min_update_interval: Duration::from_secs_f64(config.min_update_interval),
            speeds: Mutex::new(Speeds {
                target: [0.0, 0.0],
                last: [0.0, 0.0],
                braking: 0.0,
                last_update: None,
            }),
        }
    }

    /// Take the motor controller out of emergency stop and leave the robot
    /// at rest.
    ///
    /// # Errors
    ///
    /// Returns an error if the `G` command could not be sent.
    ///
    /// # Panics
    ///
    /// This function will panic if the speed lock is poisoned.
    pub fn go<P: SerialLine>(&self, link: &Link<P>) -> Result<(), Error> {
        link.send("G")?;
        let mut speeds = self.speeds.lock().unwrap();
        speeds.target = [0.0, 0.0];
        Ok(())
    }

    /// Stop the robot by commanding the motor controller into emergency
    /// stop. The `X` command halts the motors immediately, so the mirrored
    /// sent-speed state is zeroed along with the targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the `X` command could not be sent.
    ///
    /// # Panics
    ///
    /// This function will panic if the speed lock is poisoned.
    pub fn stop<P: SerialLine>(&self, link: &Link<P>) -> Result<(), Error> {
        link.send("X")?;
        let mut speeds = self.speeds.lock().unwrap();
        speeds.target = [0.0, 0.0];
        speeds.last = [0.0, 0.0];
        speeds.braking = 0.0;
        Ok(())
    }

    /// Begin braking: pin the targets to zero and let each tick shed up to
    /// `braking_speed` percent per side.
    ///
    /// # Errors
    ///
    /// Returns `Error::Parameter` if `braking_speed` is negative or exceeds
    /// the braking limit.
    ///
    /// # Panics
    ///
    /// This function will panic if the speed lock is poisoned.
    pub fn brake(&self, braking_speed: f64) -> Result<(), Error> {
        if braking_speed < 0.0 {
            return Err(Error::Parameter(format!(
                "braking speed {braking_speed} cannot be negative"
            )));
        }
        if braking_speed > self.max_braking {
            return Err(Error::Parameter(format!(
                "braking speed {braking_speed} exceeds maximum value of {}",
                self.max_braking
            )));
        }

        let mut speeds = self.speeds.lock().unwrap();
        speeds.target = [0.0, 0.0];
        speeds.braking = braking_speed;
        Ok(())
    }

    /// Set the target speed of one or both motors, leaving braking mode if
    /// it was active.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` while the motor controller reports emergency
    /// stop, and `Error::Parameter` if the speed is out of range or the new
    /// target pair would exceed the turn-speed limit.
    ///
    /// # Panics
    ///
    /// This function will panic if the speed lock is poisoned.
    pub fn set_speed<P: SerialLine>(
        &self,
        link: &Link<P>,
        speed: f64,
        motor: Motor,
    ) -> Result<(), Error> {
        if link.is_estopped() {
            return Err(Error::Stopped);
        }
        if speed.abs() > self.max_speed {
            return Err(Error::Parameter(format!(
                "speed {speed} exceeds maximum value of {}",
                self.max_speed
            )));
        }

        let mut speeds = self.speeds.lock().unwrap();
        let [old_left, old_right] = speeds.target;
        let new_target = match motor {
            Motor::Both => [speed, speed],
            Motor::Left => [speed, old_right],
            Motor::Right => [old_left, speed],
        };

        if (new_target[0] - new_target[1]).abs() > self.max_turn_speed {
            return Err(Error::Parameter(format!(
                "new targets ({},{}) exceed maximum turn speed of {}",
                new_target[0], new_target[1], self.max_turn_speed
            )));
        }

        speeds.braking = 0.0;
        speeds.target = new_target;
        Ok(())
    }

    #[must_use]
    /// The current target speed(s) for `motor`, left first when both.
    ///
    /// # Panics
    ///
    /// This function will panic if the speed lock is poisoned.
    pub fn get_speed(&self, motor: Motor) -> Vec<f64> {
        let speeds = self.speeds.lock().unwrap();
        match motor {
            Motor::Left => vec![speeds.target[0]],
            Motor::Right => vec![speeds.target[1]],
            Motor::Both => speeds.target.to_vec(),
        }
    }

    #[must_use]
    /// Whether the driver is currently in braking mode.
    ///
    /// # Panics
    ///
    /// This function will panic if the speed lock is poisoned.
    pub fn is_braking(&self) -> bool {
        self.speeds.lock().unwrap().braking > 0.0
    }

    /// Walk the sent speeds one step toward the targets and emit a motor
    /// command. Rate-limited: a call sooner than the minimum update interval
    /// after the previous emission does nothing. A call with nothing left to
    /// converge emits nothing.
    ///
    /// Returns whether the sent speeds have reached the targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the motor command could not be sent.
    ///
    /// # Panics
    ///
    /// This function will panic if the speed lock is poisoned.
    pub fn tick<P: SerialLine>(&self, link: &Link<P>) -> Result<bool, Error> {
        let mut speeds = self.speeds.lock().unwrap();

        if let Some(last_update) = speeds.last_update {
            if last_update.elapsed() < self.min_update_interval {
                return Ok(false);
            }
        }

        if speeds.target == speeds.last {
            return Ok(true);
        }

        let target = speeds.target;
        let mut to_send = [0.0f64; 2];
        for side in 0..2 {
            // braking only caps deceleration; accelerating away from a brake
            // uses the normal limit
            let max_diff = if speeds.braking > 0.0 && target[side].abs() < speeds.last[side].abs() {
                speeds.braking
            } else {
                self.max_acceleration
            };

            let mut diff = target[side] - speeds.last[side];
            if diff.abs() > max_diff {
                diff = max_diff.copysign(diff);
            }
            speeds.last[side] += diff;

            to_send[side] = speeds.last[side] * self.side_adjust[side] * self.speed_adjust;

            // inside the hardware dead-band: emit zero, and claim the target
            // was reached so we do not tick forever under it
            if to_send[side].abs() < self.min_speed {
                speeds.last[side] = target[side];
                to_send[side] = 0.0;
            }
        }

        // the motor controller wants right,left; an old hardware quirk
        link.send(&format!(
            "V{},{}",
            convert_speed(to_send[1]),
            convert_speed(to_send[0])
        ))?;
        speeds.last_update = Some(Instant::now());

        Ok(speeds.target == speeds.last)
    }

    #[must_use]
    /// Summarize the driver's state for the status report.
    ///
    /// # Panics
    ///
    /// This function will panic if the speed lock is poisoned.
    pub fn status(&self) -> DriverStatus {
        let speeds = self.speeds.lock().unwrap();
        DriverStatus {
            target_left: speeds.target[0],
            target_right: speeds.target[1],
            last_left: speeds.last[0],
            last_right: speeds.last[1],
            braking_speed: speeds.braking,
            seconds_since_update: speeds.last_update.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
/// Convert a percent speed (-100..100) to motor controller units (-63..63),
/// truncating toward zero.
fn convert_speed(percent: f64) -> i8 {
    (percent * 63.0 / 100.0) as i8
}
