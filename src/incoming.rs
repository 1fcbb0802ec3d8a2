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

//! Parsing of incoming client requests.
//!
//! A request is one ASCII line: a command word, optionally followed by an
//! argument. Anything after the argument is ignored, which forgives clients
//! with sloppy line handling.

use std::fmt::Display;

use crate::driver::Motor;

#[derive(Debug, PartialEq)]
/// A parsed client request, ready to be executed.
pub enum Request {
    /// An empty line. Refreshes the client-liveness clock and nothing else.
    Blank,
    /// Close this connection.
    Exit,
    /// Shut the whole server down.
    Shutdown,
    /// Acquire the controller lease for this session.
    Control,
    /// Report the aggregated status snapshot.
    Status,
    /// Take the motor controller out of emergency stop.
    Go,
    /// Stop the robot.
    Stop,
    /// Tear down and reopen the serial link.
    Reset,
    /// Brake at the given intensity.
    Brake(f64),
    /// Set the target speed of one or both motors, or query the current
    /// targets when no speed is given.
    SetSpeed {
        /// Which motor the request names.
        motor: Motor,
        /// The speed to set, or `None` to query.
        speed: Option<f64>,
    },
}

#[derive(Debug, PartialEq, Eq)]
/// The ways in which parsing a request can fail.
pub enum Error {
    /// The command word was not recognized.
    /// The value inside is the offending line.
    UnknownCommand(String),
    /// The command was recognized but its argument was missing or out of
    /// range. The string describes what was expected.
    BadArgument(&'static str),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownCommand(line) => write!(f, "invalid command '{line}'"),
            Error::BadArgument(expected) => write!(f, "{expected}"),
        }
    }
}

impl Request {
    /// Parse one request line.
    ///
    /// # Errors
    ///
    /// This function will return an `Err` in the cases described in `Error`.
    pub fn parse(line: &str) -> Result<Request, Error> {
        let line = line.trim();
        let mut parts = line.split_whitespace();

        let Some(word) = parts.next() else {
            return Ok(Request::Blank);
        };

        match word {
            "exit" => Ok(Request::Exit),
            "shutdown" => Ok(Request::Shutdown),
            "control" => Ok(Request::Control),
            "status" => Ok(Request::Status),
            "go" => Ok(Request::Go),
            "stop" => Ok(Request::Stop),
            "reset" => Ok(Request::Reset),
            "brake" => {
                let value = parts
                    .next()
                    .and_then(|arg| arg.parse::<i64>().ok())
                    .filter(|v| (1..=100).contains(v))
                    .ok_or(Error::BadArgument("brake must be a number from 1 to 100"))?;
                #[allow(clippy::cast_precision_loss)]
                let value = value as f64;
                Ok(Request::Brake(value))
            }
            "speed" | "left" | "right" => {
                let motor = match word {
                    "left" => Motor::Left,
                    "right" => Motor::Right,
                    _ => Motor::Both,
                };
                let speed = match parts.next() {
                    None => None,
                    Some(arg) => {
                        let value = arg
                            .parse::<i64>()
                            .ok()
                            .filter(|v| (-100..=100).contains(v))
                            .ok_or(Error::BadArgument(
                                "speed must be a number from -100 to 100",
                            ))?;
                        #[allow(clippy::cast_precision_loss)]
                        let value = value as f64;
                        Some(value)
                    }
                };
                Ok(Request::SetSpeed { motor, speed })
            }
            _ => Err(Error::UnknownCommand(line.to_string())),
        }
    }
}
