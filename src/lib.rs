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

#![warn(clippy::pedantic)]

//! The control server for a differential-drive robot.
//!
//! The server sits between untrusted network clients and the motor hardware,
//! which hangs off a microcontroller on a serial link. Clients send target
//! speeds; the server turns them into a rate-limited stream of motor commands
//! while a supervisor loop watches sensor health, link health, and client
//! liveness, braking or stopping the robot whenever something looks wrong.

pub mod config;
pub mod console;
pub mod driver;
pub mod incoming;
pub mod link;
pub mod outgoing;
pub mod robot;
pub mod safety;
pub mod sensors;
pub mod server;
pub mod state;
pub mod supervisor;

use std::fmt::Display;

pub use state::{Guard as StateGuard, State as RunState};

#[derive(Debug)]
/// The set of fatal errors which can occur while setting up or running the
/// controller.
///
/// Client-facing failures (bad speeds, busy locks, and the like) never become
/// a `ControllerError`; they are replied to on the wire and the server keeps
/// running.
pub enum ControllerError {
    /// The command-line arguments were invalid.
    /// The string describes what was wrong with them.
    Args(&'static str),
    /// An I/O error which was not recoverable.
    Io(std::io::Error),
    /// The configuration file could not be parsed or was inconsistent.
    Config(config::Error),
    /// The serial link could not be opened.
    Link(link::Error),
    /// A lock was poisoned, implying that a thread panicked while holding it.
    Poison,
}

impl From<std::io::Error> for ControllerError {
    fn from(err: std::io::Error) -> Self {
        ControllerError::Io(err)
    }
}

impl From<config::Error> for ControllerError {
    fn from(err: config::Error) -> Self {
        ControllerError::Config(err)
    }
}

impl From<link::Error> for ControllerError {
    fn from(err: link::Error) -> Self {
        ControllerError::Link(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for ControllerError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        ControllerError::Poison
    }
}

impl Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Args(s) => write!(f, "invalid arguments: {s}"),
            ControllerError::Io(e) => write!(f, "I/O error: {e}"),
            ControllerError::Config(e) => write!(f, "configuration error: {e}"),
            ControllerError::Link(e) => write!(f, "link error: {e}"),
            ControllerError::Poison => write!(f, "a lock was poisoned"),
        }
    }
}
