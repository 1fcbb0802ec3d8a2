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

//! The robot: one link, one driver, one sensor suite, one safety checker,
//! and the bookkeeping that arbitrates between the clients poking at them.
//!
//! Two exclusivity mechanisms live here. The *controller lease* is a
//! long-lived token held by at most one network session; a session must take
//! it (the `control` request) before any request of its may move the robot.
//! The *control lock* is a fine-grained, non-blocking mutex around each
//! individual mutation, so a slow command cannot be interleaved with another.

use std::{
    fmt::Display,
    sync::{Mutex, TryLockError},
    time::{Duration, Instant},
};

use crate::{
    config::Configuration,
    driver::{self, Driver, Motor},
    link::{self, Link, SerialLine},
    outgoing::{MonitorStatus, Status},
    safety::SafetyChecker,
    sensors::SensorSuite,
};

/// A maker of serial lines to the microcontroller.
///
/// This exists to allow us to "spoof" hardware for tests and for running the
/// server on a machine with no robot attached.
pub trait MakeLink {
    /// The type of serial line this maker produces.
    type Port: SerialLine;

    /// Open a fresh (reader, writer) pair of handles onto the
    /// microcontroller's serial device.
    ///
    /// # Errors
    ///
    /// This function will return an error if the device cannot be opened.
    fn open(&self, config: &Configuration) -> Result<(Self::Port, Self::Port), link::Error>;
}

#[derive(Debug)]
/// The ways in which a robot operation can be refused or fail.
pub enum Error {
    /// Another holder has the control lock or the controller lease; try
    /// again.
    Busy,
    /// The session has not acquired the controller lease.
    Unauthorized,
    /// The driver refused or failed the operation.
    Driver(driver::Error),
    /// The link failed outright.
    Link(link::Error),
    /// A lock was poisoned.
    Poison,
}

impl From<driver::Error> for Error {
    fn from(err: driver::Error) -> Self {
        Error::Driver(err)
    }
}

impl From<link::Error> for Error {
    fn from(err: link::Error) -> Self {
        Error::Link(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Busy => write!(f, "robot is busy; try again"),
            Error::Unauthorized => write!(f, "you do not control the robot; send 'control' first"),
            Error::Driver(e) => write!(f, "{e}"),
            Error::Link(e) => write!(f, "{e}"),
            Error::Poison => write!(f, "a lock was poisoned"),
        }
    }
}

/// The whole robot.
///
/// Components never hold a reference back up to the robot; the driver and
/// sensors are handed the link by whoever calls them, and only the supervisor
/// and network handlers invoke robot-level operations.
pub struct Robot<M: MakeLink> {
    /// The controller configuration, fixed at startup.
    pub config: Configuration,
    /// The serial link to the microcontroller.
    pub link: Link<M::Port>,
    /// The motor speed controller.
    pub driver: Driver,
    /// The typed sensors.
    pub sensors: Mutex<SensorSuite>,
    /// The alert checker fed by the sensors.
    pub safety: Mutex<SafetyChecker>,
    maker: M,
    /// Serializes individual mutating operations; never held for long.
    control_lock: Mutex<()>,
    /// The session currently holding the controller lease, if any.
    lease: Mutex<Option<u64>>,
    /// When any client last made a request.
    last_request: Mutex<Instant>,
    /// When a client last successfully moved the robot.
    last_control: Mutex<Instant>,
}

impl<M: MakeLink> Robot<M> {
    /// Build a robot: open the link via `maker` and construct every
    /// component from `config`.
    ///
    /// # Errors
    ///
    /// This function will return an error if the serial device cannot be
    /// opened.
    pub fn new(maker: M, config: Configuration) -> Result<Robot<M>, link::Error> {
        let (reader, writer) = maker.open(&config)?;
        let now = Instant::now();
        Ok(Robot {
            link: Link::new(reader, writer),
            driver: Driver::new(&config),
            sensors: Mutex::new(SensorSuite::new(&config)),
            safety: Mutex::new(SafetyChecker::new(&config)),
            maker,
            control_lock: Mutex::new(()),
            lease: Mutex::new(None),
            last_request: Mutex::new(now),
            last_control: Mutex::new(now),
            config,
        })
    }

    /// Grant the controller lease to `session`, unless another session
    /// already holds it. Re-acquiring an already-held lease succeeds.
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if another session holds the lease.
    pub fn acquire_control(&self, session: u64) -> Result<(), Error> {
        let mut lease = self.lease.lock().map_err(|_| Error::Poison)?;
        match *lease {
            Some(holder) if holder != session => Err(Error::Busy),
            _ => {
                *lease = Some(session);
                Ok(())
            }
        }
    }

    /// Give up the controller lease if `session` holds it.
    /// Returns whether the lease was actually held by `session`.
    ///
    /// # Panics
    ///
    /// This function will panic if the lease lock is poisoned.
    pub fn release_control(&self, session: u64) -> bool {
        let mut lease = self.lease.lock().unwrap();
        if *lease == Some(session) {
            *lease = None;
            true
        } else {
            false
        }
    }

    /// Check that `session` holds the controller lease.
    fn authorize(&self, session: u64) -> Result<(), Error> {
        let lease = self.lease.lock().map_err(|_| Error::Poison)?;
        if *lease == Some(session) {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }

    /// Take the motor controller out of emergency stop.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` without the lease, `Busy` under contention,
    /// and any driver failure.
    pub fn go(&self, session: u64) -> Result<(), Error> {
        self.authorize(session)?;
        let _guard = self.try_control()?;
        self.driver.go(&self.link)?;
        self.touch_control();
        Ok(())
    }

    /// Stop the robot.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` without the lease, `Busy` under contention,
    /// and any driver failure.
    pub fn stop(&self, session: u64) -> Result<(), Error> {
        self.authorize(session)?;
        let _guard = self.try_control()?;
        self.driver.stop(&self.link)?;
        self.touch_control();
        Ok(())
    }

    /// Begin braking at intensity `braking_speed`.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` without the lease, `Busy` under contention,
    /// and `Driver(Parameter)` for an out-of-range intensity.
    pub fn brake(&self, session: u64, braking_speed: f64) -> Result<(), Error> {
        self.authorize(session)?;
        let _guard = self.try_control()?;
        self.driver.brake(braking_speed)?;
        self.touch_control();
        Ok(())
    }

    /// Set the target speed of one or both motors.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` without the lease, `Busy` under contention,
    /// and any driver rejection.
    pub fn set_speed(&self, session: u64, speed: f64, motor: Motor) -> Result<(), Error> {
        self.authorize(session)?;
        let _guard = self.try_control()?;
        self.driver.set_speed(&self.link, speed, motor)?;
        self.touch_control();
        Ok(())
    }

    /// Tear down the current serial line and open a fresh one, on behalf of
    /// a client.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` without the lease, `Busy` under contention,
    /// and any failure to reopen the device.
    pub fn reset(&self, session: u64) -> Result<(), Error> {
        self.authorize(session)?;
        let _guard = self.try_control()?;
        self.reinit_link()?;
        self.touch_control();
        Ok(())
    }

    /// Swap fresh serial handles into the link and stop the driver.
    /// This is the supervisor's recovery path for a dead link; it needs no
    /// lease because it is not a client request.
    ///
    /// # Errors
    ///
    /// This function will return an error if the device cannot be reopened
    /// or the stop command cannot be sent.
    pub fn reinit_link(&self) -> Result<(), Error> {
        let (reader, writer) = self.maker.open(&self.config)?;
        self.link.reinstall(reader, writer);
        self.driver.stop(&self.link)?;
        Ok(())
    }

    /// Release `session`'s lease if it holds one, stopping the robot if so.
    /// Called when a connection terminates for any reason; a robot whose
    /// controlling client vanished should not keep driving.
    ///
    /// # Errors
    ///
    /// This function will return an error if the stop command fails.
    pub fn end_session(&self, session: u64) -> Result<(), Error> {
        if self.release_control(session) {
            let _guard = self.try_control()?;
            self.driver.stop(&self.link)?;
        }
        Ok(())
    }

    /// Note that a client made a request just now.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn touch_request(&self) {
        *self.last_request.lock().unwrap() = Instant::now();
    }

    /// Note that a client successfully moved the robot just now.
    fn touch_control(&self) {
        *self.last_control.lock().unwrap() = Instant::now();
    }

    #[must_use]
    /// How long since any client made a request.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn request_age(&self) -> Duration {
        self.last_request.lock().unwrap().elapsed()
    }

    #[must_use]
    /// How long since a client successfully moved the robot.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn control_age(&self) -> Duration {
        self.last_control.lock().unwrap().elapsed()
    }

    /// Refresh every sensor and run the safety checker over the results.
    /// Returns whether an emergency stop is warranted.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn run_safety_check(&self) -> bool {
        let mut sensors = self.sensors.lock().unwrap();
        sensors.read_all(&self.link);
        let mut safety = self.safety.lock().unwrap();
        safety.check(&sensors.safety_inputs());
        safety.should_estop()
    }

    #[must_use]
    /// Aggregate every component's status into the single snapshot clients
    /// see. Refreshes the sensors first so the report is current.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn status(&self) -> Status {
        let mut sensors = self.sensors.lock().unwrap();
        sensors.read_all(&self.link);
        let sensor_statuses = sensors.statuses();
        drop(sensors);

        let alerts = self.safety.lock().unwrap().alerts();

        Status {
            driver: self.driver.status(),
            arduino: self.link.status(),
            monitor: MonitorStatus {
                client_age: round_tenths(self.request_age().as_secs_f64()),
                control_age: round_tenths(self.control_age().as_secs_f64()),
                alerts,
            },
            sensors: sensor_statuses,
        }
    }

    /// Take the control lock without blocking.
    fn try_control(&self) -> Result<std::sync::MutexGuard<'_, ()>, Error> {
        match self.control_lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(Error::Busy),
            Err(TryLockError::Poisoned(_)) => Err(Error::Poison),
        }
    }
}

/// Round to one decimal place for human-friendly age reporting.
fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::link::StubLine;

    /// A link maker which hands out clones of one stub line, so tests can
    /// feed frames and inspect commands across resets.
    struct StubMaker {
        line: StubLine,
    }

    impl MakeLink for StubMaker {
        type Port = StubLine;

        fn open(&self, _: &Configuration) -> Result<(StubLine, StubLine), link::Error> {
            Ok((self.line.clone(), self.line.clone()))
        }
    }

    /// Build a robot over a stub line, with the motor controller out of
    /// estop, returning the stub handle alongside it.
    fn stub_robot() -> (Robot<StubMaker>, StubLine) {
        let line = StubLine::default();
        let stub = line.clone();
        let robot = Robot::new(StubMaker { line }, Configuration::default()).unwrap();
        stub.push_line("C:1;B:0;L:0;E:0;!BV:512;");
        assert!(robot.link.poll(Duration::from_millis(100)).unwrap());
        (robot, stub)
    }

    #[test]
    /// Test that the lease is exclusive, idempotent for its holder, and
    /// gates every mutating operation.
    fn lease_gates_mutations() {
        let (robot, _stub) = stub_robot();

        // no lease: mutations refused
        assert!(matches!(robot.go(1), Err(Error::Unauthorized)));
        assert!(matches!(
            robot.set_speed(1, 10.0, Motor::Both),
            Err(Error::Unauthorized)
        ));

        robot.acquire_control(1).unwrap();
        robot.acquire_control(1).unwrap();
        assert!(matches!(robot.acquire_control(2), Err(Error::Busy)));
        assert!(matches!(robot.stop(2), Err(Error::Unauthorized)));

        robot.set_speed(1, 10.0, Motor::Both).unwrap();

        assert!(!robot.release_control(2));
        assert!(robot.release_control(1));
        robot.acquire_control(2).unwrap();
    }

    #[test]
    /// Test that successful mutations refresh the control age and
    /// unsuccessful ones do not.
    fn control_age_tracks_mutations() {
        let (robot, _stub) = stub_robot();
        robot.acquire_control(1).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(robot.control_age() >= Duration::from_millis(50));

        robot.set_speed(1, 10.0, Motor::Both).unwrap();
        assert!(robot.control_age() < Duration::from_millis(50));

        std::thread::sleep(Duration::from_millis(50));
        assert!(robot.set_speed(1, 500.0, Motor::Both).is_err());
        assert!(robot.control_age() >= Duration::from_millis(50));
    }

    #[test]
    /// Test that ending a controlling session stops the robot, and ending a
    /// viewing session does not.
    fn end_session_stops_controller() {
        let (robot, stub) = stub_robot();

        robot.end_session(7).unwrap();
        assert!(!stub.commands().contains(&"X".to_string()));

        robot.acquire_control(7).unwrap();
        robot.set_speed(7, 20.0, Motor::Both).unwrap();
        robot.end_session(7).unwrap();
        assert!(stub.commands().contains(&"X".to_string()));
        assert_eq!(robot.driver.get_speed(Motor::Both), vec![0.0, 0.0]);

        // lease is free again
        robot.acquire_control(8).unwrap();
    }

    #[test]
    /// Test that reinitializing the link swaps the ports, clears the stale
    /// frame, and stops the driver.
    fn reinit_link_recovers() {
        let (robot, stub) = stub_robot();
        assert!(robot.link.is_healthy());

        robot.reinit_link().unwrap();
        assert!(!robot.link.is_healthy());
        assert!(robot.link.get_state().is_none());
        assert!(stub.commands().contains(&"X".to_string()));
    }

    #[test]
    /// Test that the aggregated status carries all four sections.
    fn status_aggregates() {
        let (robot, stub) = stub_robot();
        stub.push_line("C:2;B:1;L:9;E:0;!BV:512;DT:260;LS:80;RS:75;LE:10;RE:10;");
        assert!(robot.link.poll(Duration::from_millis(100)).unwrap());

        let status = robot.status();
        assert!(status.arduino.healthy);
        assert!(!status.arduino.estop);
        assert_eq!(status.arduino.commands_received, 2);
        assert_eq!(status.arduino.bad_commands_received, 1);
        assert_eq!(status.driver.target_left, 0.0);
        assert_eq!(status.sensors.len(), 6);
        assert!(status.sensors[0].value.is_some());
        assert!(!status.monitor.alerts.battery_estop);
    }

    #[test]
    /// Test that the safety check pipeline drives should_estop end to end.
    fn safety_check_pipeline() {
        let (robot, stub) = stub_robot();

        // 250 counts on DT is about 72 C, past the estop threshold
        stub.push_line("C:2;B:0;L:0;E:0;!DT:250;");
        assert!(robot.link.poll(Duration::from_millis(100)).unwrap());
        assert!(robot.run_safety_check());

        // cooling to 8 counts (about -46 C) clears the alert
        stub.push_line("C:3;B:0;L:0;E:0;!DT:8;");
        assert!(robot.link.poll(Duration::from_millis(100)).unwrap());
        assert!(!robot.run_safety_check());
    }
}
