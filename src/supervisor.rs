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

//! The supervisor: the periodic loop that keeps the robot honest.
//!
//! Roughly twenty times a second it reads the sensors, runs the safety
//! checker, watches link health and client liveness, touches the watchdog
//! beacon, and ticks the driver. Every reaction is taken here, not in the
//! components: the driver never decides on its own to stop.
//!
//! Nothing transient may kill this loop. Failures are logged, once per
//! transition rather than once per iteration, and the loop carries on.

use std::{
    fs::File,
    io::Write,
    thread::sleep,
    time::{Duration, Instant},
};

use crate::{
    console::UserLog,
    robot::{MakeLink, Robot},
    state::{Guard, State},
};

/// Run the supervisor loop until `run_state` reads `Quit`.
#[allow(clippy::too_many_lines)]
pub fn supervise<M: MakeLink>(robot: &Robot<M>, log: &UserLog<impl Write>, run_state: &Guard) {
    let config = &robot.config;
    let client_timeout = Duration::from_secs_f64(config.client_timeout);
    let brake_timeout = Duration::from_secs_f64(config.control_timeout_brake);
    let stop_timeout = Duration::from_secs_f64(config.control_timeout_stop);
    let reset_interval = Duration::from_secs_f64(config.time_between_reset_attempts);
    let touch_interval = Duration::from_secs_f64(config.file_touch_interval);
    let loop_interval = Duration::from_secs_f64(config.loop_min_interval);

    let mut last_reset_attempt: Option<Instant> = None;
    let mut last_touch: Option<Instant> = None;

    // transition latches, so recurring conditions are logged and acted on
    // once instead of every fifty milliseconds
    let mut estop_was_needed = false;
    let mut link_was_healthy = true;
    let mut client_stopped = false;
    let mut timeout_stopped = false;
    let mut timeout_braked = false;
    let mut stop_error_logged = false;
    let mut tick_error_logged = false;
    let mut beacon_error_logged = false;

    while run_state.status() != State::Quit {
        // sensors first, then the checker over what they saw
        let estop_needed = robot.run_safety_check();
        if estop_needed {
            if !estop_was_needed {
                let _ = log.warn("safety checker demands an emergency stop");
            }
            // keep commanding the stop for as long as the condition holds
            match robot.driver.stop(&robot.link) {
                Ok(()) => stop_error_logged = false,
                Err(e) => {
                    if !stop_error_logged {
                        let _ = log.warn(&format!("failed to send safety stop: {e}"));
                        stop_error_logged = true;
                    }
                }
            }
        } else if estop_was_needed {
            let _ = log.info("safety estop condition cleared");
        }
        estop_was_needed = estop_needed;

        // link health, with throttled recovery
        let link_healthy = robot.link.is_healthy();
        if link_healthy {
            if !link_was_healthy {
                let _ = log.info("microcontroller link is healthy again");
            }
        } else {
            if link_was_healthy {
                let _ = log.warn("microcontroller link has gone quiet");
            }
            let reset_due = last_reset_attempt.map_or(true, |t| t.elapsed() >= reset_interval);
            if reset_due {
                last_reset_attempt = Some(Instant::now());
                match robot.reinit_link() {
                    Ok(()) => {
                        let _ = log.debug("reopened the microcontroller link");
                    }
                    Err(e) => {
                        let _ = log.warn(&format!("link reset failed: {e}"));
                    }
                }
            }
        }
        link_was_healthy = link_healthy;

        // client and control liveness
        let estopped = robot.link.is_estopped();
        if robot.request_age() > client_timeout {
            if !client_stopped {
                let _ = log.warn("no client request within the timeout; stopping");
                if robot.driver.stop(&robot.link).is_ok() {
                    client_stopped = true;
                }
            }
        } else {
            client_stopped = false;
            let control_age = robot.control_age();
            if control_age > stop_timeout && !estopped {
                if !timeout_stopped {
                    let _ = log.warn("no control command for too long; stopping");
                    if robot.driver.stop(&robot.link).is_ok() {
                        timeout_stopped = true;
                    }
                }
            } else if control_age > brake_timeout && !robot.driver.is_braking() && !estopped {
                if !timeout_braked {
                    let _ = log.info("no recent control command; braking");
                    timeout_braked = true;
                }
                if let Err(e) = robot.driver.brake(config.timeout_brake_speed) {
                    let _ = log.warn(&format!("timeout braking failed: {e}"));
                }
            }
            if control_age <= brake_timeout {
                timeout_stopped = false;
                timeout_braked = false;
            }
        }

        // the external watchdog kills us if this file goes stale
        let touch_due = last_touch.map_or(true, |t| t.elapsed() >= touch_interval);
        if touch_due {
            match File::create(&config.file_touch_path) {
                Ok(_) => {
                    last_touch = Some(Instant::now());
                    beacon_error_logged = false;
                }
                Err(e) => {
                    if !beacon_error_logged {
                        let _ = log.warn(&format!(
                            "failed to touch {}: {e}",
                            config.file_touch_path
                        ));
                        beacon_error_logged = true;
                    }
                }
            }
        }

        // walk the sent speeds toward the targets; must come after the
        // safety check so an estop is on the wire before the next V frame
        match robot.driver.tick(&robot.link) {
            Ok(_) => tick_error_logged = false,
            Err(e) => {
                if !tick_error_logged {
                    let _ = log.warn(&format!("driver tick failed: {e}"));
                    tick_error_logged = true;
                }
            }
        }

        sleep(loop_interval);
    }
}

#[cfg(test)]
mod tests {
    use std::thread::scope;

    use super::*;
    use crate::{
        config::Configuration,
        driver::Motor,
        link::{self, StubLine},
    };

    /// A link maker which hands out clones of one stub line.
    struct StubMaker {
        line: StubLine,
    }

    impl MakeLink for StubMaker {
        type Port = StubLine;

        fn open(&self, _: &Configuration) -> Result<(StubLine, StubLine), link::Error> {
            Ok((self.line.clone(), self.line.clone()))
        }
    }

    /// Build a robot over a stub line with the given configuration and a
    /// healthy, non-estopped link.
    fn stub_robot(config: Configuration) -> (Robot<StubMaker>, StubLine) {
        let line = StubLine::default();
        let stub = line.clone();
        let robot = Robot::new(StubMaker { line }, config).unwrap();
        stub.push_line("C:1;B:0;L:0;E:0;!BV:512;");
        assert!(robot.link.poll(Duration::from_millis(100)).unwrap());
        (robot, stub)
    }

    /// Run the supervisor against `robot` for `millis` milliseconds.
    fn run_for<M: MakeLink + Sync>(robot: &Robot<M>, millis: u64) {
        let log = UserLog::new(Vec::<u8>::new());
        let run_state = Guard::new();
        scope(|s| {
            s.spawn(|| supervise(robot, &log, &run_state));
            sleep(Duration::from_millis(millis));
            assert!(run_state.quit());
        });
    }

    /// A beacon path unique to this test process.
    fn beacon_path(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("waddle-test-{tag}-{}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    /// Test that a sensor past its estop threshold gets the robot stopped.
    fn safety_estop_stops_robot() {
        let (robot, stub) = stub_robot(Configuration::default());

        // 250 counts of driver temperature is about 72 C
        stub.push_line("C:2;B:0;L:0;E:0;!DT:250;");
        assert!(robot.link.poll(Duration::from_millis(100)).unwrap());

        run_for(&robot, 200);
        assert!(stub.commands().contains(&"X".to_string()));
    }

    #[test]
    /// Test that a vanished client gets the robot stopped even though the
    /// driver still has a target.
    fn client_timeout_stops_robot() {
        let config = Configuration {
            client_timeout: 0.05,
            ..Configuration::default()
        };
        let (robot, stub) = stub_robot(config);

        robot.acquire_control(1).unwrap();
        robot.set_speed(1, 50.0, Motor::Both).unwrap();

        run_for(&robot, 300);

        assert!(stub.commands().contains(&"X".to_string()));
        assert_eq!(robot.driver.get_speed(Motor::Both), vec![0.0, 0.0]);
        // stopped means no more V frames after the X
        let commands = stub.commands();
        let last_x = commands.iter().rposition(|c| c == "X").unwrap();
        assert!(commands[last_x..].iter().all(|c| !c.starts_with('V')));
    }

    #[test]
    /// Test that control silence first brakes the robot.
    fn control_timeout_brakes_robot() {
        let config = Configuration {
            control_timeout_brake: 0.05,
            ..Configuration::default()
        };
        let (robot, _stub) = stub_robot(config);

        run_for(&robot, 300);
        assert!(robot.driver.is_braking());
    }

    #[test]
    /// Test that the liveness beacon file is created for the external
    /// watchdog.
    fn beacon_touched() {
        let path = beacon_path("beacon");
        let config = Configuration {
            file_touch_path: path.clone(),
            file_touch_interval: 0.05,
            ..Configuration::default()
        };
        let (robot, _stub) = stub_robot(config);

        run_for(&robot, 200);

        assert!(std::path::Path::new(&path).exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    /// Test that an unhealthy link is reset, and not more often than the
    /// throttle allows.
    fn unhealthy_link_reset_throttled() {
        let config = Configuration {
            time_between_reset_attempts: 0.2,
            ..Configuration::default()
        };
        let line = StubLine::default();
        let stub = line.clone();
        // never fed a frame: unhealthy from the start
        let robot = Robot::new(StubMaker { line }, config).unwrap();

        run_for(&robot, 300);

        // each reset attempt stops the driver; six loop iterations fit in
        // 300 ms, but the 200 ms throttle leaves room for only a couple
        let stops = stub.commands().iter().filter(|c| *c == "X").count();
        assert!(stops >= 1, "no reset was attempted");
        assert!(stops <= 3, "reset attempts were not throttled: {stops}");
    }
}
