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

//! The network front end: accept clients, parse their requests, run them
//! against the robot, and reply.
//!
//! Also home to the link makers: the real serial device for the Sabertooth
//! path, and an inert stub for running the server with no robot attached.

use std::{
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream},
    thread::sleep,
    time::Duration,
};

use serialport::{DataBits, Parity, StopBits};

use crate::{
    config::Configuration,
    console::UserLog,
    driver,
    incoming::Request,
    link::{self, StubLine},
    outgoing::{send_reply, Tag},
    robot::{self, MakeLink, Robot},
    state::{Guard, State},
    supervisor, ControllerError,
};

/// Timeout for buffered serial I/O on the writer half.
const IO_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout on the reader half; the link poller loops on this.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// How long a blocked client read waits before rechecking the run state.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// How long the accept loop naps when no client is waiting.
const ACCEPT_PAUSE: Duration = Duration::from_millis(100);

/// The real link maker: a Sabertooth motor controller behind the on-board
/// microcontroller on a serial device.
pub struct Sabertooth {
    /// Path to the serial device, e.g. `/dev/ttyACM0`.
    pub device: String,
}

impl MakeLink for Sabertooth {
    type Port = Box<dyn serialport::SerialPort>;

    fn open(&self, config: &Configuration) -> Result<(Self::Port, Self::Port), link::Error> {
        let reader = serialport::new(self.device.as_str(), config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|e| link::Error::Failure(e.into()))?;

        let mut writer = reader
            .try_clone()
            .map_err(|e| link::Error::Failure(e.into()))?;
        writer
            .set_timeout(IO_TIMEOUT)
            .map_err(|e| link::Error::Failure(e.into()))?;

        Ok((reader, writer))
    }
}

/// A link maker for running without hardware: the "microcontroller" never
/// says anything, so the link reports unhealthy and estopped, but every code
/// path can be exercised.
pub struct Dummy;

impl MakeLink for Dummy {
    type Port = StubLine;

    fn open(&self, _: &Configuration) -> Result<(StubLine, StubLine), link::Error> {
        Ok(StubLine::pair())
    }
}

/// The primary run function for the `waddle` server.
///
/// Builds the robot over `maker`'s link, spawns the link monitor and the
/// supervisor, and then accepts clients on `listener` until one of them asks
/// for a shutdown. One thread serves each client.
///
/// # Errors
///
/// This function can return any of the possible errors in `ControllerError`.
pub fn run<M: MakeLink + Sync>(
    maker: M,
    config: Configuration,
    log: &UserLog<impl Write + Send>,
    listener: TcpListener,
) -> Result<(), ControllerError> {
    let robot = Robot::new(maker, config).map_err(ControllerError::Link)?;
    let robot_ref = &robot;
    let run_state = Guard::new();
    let run_state_ref = &run_state;

    listener.set_nonblocking(true)?;
    log.info(&format!("listening on {}", listener.local_addr()?))?;

    std::thread::scope(|s| {
        s.spawn(move || link::heartbeat(&robot_ref.link, run_state_ref, log));
        s.spawn(move || supervisor::supervise(robot_ref, log, run_state_ref));

        let mut next_session: u64 = 0;

        while run_state.status() == State::Running {
            match listener.accept() {
                Ok((stream, peer)) => {
                    next_session += 1;
                    let session = next_session;
                    let _ = log.info(&format!("accepted client {session} from {peer}"));

                    s.spawn(move || {
                        if let Err(e) =
                            handle_client(stream, robot_ref, log, run_state_ref, session)
                        {
                            let _ = log.warn(&format!("client {session} handler failed: {e}"));
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => sleep(ACCEPT_PAUSE),
                Err(e) => {
                    let _ = log.warn(&format!("failed to accept client: {e}"));
                    sleep(ACCEPT_PAUSE);
                }
            }
        }
    });

    log.info("shut down cleanly")?;
    Ok(())
}

/// Serve one client connection until it exits, disconnects, or the server
/// shuts down. On the way out the session's controller lease is released,
/// stopping the robot if the lease was held.
fn handle_client<M: MakeLink>(
    mut stream: TcpStream,
    robot: &Robot<M>,
    log: &UserLog<impl Write>,
    run_state: &Guard,
    session: u64,
) -> Result<(), ControllerError> {
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let result = serve(&mut reader, &mut stream, robot, log, run_state, session);

    // a controlling client that went away must not leave the robot rolling
    if let Err(e) = robot.end_session(session) {
        let _ = log.warn(&format!("failed to stop after client {session} left: {e}"));
    }
    let _ = log.info(&format!("client {session} disconnected"));

    result
}

/// The request/reply loop for one client.
fn serve<M: MakeLink>(
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    robot: &Robot<M>,
    log: &UserLog<impl Write>,
    run_state: &Guard,
    session: u64,
) -> Result<(), ControllerError> {
    // raw bytes, not a String: a read timeout mid-line must not throw away
    // the half-request already received
    let mut line = Vec::new();

    while run_state.status() == State::Running {
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                robot.touch_request();
                let text = String::from_utf8_lossy(&line).into_owned();
                let done = respond(&text, writer, robot, log, run_state, session)?;
                line.clear();
                if done {
                    break;
                }
            }
            // timed out waiting for a request; recheck the run state and
            // keep any partial line for the next round
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(ControllerError::Io(e)),
        }
    }

    Ok(())
}

/// Execute one request line and write the reply.
/// Returns whether the connection should close.
fn respond<M: MakeLink>(
    line: &str,
    writer: &mut impl Write,
    robot: &Robot<M>,
    log: &UserLog<impl Write>,
    run_state: &Guard,
    session: u64,
) -> Result<bool, ControllerError> {
    let request = match Request::parse(line) {
        Ok(request) => request,
        Err(e) => {
            send_reply(writer, Tag::Invalid, &e.to_string())?;
            return Ok(false);
        }
    };

    match request {
        Request::Blank => send_reply(writer, Tag::Ok, "")?,
        Request::Exit => {
            send_reply(writer, Tag::Ok, "done")?;
            return Ok(true);
        }
        Request::Shutdown => {
            send_reply(writer, Tag::Ok, "shutting down")?;
            let _ = log.info(&format!("client {session} requested shutdown"));
            run_state.quit();
            return Ok(true);
        }
        Request::Control => {
            reply_outcome(writer, robot.acquire_control(session), "control acquired")?;
        }
        Request::Status => send_reply(writer, Tag::Ok, &robot.status())?,
        Request::Go => reply_outcome(writer, robot.go(session), "emergency stop cleared")?,
        Request::Stop => reply_outcome(writer, robot.stop(session), "robot stopped")?,
        Request::Reset => reply_outcome(writer, robot.reset(session), "link reset successful")?,
        Request::Brake(speed) => {
            reply_outcome(writer, robot.brake(session, speed), "braking initiated")?;
        }
        Request::SetSpeed {
            motor,
            speed: Some(speed),
        } => match robot.set_speed(session, speed, motor) {
            Ok(()) => send_reply(writer, Tag::Ok, &format!("speed set to {speed}"))?,
            Err(e) => send_error(writer, &e)?,
        },
        Request::SetSpeed { motor, speed: None } => {
            let text = robot
                .driver
                .get_speed(motor)
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            send_reply(writer, Tag::Ok, &text)?;
        }
    }

    Ok(false)
}

/// Reply `ok` with `success`, or map the error to its tag.
fn reply_outcome(
    writer: &mut impl Write,
    result: Result<(), robot::Error>,
    success: &str,
) -> std::io::Result<()> {
    match result {
        Ok(()) => send_reply(writer, Tag::Ok, success),
        Err(e) => send_error(writer, &e),
    }
}

/// Write the reply for a failed operation. Refusals the client can fix are
/// `invalid`; breakage on our side is `error`.
fn send_error(writer: &mut impl Write, error: &robot::Error) -> std::io::Result<()> {
    let tag = match error {
        robot::Error::Unauthorized
        | robot::Error::Driver(driver::Error::Parameter(_) | driver::Error::Stopped) => {
            Tag::Invalid
        }
        _ => Tag::Error,
    };
    send_reply(writer, tag, &error.to_string())
}
