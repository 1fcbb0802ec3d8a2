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

//! The serial link to the on-board microcontroller.
//!
//! The microcontroller owns the motor controller and the raw sensors. We talk
//! to it with short newline-terminated ASCII commands, and it talks back with
//! unsolicited state frames:
//!
//! ```text
//! C:12;B:0;L:5;E:0;!BV:512;DT:260;\n
//! ```
//!
//! Everything before the `!` describes the microcontroller's own state, and
//! everything after it is a raw sensor reading. Frames that do not follow the
//! grammar are counted and dropped; the microcontroller firmware is not above
//! garbling a line when it gets busy.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Display,
    io::{Read, Write},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    console::UserLog,
    state::{Guard, State},
};

/// Commands block this long waiting for the write lock before giving up.
const COMMAND_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
/// Heartbeats are more patient than commands; a missed heartbeat trips the
/// microcontroller's own estop.
const HEARTBEAT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// The link is unhealthy if no valid frame arrived within this long.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
/// The period between heartbeat commands, which is also the poll granularity
/// of the link monitor loop.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);

/// A byte-oriented line to the microcontroller.
///
/// This exists so that the rest of the controller can be tested against an
/// in-memory double instead of a physical serial device.
pub trait SerialLine: Read + Write + Send {}

impl<T: Read + Write + Send> SerialLine for T {}

#[derive(Clone, Debug, PartialEq, Eq)]
/// The most recently decoded microcontroller state frame.
pub struct LinkState {
    /// When the frame was decoded. Monotonically non-decreasing across
    /// installed frames, since frames are installed by a single poller in
    /// arrival order.
    pub timestamp: Instant,
    /// How many commands the microcontroller says it has received.
    pub commands_received: u64,
    /// How many commands the microcontroller could not make sense of.
    pub bad_commands_received: u64,
    /// Milliseconds the microcontroller has been waiting for a command.
    pub ms_since_command_received: u64,
    /// Whether the motor controller is in emergency stop.
    pub emergency_stop: bool,
}

#[derive(Clone, Debug)]
/// One raw reading from a named sensor channel, as reported in a state frame.
pub struct SensorReading {
    /// When the reading was decoded.
    pub timestamp: Instant,
    /// The raw integer value on the channel.
    pub value: i64,
}

#[derive(Debug)]
/// The ways in which talking on the link can fail.
pub enum Error {
    /// The write lock could not be acquired in time.
    /// Somebody else is hogging the serial line.
    Busy,
    /// An I/O error on the serial device.
    /// The link is likely gone and needs a reset.
    Failure(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Failure(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Busy => write!(f, "timed out waiting for the serial write lock"),
            Error::Failure(e) => write!(f, "serial I/O failed: {e}"),
        }
    }
}

#[derive(Serialize, Debug, PartialEq, Eq)]
/// A serializable summary of the link's condition, reported to clients.
pub struct LinkStatus {
    /// Whether a valid frame arrived recently.
    pub healthy: bool,
    /// Whether the motor controller reports emergency stop.
    /// `true` when no frame has been received at all: an unheard-from
    /// controller is assumed stopped.
    pub estop: bool,
    /// Commands we have written to the line.
    pub commands_sent: u64,
    /// Commands the microcontroller says it has received.
    pub commands_received: u64,
    /// Commands the microcontroller says it could not parse.
    pub bad_commands_received: u64,
    /// Frames we could not parse.
    pub bad_frames: u64,
    /// Milliseconds the microcontroller has been waiting for a command.
    pub ms_since_command: u64,
}

/// The serial link to the microcontroller.
///
/// The reader half is only ever touched by the link monitor thread via
/// [`Link::poll`]; the writer half is shared by everyone who wants to send a
/// command and is guarded by a bounded-wait lock.
pub struct Link<P: SerialLine> {
    /// The reader half of the line, plus a partial-line accumulator.
    reader: Mutex<LineReader<P>>,
    /// The writer half of the line.
    writer: Mutex<P>,
    /// The latest decoded state frame, replaced atomically on each parse.
    state: RwLock<Option<LinkState>>,
    /// Latest-wins raw readings per sensor name.
    readings: RwLock<HashMap<String, SensorReading>>,
    /// How many commands we have written.
    commands_sent: AtomicU64,
    /// How many inbound lines we have discarded.
    bad_frames: AtomicU64,
}

impl<P: SerialLine> Link<P> {
    /// Construct a link over an already-opened reader/writer pair.
    /// The two halves should be handles onto the same underlying device.
    pub fn new(reader: P, writer: P) -> Link<P> {
        Link {
            reader: Mutex::new(LineReader::new(reader)),
            writer: Mutex::new(writer),
            state: RwLock::new(None),
            readings: RwLock::new(HashMap::new()),
            commands_sent: AtomicU64::new(0),
            bad_frames: AtomicU64::new(0),
        }
    }

    /// Send a command to the microcontroller.
    /// A trailing newline is added if `command` does not already end with one.
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` if the write lock could not be acquired within
    /// two seconds, and `Error::Failure` if writing to the device failed.
    pub fn send(&self, command: &str) -> Result<(), Error> {
        self.send_with_timeout(command, COMMAND_LOCK_TIMEOUT)
    }

    /// As [`Link::send`], but with a caller-chosen bound on the lock wait.
    fn send_with_timeout(&self, command: &str, lock_timeout: Duration) -> Result<(), Error> {
        let mut port = acquire(&self.writer, lock_timeout).ok_or(Error::Busy)?;

        port.write_all(command.as_bytes())?;
        if !command.ends_with('\n') {
            port.write_all(b"\n")?;
        }
        port.flush()?;
        self.commands_sent.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Wait up to `timeout` for a line from the microcontroller and try to
    /// decode it. On success the new state and sensor readings are installed.
    ///
    /// Returns `Ok(true)` if a frame was installed, `Ok(false)` if no data
    /// arrived or the line was discarded as malformed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Failure` if reading from the device failed outright.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn poll(&self, timeout: Duration) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        let mut reader = self.reader.lock().unwrap();

        loop {
            match reader.read_line()? {
                Some(line) => {
                    let Some(frame) = parse_frame(&line) else {
                        self.bad_frames.fetch_add(1, Ordering::Relaxed);
                        return Ok(false);
                    };

                    let timestamp = Instant::now();
                    *self.state.write().unwrap() = Some(LinkState {
                        timestamp,
                        commands_received: frame.commands_received,
                        bad_commands_received: frame.bad_commands_received,
                        ms_since_command_received: frame.ms_since_command,
                        emergency_stop: frame.emergency_stop,
                    });

                    let mut readings = self.readings.write().unwrap();
                    for (name, value) in frame.sensors {
                        readings.insert(name, SensorReading { timestamp, value });
                    }

                    return Ok(true);
                }
                None => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    // the device-level read timeout may be shorter than ours
                    sleep(Duration::from_millis(5));
                }
            }
        }
    }

    #[must_use]
    /// Whether a valid frame arrived within the last two seconds.
    /// This is the single signal for link loss.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn is_healthy(&self) -> bool {
        match *self.state.read().unwrap() {
            Some(ref state) => state.timestamp.elapsed() < HEALTH_TIMEOUT,
            None => false,
        }
    }

    #[must_use]
    /// Get a copy of the latest decoded state frame, if any has arrived.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn get_state(&self) -> Option<LinkState> {
        self.state.read().unwrap().clone()
    }

    #[must_use]
    /// Whether the motor controller currently reports an emergency stop.
    /// An unheard-from controller is assumed stopped.
    pub fn is_estopped(&self) -> bool {
        self.get_state().map_or(true, |s| s.emergency_stop)
    }

    #[must_use]
    /// Get the latest raw reading for the sensor channel `name`, if the
    /// microcontroller has ever reported one.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn sensor_reading(&self, name: &str) -> Option<SensorReading> {
        self.readings.read().unwrap().get(name).cloned()
    }

    /// Replace both halves of the serial line with freshly-opened ones,
    /// discarding the stale state frame. Used when resetting a dead link; the
    /// monitor thread and every component handle stay valid across the swap.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn reinstall(&self, reader: P, writer: P) {
        // take the writer first so no command lands on the dying port
        let mut writer_guard = self.writer.lock().unwrap();
        let mut reader_guard = self.reader.lock().unwrap();
        *writer_guard = writer;
        *reader_guard = LineReader::new(reader);
        *self.state.write().unwrap() = None;
    }

    #[must_use]
    /// Summarize the link's condition for the status report.
    pub fn status(&self) -> LinkStatus {
        let state = self.get_state();
        LinkStatus {
            healthy: self.is_healthy(),
            estop: state.as_ref().map_or(true, |s| s.emergency_stop),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_received: state.as_ref().map_or(0, |s| s.commands_received),
            bad_commands_received: state.as_ref().map_or(0, |s| s.bad_commands_received),
            bad_frames: self.bad_frames.load(Ordering::Relaxed),
            ms_since_command: state.as_ref().map_or(0, |s| s.ms_since_command_received),
        }
    }
}

/// The monitor loop for the link: poll for state frames, and keep the
/// microcontroller fed with heartbeats so it does not trip its own estop out
/// of loneliness. Runs until `state` reads `Quit`.
///
/// Send failures are logged on the first occurrence and then suppressed until
/// the line recovers; the supervisor notices the unhealthy link and resets it.
pub fn heartbeat<P: SerialLine>(link: &Link<P>, state: &Guard, log: &UserLog<impl Write>) {
    let mut last_heartbeat: Option<Instant> = None;
    let mut log_send_failure = true;

    while state.status() != State::Quit {
        if let Err(e) = link.poll(HEARTBEAT_PERIOD) {
            if log_send_failure {
                let _ = log.warn(&format!("failed to poll the microcontroller: {e}"));
                log_send_failure = false;
            }
        }

        let due = last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT_PERIOD);
        if due {
            match link.send_with_timeout("H", HEARTBEAT_LOCK_TIMEOUT) {
                Ok(()) => {
                    last_heartbeat = Some(Instant::now());
                    log_send_failure = true;
                }
                Err(e) => {
                    if log_send_failure {
                        let _ = log.warn(&format!("failed to send heartbeat: {e}"));
                        log_send_failure = false;
                    }
                }
            }
        }
    }
}

/// Acquire `lock` with a bounded wait, polling `try_lock` until `timeout`
/// expires. Returns `None` on timeout or if the lock is poisoned.
fn acquire<T>(lock: &Mutex<T>, timeout: Duration) -> Option<MutexGuard<'_, T>> {
    if let Ok(guard) = lock.try_lock() {
        return Some(guard);
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        sleep(Duration::from_millis(50));
        if let Ok(guard) = lock.try_lock() {
            return Some(guard);
        }
    }

    None
}

/// A decoded state frame, before timestamping.
struct ParsedFrame {
    commands_received: u64,
    bad_commands_received: u64,
    ms_since_command: u64,
    emergency_stop: bool,
    sensors: Vec<(String, i64)>,
}

/// Decode one line into a frame.
///
/// The line must contain exactly one `!`, and both the state section and the
/// sensor section must be a nonempty run of `key:value;` fields, each
/// terminated by `;`. Returns `None` for anything else.
fn parse_frame(line: &str) -> Option<ParsedFrame> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut sections = line.split('!');
    let state_section = sections.next()?;
    let sensor_section = sections.next()?;
    if sections.next().is_some() {
        return None;
    }

    let state_fields = parse_fields(state_section)?;
    let sensor_fields = parse_fields(sensor_section)?;

    let mut commands_received = None;
    let mut bad_commands_received = None;
    let mut ms_since_command = None;
    let mut emergency_stop = None;
    for (key, value) in state_fields {
        match key.as_str() {
            "C" => commands_received = u64::try_from(value).ok(),
            "B" => bad_commands_received = u64::try_from(value).ok(),
            "L" => ms_since_command = u64::try_from(value).ok(),
            "E" => {
                emergency_stop = match value {
                    0 => Some(false),
                    1 => Some(true),
                    _ => None,
                }
            }
            // unknown state keys are tolerated for firmware compatibility
            _ => (),
        }
    }

    Some(ParsedFrame {
        commands_received: commands_received?,
        bad_commands_received: bad_commands_received?,
        ms_since_command: ms_since_command?,
        emergency_stop: emergency_stop?,
        sensors: sensor_fields,
    })
}

/// Split a frame section of the form `K:V;K:V;` into its fields.
/// Returns `None` if the section is empty, does not end with `;`, or any
/// field is not a `key:integer` pair.
fn parse_fields(section: &str) -> Option<Vec<(String, i64)>> {
    let body = section.strip_suffix(';')?;
    let mut fields = Vec::new();
    for field in body.split(';') {
        let (key, value) = field.split_once(':')?;
        if key.is_empty() {
            return None;
        }
        fields.push((key.to_string(), value.parse().ok()?));
    }
    Some(fields)
}

/// An in-memory serial line for testing and for running without hardware.
///
/// A `StubLine` reads from a shared byte queue and records everything written
/// to it. Cloned handles share the same buffers, which is how the reader and
/// writer halves of a stub link are made.
#[derive(Clone, Default)]
pub struct StubLine {
    /// Bytes waiting to be read.
    incoming: Arc<Mutex<VecDeque<u8>>>,
    /// Everything ever written.
    outgoing: Arc<Mutex<Vec<u8>>>,
}

impl StubLine {
    #[must_use]
    /// Construct a connected reader/writer pair sharing the same buffers.
    pub fn pair() -> (StubLine, StubLine) {
        let line = StubLine::default();
        (line.clone(), line)
    }

    /// Queue up `line` (plus a newline) for the next reads.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn push_line(&self, line: &str) {
        let mut incoming = self.incoming.lock().unwrap();
        incoming.extend(line.bytes());
        incoming.push_back(b'\n');
    }

    #[must_use]
    /// The commands written so far, split on newlines.
    ///
    /// # Panics
    ///
    /// This function will panic if an internal lock is poisoned.
    pub fn commands(&self) -> Vec<String> {
        let outgoing = self.outgoing.lock().unwrap();
        String::from_utf8_lossy(&outgoing)
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

impl Read for StubLine {
    /// Pop queued bytes, mimicking a serial read timeout when none are
    /// waiting.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut incoming = self.incoming.lock().unwrap();
        if incoming.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data on stub line",
            ));
        }

        let mut count = 0;
        while count < buf.len() {
            match incoming.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Write for StubLine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.outgoing.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A reader half plus an accumulator for bytes of a not-yet-complete line.
struct LineReader<P> {
    port: P,
    partial: Vec<u8>,
}

impl<P: Read> LineReader<P> {
    fn new(port: P) -> LineReader<P> {
        LineReader {
            port,
            partial: Vec::new(),
        }
    }

    /// Read until a newline or until the device-level timeout.
    /// Returns `Ok(None)` if a full line has not yet arrived; bytes read so
    /// far are kept for the next call.
    fn read_line(&mut self) -> Result<Option<String>, Error> {
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        let line = String::from_utf8_lossy(&self.partial).into_owned();
                        self.partial.clear();
                        return Ok(Some(line));
                    }
                    self.partial.push(byte[0]);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(Error::Failure(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread::scope;

    use super::*;

    /// Helper to build a link over a fresh stub pair, returning the stub
    /// handle for inspection alongside the link.
    fn stub_link() -> (Link<StubLine>, StubLine) {
        let (reader, writer) = StubLine::pair();
        let stub = reader.clone();
        (Link::new(reader, writer), stub)
    }

    #[test]
    /// Test that a well-formed frame decodes into the right state and sensor
    /// readings.
    fn frame_parse() {
        let frame = parse_frame("C:12;B:0;L:5;E:0;!BV:512;DT:260;").unwrap();
        assert_eq!(frame.commands_received, 12);
        assert_eq!(frame.bad_commands_received, 0);
        assert_eq!(frame.ms_since_command, 5);
        assert!(!frame.emergency_stop);
        assert_eq!(
            frame.sensors,
            vec![("BV".to_string(), 512), ("DT".to_string(), 260)]
        );
    }

    #[test]
    /// Test that a frame built from known fields parses back to exactly
    /// those fields.
    fn frame_round_trip() {
        let sensors: [(&str, i64); 3] = [("BV", 512), ("DT", 260), ("LE", 42)];
        let sensor_text: String = sensors.iter().map(|(k, v)| format!("{k}:{v};")).collect();
        let line = format!("C:7;B:2;L:130;E:1;!{sensor_text}");

        let frame = parse_frame(&line).unwrap();
        assert_eq!(frame.commands_received, 7);
        assert_eq!(frame.bad_commands_received, 2);
        assert_eq!(frame.ms_since_command, 130);
        assert!(frame.emergency_stop);
        assert_eq!(
            frame.sensors,
            sensors.map(|(k, v)| (k.to_string(), v)).to_vec()
        );
    }

    #[test]
    /// Test that a frame whose state section is missing its trailing
    /// semicolon is rejected.
    fn frame_missing_semicolon() {
        assert!(parse_frame("C:12;B:0;L:5;E:0!BV:512;").is_none());
    }

    #[test]
    /// Test that junk lines are rejected.
    fn frame_junk() {
        assert!(parse_frame("").is_none());
        assert!(parse_frame("!").is_none());
        assert!(parse_frame("C:12;!").is_none());
        assert!(parse_frame("C:12;B:0;L:5;E:0;!BV:512;!extra;").is_none());
        assert!(parse_frame("C:twelve;B:0;L:5;E:0;!BV:512;").is_none());
        assert!(parse_frame("C:12;B:0;L:5;E:7;!BV:512;").is_none());
    }

    #[test]
    /// Test that sending a command appends the newline and bumps the counter.
    fn send_appends_newline() {
        let (link, stub) = stub_link();
        link.send("X").unwrap();
        link.send("V10,12\n").unwrap();

        assert_eq!(stub.commands(), vec!["X", "V10,12"]);
        assert_eq!(link.status().commands_sent, 2);
    }

    #[test]
    /// Test that polling installs state and sensor readings, latest-wins.
    fn poll_installs_state() {
        let (link, stub) = stub_link();
        assert!(!link.is_healthy());

        stub.push_line("C:12;B:0;L:5;E:0;!BV:512;DT:260;");
        assert!(link.poll(Duration::from_millis(100)).unwrap());

        let state = link.get_state().unwrap();
        assert_eq!(state.commands_received, 12);
        assert!(!state.emergency_stop);
        assert!(link.is_healthy());
        assert!(!link.is_estopped());
        assert_eq!(link.sensor_reading("BV").unwrap().value, 512);
        assert_eq!(link.sensor_reading("DT").unwrap().value, 260);
        assert!(link.sensor_reading("LS").is_none());

        stub.push_line("C:13;B:0;L:2;E:1;!BV:500;");
        assert!(link.poll(Duration::from_millis(100)).unwrap());
        assert_eq!(link.sensor_reading("BV").unwrap().value, 500);
        assert_eq!(link.sensor_reading("DT").unwrap().value, 260);
        assert!(link.is_estopped());
    }

    #[test]
    /// Test that malformed lines are dropped and counted without disturbing
    /// the installed state.
    fn bad_frame_counted() {
        let (link, stub) = stub_link();
        stub.push_line("C:12;B:0;L:5;E:0;!BV:512;");
        assert!(link.poll(Duration::from_millis(100)).unwrap());

        stub.push_line("garbage in");
        assert!(!link.poll(Duration::from_millis(100)).unwrap());

        assert_eq!(link.status().bad_frames, 1);
        assert_eq!(link.get_state().unwrap().commands_received, 12);
    }

    #[test]
    /// Test that a reinstalled link forgets the old state frame.
    fn reinstall_clears_state() {
        let (link, stub) = stub_link();
        stub.push_line("C:12;B:0;L:5;E:0;!BV:512;");
        assert!(link.poll(Duration::from_millis(100)).unwrap());
        assert!(link.is_healthy());

        let (reader, writer) = StubLine::pair();
        link.reinstall(reader, writer);
        assert!(!link.is_healthy());
        assert!(link.get_state().is_none());
    }

    #[test]
    /// Test that the monitor loop keeps heartbeats flowing until told to
    /// quit.
    fn heartbeat_flows() {
        let (link, stub) = stub_link();
        let guard = Guard::new();
        let log = UserLog::new(Vec::<u8>::new());

        scope(|s| {
            s.spawn(|| heartbeat(&link, &guard, &log));

            sleep(Duration::from_millis(350));
            assert!(guard.quit());
        });

        let sent = stub.commands();
        assert!(sent.iter().all(|c| c == "H"));
        assert!(sent.len() >= 2);
    }
}
