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

//! The operator-facing log.
//!
//! Every line goes two places at once: styled to stdout for whoever is
//! watching the server run, and unstyled into a file for reading back after
//! something has already gone wrong. The supervisor, the link monitor, and
//! every client handler all log through one shared `UserLog`, so whole lines
//! are written under a lock and never interleave.

use std::{
    io::{self, Write},
    sync::Mutex,
};

use chrono::Local;

/// Timestamp layout shared by the console and the file copy.
const STAMP_FORMAT: &str = "%m-%d %H:%M:%S%.3f";

/// Clears any styling at the end of a console line.
const RESET: &str = "\x1b[0m";

#[derive(Clone, Copy)]
/// How loud a log line is.
enum Severity {
    Debug,
    Info,
    Warn,
    Critical,
}

impl Severity {
    /// The tag printed in front of the message.
    fn label(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Critical => "CRITICAL",
        }
    }

    /// ANSI styling for the console copy: dim for chatter, yellow for
    /// trouble brewing, bold red for trouble arrived, nothing for ordinary
    /// information.
    fn style(self) -> &'static str {
        match self {
            Severity::Debug => "\x1b[2m",
            Severity::Info => "",
            Severity::Warn => "\x1b[33m",
            Severity::Critical => "\x1b[1;31m",
        }
    }
}

/// A leveled log shared by every thread in the server.
pub struct UserLog<W: Write> {
    /// The file copy of the log.
    file: Mutex<W>,
}

impl<W: Write> UserLog<W> {
    /// Construct a log whose file copy is written to `file`.
    pub fn new(file: W) -> UserLog<W> {
        UserLog {
            file: Mutex::new(file),
        }
    }

    #[allow(clippy::missing_errors_doc)]
    /// Chatter for developers; operators can usually ignore it.
    pub fn debug(&self, message: &str) -> io::Result<()> {
        self.log(Severity::Debug, message)
    }

    #[allow(clippy::missing_errors_doc)]
    /// A routine event worth having on record.
    pub fn info(&self, message: &str) -> io::Result<()> {
        self.log(Severity::Info, message)
    }

    #[allow(clippy::missing_errors_doc)]
    /// Something is off, but the server can keep going.
    pub fn warn(&self, message: &str) -> io::Result<()> {
        self.log(Severity::Warn, message)
    }

    #[allow(clippy::missing_errors_doc)]
    /// The server cannot do its job.
    pub fn critical(&self, message: &str) -> io::Result<()> {
        self.log(Severity::Critical, message)
    }

    /// Write one line to both destinations.
    ///
    /// Console trouble is swallowed: losing colors on a dead terminal is not
    /// worth failing the caller over. The file copy is the record, so its
    /// failures are reported.
    ///
    /// # Errors
    ///
    /// Returns an error if the file copy cannot be written, or if the file
    /// lock was poisoned by a panicking thread.
    fn log(&self, severity: Severity, message: &str) -> io::Result<()> {
        let stamp = Local::now().format(STAMP_FORMAT);
        let label = severity.label();

        {
            let mut console = io::stdout().lock();
            let _ = writeln!(
                console,
                "{}[{stamp}] [{label}] {message}{RESET}",
                severity.style()
            );
        }

        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?;
        writeln!(file, "[{stamp}] [{label}] {message}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Test that the file copy carries the stamp bracket, the severity
    /// label, and the message, with no terminal styling mixed in.
    fn file_copy_is_plain() {
        let mut buffer = Vec::new();
        let log = UserLog::new(&mut buffer);
        log.warn("battery getting low").unwrap();
        log.info("battery recovered").unwrap();
        drop(log);

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("[WARN] battery getting low"));
        assert!(lines[1].ends_with("[INFO] battery recovered"));
        assert!(!text.contains('\x1b'));
    }
}
