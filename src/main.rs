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

use std::{
    fs::File,
    io::BufReader,
    net::TcpListener,
    path::PathBuf,
};

use clap::{Parser, ValueEnum};

use waddle::{
    config::Configuration,
    console::UserLog,
    server::{run, Dummy, Sabertooth},
    ControllerError,
};

#[derive(Parser)]
#[command(about = "Control server for the waddle robot")]
/// Command-line arguments for the `waddle` server.
struct Args {
    /// Host or address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on.
    #[arg(long, default_value_t = 9999)]
    port: u16,
    /// Serial device of the on-board microcontroller.
    #[arg(long)]
    arduino: Option<String>,
    /// Which link backend to drive with.
    #[arg(long, value_enum, default_value = "stub")]
    driver: DriverKind,
    /// Path to a configuration JSON file; stock parameters when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Path of the console log file.
    #[arg(long, default_value = "waddle-log.txt")]
    log: PathBuf,
}

#[derive(ValueEnum, Clone, Copy)]
/// The available link backends.
enum DriverKind {
    /// The Sabertooth motor controller via the on-board microcontroller.
    Sabertooth,
    /// An inert stub, for running without hardware.
    Stub,
}

/// The main function for the `waddle` server.
///
/// Returns nonzero if the configuration, log file, serial device, or
/// listening socket could not be set up; once serving, runs until a client
/// requests a shutdown.
fn main() -> Result<(), ControllerError> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let file = File::open(path)?;
            Configuration::parse(&mut BufReader::new(file))?
        }
        None => Configuration::default(),
    };

    let log_file = File::options().create(true).append(true).open(&args.log)?;
    let log = UserLog::new(log_file);

    let listener = TcpListener::bind((args.host.as_str(), args.port))?;

    match args.driver {
        DriverKind::Sabertooth => {
            let device = args
                .arduino
                .ok_or(ControllerError::Args(
                    "--driver sabertooth requires --arduino <serial device>",
                ))?;
            run(Sabertooth { device }, config, &log, listener)
        }
        DriverKind::Stub => {
            log.warn("running with a stub link; no robot is attached")?;
            run(Dummy, config, &log, listener)
        }
    }
}
