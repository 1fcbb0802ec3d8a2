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

//! Specification of "outbound" parts of the client API: replies and the
//! aggregated status snapshot.
//!
//! Every reply is a serialized `(tag, payload)` pair, preceded by its byte
//! length in decimal ASCII on its own line. The tag says how the request
//! fared; the payload is whatever the request asked for.

use std::io::Write;

use serde::Serialize;

use crate::{driver::DriverStatus, link::LinkStatus, safety::Alerts, sensors::SensorStatus};

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// The outcome tag of a reply.
pub enum Tag {
    /// The request was executed.
    Ok,
    /// The request was understood but refused.
    Invalid,
    /// Something went wrong executing the request.
    Error,
}

#[derive(Serialize, Debug, PartialEq)]
/// The single aggregated status snapshot, covering every component.
pub struct Status {
    /// The speed controller's state.
    pub driver: DriverStatus,
    /// The serial link's condition.
    pub arduino: LinkStatus,
    /// Supervisor liveness ages and alert flags.
    pub monitor: MonitorStatus,
    /// One entry per sensor.
    pub sensors: Vec<SensorStatus>,
}

#[derive(Serialize, Debug, PartialEq)]
/// Liveness ages and alerts, as watched by the supervisor.
pub struct MonitorStatus {
    /// Seconds since the last client request, to one decimal.
    pub client_age: f64,
    /// Seconds since the last successful control command, to one decimal.
    pub control_age: f64,
    /// The current safety alert flags.
    pub alerts: Alerts,
}

/// Write one length-prefixed reply to `writer` and flush it.
///
/// # Errors
///
/// This function will return an `Err` if serialization fails or the
/// underlying write does.
pub fn send_reply<T: Serialize + ?Sized>(
    writer: &mut impl Write,
    tag: Tag,
    payload: &T,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(&(tag, payload))?;
    writeln!(writer, "{}", body.len())?;
    writer.write_all(&body)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    /// Test that a reply is exactly the announced number of bytes and
    /// decodes to the tag/payload pair.
    fn reply_length_prefix() {
        let mut buffer = Vec::new();
        send_reply(&mut buffer, Tag::Ok, "done").unwrap();

        let newline = buffer.iter().position(|&b| b == b'\n').unwrap();
        let length: usize = String::from_utf8_lossy(&buffer[..newline])
            .parse()
            .unwrap();
        let body = &buffer[newline + 1..];
        assert_eq!(body.len(), length);

        let value: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value, serde_json::json!(["ok", "done"]));
    }

    #[test]
    /// Test that the refusal tags serialize to their wire names.
    fn tag_names() {
        assert_eq!(serde_json::to_value(Tag::Invalid).unwrap(), "invalid");
        assert_eq!(serde_json::to_value(Tag::Error).unwrap(), "error");
    }

    #[test]
    /// Test that a status snapshot serializes with the section names clients
    /// expect.
    fn serialize_status() {
        let status = Status {
            driver: DriverStatus {
                target_left: 10.0,
                target_right: 10.0,
                last_left: 6.0,
                last_right: 6.0,
                braking_speed: 0.0,
                seconds_since_update: Some(0.1),
            },
            arduino: LinkStatus {
                healthy: true,
                estop: false,
                commands_sent: 4,
                commands_received: 3,
                bad_commands_received: 0,
                bad_frames: 1,
                ms_since_command: 17,
            },
            monitor: MonitorStatus {
                client_age: 0.2,
                control_age: 1.5,
                alerts: Alerts::default(),
            },
            sensors: vec![SensorStatus {
                name: "Battery voltage".into(),
                value: Some(24.1),
                units: "V".into(),
            }],
        };

        let value = serde_json::to_value(&status).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("driver"));
        assert!(object.contains_key("arduino"));
        assert!(object.contains_key("monitor"));
        assert_eq!(value["driver"]["target_left"], 10.0);
        assert_eq!(value["arduino"]["healthy"], true);
        assert_eq!(value["monitor"]["alerts"]["battery_estop"], false);
        assert_eq!(value["sensors"][0]["units"], "V");
    }
}
