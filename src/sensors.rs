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

//! Typed sensors derived from the microcontroller's raw channel values.
//!
//! The microcontroller reports bare integers. Each sensor here knows how to
//! turn the latest integer on its channel into a physical quantity: battery
//! volts through the divider ratio, TMP36 millivolts into degrees, sonar
//! inches as-is, and encoder pulse counts into a windowed RPM estimate.
//!
//! A sensor only consumes a reading once: a reading whose timestamp equals
//! the last one seen is a stale copy, not new information. When a channel has
//! no fresh reading, the derived value just sticks at whatever it was.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    config::Configuration,
    link::{Link, SerialLine},
    safety::SafetyInputs,
};

/// Volts per ADC count on the microcontroller's 10-bit, 5 V converter.
const ADC_VOLTS_PER_COUNT: f64 = 5.0 / 1023.0;

/// How many readings the smoothed analog sensors average over.
const SMOOTHING_SAMPLES: usize = 20;

#[derive(Serialize, Debug, PartialEq)]
/// One entry of the per-sensor status list sent to clients.
pub struct SensorStatus {
    /// The human-readable sensor name.
    pub name: String,
    /// The current derived value, if one has ever been computed.
    pub value: Option<f64>,
    /// The units of `value`.
    pub units: String,
}

/// A battery-voltage sensor behind a resistive divider.
pub struct VoltageSensor {
    key: &'static str,
    /// `(R1 + R2) / R2` for the divider feeding the ADC pin.
    ratio: f64,
    samples: VecDeque<f64>,
    value: Option<f64>,
    last_seen: Option<Instant>,
}

impl VoltageSensor {
    #[must_use]
    /// Construct a voltage sensor on channel `key` with divider resistances
    /// `r1` (top) and `r2` (bottom), in ohms.
    pub fn new(key: &'static str, r1: f64, r2: f64) -> VoltageSensor {
        VoltageSensor {
            key,
            ratio: (r1 + r2) / r2,
            samples: VecDeque::new(),
            value: None,
            last_seen: None,
        }
    }

    /// Pull the latest raw reading and refresh the running mean.
    pub fn read<P: SerialLine>(&mut self, link: &Link<P>) -> Option<f64> {
        if let Some(reading) = link.sensor_reading(self.key) {
            if self.last_seen != Some(reading.timestamp) {
                self.last_seen = Some(reading.timestamp);
                #[allow(clippy::cast_precision_loss)]
                let volts = reading.value as f64 * ADC_VOLTS_PER_COUNT * self.ratio;
                push_sample(&mut self.samples, volts);
                self.value = Some(mean(&self.samples));
            }
        }
        self.value
    }

    #[must_use]
    /// The smoothed voltage, if any reading has arrived.
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// A TMP36 temperature sensor on an ADC channel.
pub struct TemperatureSensor {
    key: &'static str,
    samples: VecDeque<f64>,
    value: Option<f64>,
    last_seen: Option<Instant>,
}

impl TemperatureSensor {
    #[must_use]
    /// Construct a temperature sensor on channel `key`.
    pub fn new(key: &'static str) -> TemperatureSensor {
        TemperatureSensor {
            key,
            samples: VecDeque::new(),
            value: None,
            last_seen: None,
        }
    }

    /// Pull the latest raw reading and refresh the running mean.
    pub fn read<P: SerialLine>(&mut self, link: &Link<P>) -> Option<f64> {
        if let Some(reading) = link.sensor_reading(self.key) {
            if self.last_seen != Some(reading.timestamp) {
                self.last_seen = Some(reading.timestamp);
                // TMP36: 500 mV offset, 10 mV per degree C
                #[allow(clippy::cast_precision_loss)]
                let millivolts = reading.value as f64 * ADC_VOLTS_PER_COUNT * 1000.0;
                let degrees = (millivolts - 500.0) / 10.0;
                push_sample(&mut self.samples, degrees);
                self.value = Some(mean(&self.samples));
            }
        }
        self.value
    }

    #[must_use]
    /// The smoothed temperature, if any reading has arrived.
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// An LV-MaxSonar rangefinder reporting integer inches.
pub struct Sonar {
    key: &'static str,
    value: Option<i64>,
    last_seen: Option<Instant>,
}

impl Sonar {
    #[must_use]
    /// Construct a sonar on channel `key`.
    pub fn new(key: &'static str) -> Sonar {
        Sonar {
            key,
            value: None,
            last_seen: None,
        }
    }

    /// Pull the latest distance. Sonar values are not smoothed; obstacles do
    /// not average.
    pub fn read<P: SerialLine>(&mut self, link: &Link<P>) -> Option<i64> {
        if let Some(reading) = link.sensor_reading(self.key) {
            if self.last_seen != Some(reading.timestamp) {
                self.last_seen = Some(reading.timestamp);
                self.value = Some(reading.value);
            }
        }
        self.value
    }

    #[must_use]
    /// The latest distance in inches, if any reading has arrived.
    pub fn value(&self) -> Option<i64> {
        self.value
    }
}

/// A hall-effect wheel encoder.
///
/// The microcontroller reports a pulse count which only ever grows; RPM is
/// the pulse delta across a trailing window. The counter is assumed to be at
/// least 64 bits wide and never to wrap; if narrower hardware counters wrap,
/// the delta saturates to zero for that window rather than exploding.
pub struct Encoder {
    key: &'static str,
    /// Magnets on the encoder ring, i.e. pulses per revolution.
    magnets: f64,
    window: Duration,
    readings: VecDeque<(Instant, u64)>,
    value: Option<f64>,
}

impl Encoder {
    #[must_use]
    /// Construct an encoder on channel `key` with `magnets` pulses per
    /// revolution, computing RPM over the trailing `window`.
    pub fn new(key: &'static str, magnets: u32, window: Duration) -> Encoder {
        Encoder {
            key,
            magnets: f64::from(magnets),
            window,
            readings: VecDeque::new(),
            value: None,
        }
    }

    /// Pull the latest pulse count and recompute the windowed RPM.
    pub fn read<P: SerialLine>(&mut self, link: &Link<P>) -> Option<f64> {
        if let Some(reading) = link.sensor_reading(self.key) {
            self.observe(reading.timestamp, reading.value);
        }
        self.update(Instant::now());
        self.value
    }

    /// Record a pulse-count observation if it is strictly newer than the most
    /// recent one already stored.
    fn observe(&mut self, timestamp: Instant, raw: i64) {
        let count = u64::try_from(raw).unwrap_or(0);
        let is_new = self
            .readings
            .back()
            .map_or(true, |&(last, _)| timestamp > last);
        if is_new {
            self.readings.push_back((timestamp, count));
        }
    }

    /// Drop observations older than the window and recompute RPM.
    fn update(&mut self, now: Instant) {
        while let Some(&(timestamp, _)) = self.readings.front() {
            if now.duration_since(timestamp) > self.window {
                self.readings.pop_front();
            } else {
                break;
            }
        }

        self.value = Some(if self.readings.len() < 2 {
            0.0
        } else {
            let &(first_time, first_count) = self.readings.front().unwrap();
            let &(last_time, last_count) = self.readings.back().unwrap();
            #[allow(clippy::cast_precision_loss)]
            let pulses = last_count.saturating_sub(first_count) as f64;
            let period = last_time.duration_since(first_time).as_secs_f64();
            (pulses / self.magnets) * (60.0 / period)
        });
    }

    #[must_use]
    /// The latest RPM estimate, if `read` has ever been called.
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// The robot's full set of sensors, keyed to the channels the
/// microcontroller firmware actually reports.
pub struct SensorSuite {
    battery: VoltageSensor,
    driver_temperature: TemperatureSensor,
    left_sonar: Sonar,
    right_sonar: Sonar,
    left_encoder: Encoder,
    right_encoder: Encoder,
}

impl SensorSuite {
    #[must_use]
    /// Construct the sensor suite described by `config`.
    pub fn new(config: &Configuration) -> SensorSuite {
        let window = Duration::from_secs_f64(config.encoder_window);
        SensorSuite {
            battery: VoltageSensor::new(
                "BV",
                config.battery_divider_r1,
                config.battery_divider_r2,
            ),
            driver_temperature: TemperatureSensor::new("DT"),
            left_sonar: Sonar::new("LS"),
            right_sonar: Sonar::new("RS"),
            left_encoder: Encoder::new("LE", config.encoder_magnets, window),
            right_encoder: Encoder::new("RE", config.encoder_magnets, window),
        }
    }

    /// Refresh every sensor from the link's latest readings.
    pub fn read_all<P: SerialLine>(&mut self, link: &Link<P>) {
        self.battery.read(link);
        self.driver_temperature.read(link);
        self.left_sonar.read(link);
        self.right_sonar.read(link);
        self.left_encoder.read(link);
        self.right_encoder.read(link);
    }

    #[must_use]
    /// The current derived values, packaged for the safety checker.
    pub fn safety_inputs(&self) -> SafetyInputs {
        SafetyInputs {
            driver_temperature: self.driver_temperature.value(),
            battery_voltage: self.battery.value(),
            sonar_distances: (self.left_sonar.value(), self.right_sonar.value()),
            encoder_rpms: (self.left_encoder.value(), self.right_encoder.value()),
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    /// The per-sensor status list for the client status report.
    pub fn statuses(&self) -> Vec<SensorStatus> {
        vec![
            SensorStatus {
                name: "Battery voltage".into(),
                value: self.battery.value(),
                units: "V".into(),
            },
            SensorStatus {
                name: "Driver temperature".into(),
                value: self.driver_temperature.value(),
                units: "C".into(),
            },
            SensorStatus {
                name: "Left sonar".into(),
                value: self.left_sonar.value().map(|v| v as f64),
                units: "\"".into(),
            },
            SensorStatus {
                name: "Right sonar".into(),
                value: self.right_sonar.value().map(|v| v as f64),
                units: "\"".into(),
            },
            SensorStatus {
                name: "Left encoder".into(),
                value: self.left_encoder.value(),
                units: "RPM".into(),
            },
            SensorStatus {
                name: "Right encoder".into(),
                value: self.right_encoder.value(),
                units: "RPM".into(),
            },
        ]
    }
}

/// Append `sample` to a bounded smoothing window.
fn push_sample(samples: &mut VecDeque<f64>, sample: f64) {
    if samples.len() == SMOOTHING_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(sample);
}

/// The arithmetic mean of the smoothing window.
#[allow(clippy::cast_precision_loss)]
fn mean(samples: &VecDeque<f64>) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::StubLine;

    /// Tolerance for floating-point comparisons against hand-computed
    /// conversions.
    const EPSILON: f64 = 1e-6;

    /// Helper to build a link over a stub pair, returning the stub handle for
    /// feeding frames.
    fn stub_link() -> (Link<StubLine>, StubLine) {
        let (reader, writer) = StubLine::pair();
        let stub = reader.clone();
        (Link::new(reader, writer), stub)
    }

    /// Feed a single sensor frame through the link.
    fn feed(link: &Link<StubLine>, stub: &StubLine, sensors: &str) {
        stub.push_line(&format!("C:1;B:0;L:0;E:0;!{sensors}"));
        assert!(link.poll(Duration::from_millis(100)).unwrap());
    }

    #[test]
    /// Test that a raw ADC count converts through the divider ratio to
    /// volts.
    fn voltage_conversion() {
        let (link, stub) = stub_link();
        let mut sensor = VoltageSensor::new("BV", 100_000.0, 10_000.0);

        feed(&link, &stub, "BV:512;");
        let volts = sensor.read(&link).unwrap();

        // 512 counts * 5/1023 volts per count * ratio 11
        let expected = 512.0 * 5.0 / 1023.0 * 11.0;
        assert!((volts - expected).abs() < EPSILON);
    }

    #[test]
    /// Test that repeated reads without a fresh frame do not stuff duplicate
    /// samples into the smoothing window.
    fn voltage_ignores_stale_reading() {
        let (link, stub) = stub_link();
        let mut sensor = VoltageSensor::new("BV", 0.0, 1.0);

        feed(&link, &stub, "BV:100;");
        let first = sensor.read(&link).unwrap();

        feed(&link, &stub, "BV:200;");
        let second = sensor.read(&link).unwrap();
        let expected = (100.0 + 200.0) / 2.0 * 5.0 / 1023.0;
        assert!((second - expected).abs() < EPSILON);
        assert!(second > first);

        // no new frame: the mean must not drift toward the latest sample
        let third = sensor.read(&link).unwrap();
        assert!((third - second).abs() < EPSILON);
    }

    #[test]
    /// Test that a missing channel leaves the derived value untouched.
    fn missing_reading_is_sticky() {
        let (link, stub) = stub_link();
        let mut sensor = TemperatureSensor::new("DT");

        assert!(sensor.read(&link).is_none());

        feed(&link, &stub, "DT:260;");
        let degrees = sensor.read(&link).unwrap();
        // 260 counts -> 1270.77 mV -> 77.08 C
        let expected = (260.0 * 5.0 / 1023.0 * 1000.0 - 500.0) / 10.0;
        assert!((degrees - expected).abs() < EPSILON);

        // a frame which omits DT entirely
        feed(&link, &stub, "BV:512;");
        assert!((sensor.read(&link).unwrap() - expected).abs() < EPSILON);
    }

    #[test]
    /// Test that sonar reports the latest distance without smoothing.
    fn sonar_latest_value() {
        let (link, stub) = stub_link();
        let mut sonar = Sonar::new("LS");

        feed(&link, &stub, "LS:80;");
        assert_eq!(sonar.read(&link), Some(80));

        feed(&link, &stub, "LS:25;");
        assert_eq!(sonar.read(&link), Some(25));
    }

    #[test]
    /// Test the RPM computation over a window of pulse counts.
    fn encoder_rpm() {
        let mut encoder = Encoder::new("LE", 2, Duration::from_secs(10));
        let start = Instant::now();

        encoder.observe(start, 1000);
        encoder.update(start);
        // a single observation is not a speed
        assert_eq!(encoder.value(), Some(0.0));

        encoder.observe(start + Duration::from_secs(2), 1100);
        encoder.update(start + Duration::from_secs(2));
        // 100 pulses / 2 magnets = 50 revs over 2 s -> 1500 RPM
        let rpm = encoder.value().unwrap();
        assert!((rpm - 1500.0).abs() < EPSILON);
    }

    #[test]
    /// Test that observations equal to or older than the newest stored one
    /// are dropped.
    fn encoder_ignores_stale_observation() {
        let mut encoder = Encoder::new("LE", 2, Duration::from_secs(10));
        let start = Instant::now();

        encoder.observe(start, 0);
        encoder.observe(start, 50);
        encoder.observe(start + Duration::from_secs(1), 60);
        encoder.update(start + Duration::from_secs(1));

        // the duplicate-timestamp observation must not have been stored:
        // 60 pulses / 2 magnets over 1 s -> 1800 RPM
        let rpm = encoder.value().unwrap();
        assert!((rpm - 1800.0).abs() < EPSILON);
    }

    #[test]
    /// Test that readings age out of the window and the RPM falls back to
    /// zero.
    fn encoder_window_pruning() {
        let mut encoder = Encoder::new("RE", 2, Duration::from_secs(10));
        let start = Instant::now();

        encoder.observe(start, 0);
        encoder.observe(start + Duration::from_secs(1), 100);
        encoder.update(start + Duration::from_secs(1));
        assert!(encoder.value().unwrap() > 0.0);

        // both observations are now older than the window
        encoder.update(start + Duration::from_secs(12));
        assert_eq!(encoder.value(), Some(0.0));
    }

    #[test]
    /// Test that a wrapped (decreasing) pulse counter saturates to zero
    /// pulses instead of producing a wild RPM.
    fn encoder_saturates_on_wrap() {
        let mut encoder = Encoder::new("RE", 2, Duration::from_secs(10));
        let start = Instant::now();

        encoder.observe(start, 65_000);
        encoder.observe(start + Duration::from_secs(1), 12);
        encoder.update(start + Duration::from_secs(1));
        assert_eq!(encoder.value(), Some(0.0));
    }

    #[test]
    /// Test that the suite wires every channel key to the right sensor.
    fn suite_reads_all_channels() {
        let (link, stub) = stub_link();
        let mut suite = SensorSuite::new(&Configuration::default());

        feed(
            &link,
            &stub,
            "BV:512;DT:260;LS:80;RS:75;LE:1000;RE:1000;",
        );
        suite.read_all(&link);

        let inputs = suite.safety_inputs();
        assert!(inputs.battery_voltage.is_some());
        assert!(inputs.driver_temperature.is_some());
        assert_eq!(inputs.sonar_distances, (Some(80), Some(75)));
        assert_eq!(inputs.encoder_rpms, (Some(0.0), Some(0.0)));

        let statuses = suite.statuses();
        assert_eq!(statuses.len(), 6);
        assert_eq!(statuses[0].name, "Battery voltage");
        assert_eq!(statuses[0].units, "V");
        assert_eq!(statuses[2].value, Some(80.0));
    }
}
