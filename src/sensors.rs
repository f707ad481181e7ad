use crate::mqtt::Handler;
use crate::storage::Record;
use crate::strategy::IndoorTemperature;
use jiff::{SignedDuration, Timestamp};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not a usable sensor address")]
    InvalidAddress(String),
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("sensor read request failed")]
    Read(#[source] reqwest::Error),
    #[error("sensor returned a malformed response")]
    JsonDecode(#[source] reqwest::Error),
}

#[derive(clap::Parser, Clone)]
#[group(id = "sensors::Args")]
pub struct Args {
    /// Poll the indoor sensor node over HTTP at this address.
    ///
    /// When not given, the sensor is followed on the MQTT broker instead.
    #[arg(long, env = "SENSOR_ADDRESS")]
    pub sensor_address: Option<String>,
    /// Topic filter the indoor sensor publishes its measurements on.
    #[arg(long, env = "SENSOR_TOPIC", default_value = "+/firstfloor/+/temperature")]
    pub sensor_topic: String,
    #[arg(long, default_value = "1min")]
    pub sensor_poll_period: humantime::Duration,
    /// Measurements older than this are not used for control.
    #[arg(long, default_value = "30min")]
    pub sensor_max_age: humantime::Duration,
    /// Prefix for the sensor's fields in stored samples.
    #[arg(long, default_value = "indoor")]
    pub sensor_name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Reading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub timestamp: Option<Timestamp>,
}

/// Latest measurement of a sensor, shared between whoever updates it and whoever reads it.
#[derive(Clone, Default)]
pub struct SensorReading(Arc<Mutex<Reading>>);

impl SensorReading {
    pub fn latest(&self) -> Reading {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut Reading)) {
        let mut reading = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut reading);
        reading.timestamp = Some(Timestamp::now());
    }

    /// The latest temperature, or `None` once it is older than `max_age`.
    pub fn temperature_accessor(&self, max_age: Duration) -> IndoorTemperature {
        let reading = self.clone();
        let max_age = SignedDuration::try_from(max_age).unwrap_or(SignedDuration::MAX);
        Box::new(move || {
            let Reading { temperature, timestamp, .. } = reading.latest();
            let age = Timestamp::now().duration_since(timestamp?);
            if age > max_age {
                debug!(?age, "indoor temperature is stale");
                return None;
            }
            temperature
        })
    }

    /// Fields for a stored sample, named `<name>.temperature` and so on.
    pub fn extend_record(&self, name: &str, record: &mut Record) {
        let Reading { temperature, humidity, timestamp } = self.latest();
        record.insert(format!("{name}.temperature"), temperature.map(|v| v.to_string()));
        record.insert(format!("{name}.humidity"), humidity.map(|v| v.to_string()));
        record.insert(format!("{name}.timestamp"), timestamp.map(|v| v.to_string()));
    }
}

/// A sensor publishing each measurement as a float on `<id>/<location...>/<kind>`.
pub struct TopicSensor {
    reading: SensorReading,
}

impl TopicSensor {
    pub fn new(reading: SensorReading) -> Self {
        Self { reading }
    }

    pub fn on_message(&self, topic: &str, payload: &[u8]) {
        let kind = topic.rsplit('/').next().unwrap_or_default();
        let value = std::str::from_utf8(payload).ok().and_then(|p| p.trim().parse::<f64>().ok());
        let Some(value) = value.filter(|v| v.is_finite()) else {
            warn!(topic, payload = %String::from_utf8_lossy(payload), "ignoring unparsable measurement");
            return;
        };
        match kind {
            "temperature" => self.reading.update(|r| r.temperature = Some(value)),
            "humidity" => self.reading.update(|r| r.humidity = Some(value)),
            _ => {
                debug!(topic, kind, "ignoring measurement of an unknown kind");
                return;
            }
        }
        debug!(topic, value, "received measurement");
    }

    pub fn into_handler(self) -> Handler {
        Box::new(move |topic: &str, payload: &[u8]| self.on_message(topic, payload))
    }
}

#[derive(serde::Deserialize)]
struct ReadResponse {
    external_temperature_sensor: Option<Measurement>,
}

#[derive(serde::Deserialize, Default)]
struct Measurement {
    temperature: Option<f64>,
    humidity: Option<f64>,
}

/// A sensor node serving its latest measurement at `http://<address>/read/`.
pub struct HttpSensor {
    url: String,
    client: reqwest::Client,
    reading: SensorReading,
}

impl HttpSensor {
    pub fn new(address: &str, timeout: Duration, reading: SensorReading) -> Result<Self, Error> {
        let url = format!("http://{address}/read/");
        if reqwest::Url::parse(&url).is_err() {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(Error::CreateReqwest)?;
        Ok(Self { url, client, reading })
    }

    pub async fn update(&self) -> Result<(), Error> {
        let resp = self.client.get(&self.url).send().await.map_err(Error::Read)?;
        let resp = resp.error_for_status().map_err(Error::Read)?;
        let resp = resp.json::<ReadResponse>().await.map_err(Error::JsonDecode)?;
        self.apply(resp);
        Ok(())
    }

    fn apply(&self, resp: ReadResponse) {
        let Measurement { temperature, humidity } =
            resp.external_temperature_sensor.unwrap_or_default();
        self.reading.update(|r| {
            r.temperature = temperature;
            r.humidity = humidity;
        });
        debug!(url = self.url, ?temperature, ?humidity, "polled sensor");
    }

    /// Poll the sensor every `period` forever. Failed polls keep the previous measurement.
    pub async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.update().await {
                warn!(
                    message = "could not poll the sensor",
                    url = self.url,
                    error = (&e as &dyn std::error::Error)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_sensor_tracks_kinds() {
        let reading = SensorReading::default();
        let sensor = TopicSensor::new(reading.clone());
        sensor.on_message("a1b2/firstfloor/hall/temperature", b"21.5");
        sensor.on_message("a1b2/firstfloor/hall/humidity", b" 41 ");
        let latest = reading.latest();
        assert_eq!(latest.temperature, Some(21.5));
        assert_eq!(latest.humidity, Some(41.0));
        assert!(latest.timestamp.is_some());
    }

    #[test]
    fn topic_sensor_ignores_garbage() {
        let reading = SensorReading::default();
        let sensor = TopicSensor::new(reading.clone());
        sensor.on_message("a1b2/firstfloor/hall/temperature", b"20");
        sensor.on_message("a1b2/firstfloor/hall/temperature", b"warm");
        sensor.on_message("a1b2/firstfloor/hall/temperature", b"NaN");
        sensor.on_message("a1b2/firstfloor/hall/pressure", b"1013");
        assert_eq!(reading.latest().temperature, Some(20.0));
    }

    #[test]
    fn accessor_hides_missing_and_stale_readings() {
        let reading = SensorReading::default();
        let accessor = reading.temperature_accessor(Duration::from_secs(600));
        assert_eq!(accessor(), None);
        TopicSensor::new(reading.clone()).on_message("x/y/temperature", b"19.5");
        assert_eq!(accessor(), Some(19.5));
        reading.0.lock().unwrap().timestamp = Some(Timestamp::now() - SignedDuration::from_hours(1));
        assert_eq!(accessor(), None);
    }

    #[test]
    fn http_response_shapes() {
        let reading = SensorReading::default();
        let sensor = HttpSensor::new("192.168.1.21", Duration::from_secs(1), reading.clone()).unwrap();
        let resp = serde_json::from_str(
            r#"{"external_temperature_sensor": {"temperature": 22.25, "humidity": 38.5}}"#,
        )
        .unwrap();
        sensor.apply(resp);
        assert_eq!(reading.latest().temperature, Some(22.25));
        assert_eq!(reading.latest().humidity, Some(38.5));

        sensor.apply(serde_json::from_str("{}").unwrap());
        assert_eq!(reading.latest().temperature, None);
    }

    #[test]
    fn record_fields_are_prefixed() {
        let reading = SensorReading::default();
        TopicSensor::new(reading.clone()).on_message("x/y/temperature", b"20.5");
        let mut record = Record::new();
        reading.extend_record("indoor", &mut record);
        assert_eq!(record["indoor.temperature"].as_deref(), Some("20.5"));
        assert_eq!(record["indoor.humidity"], None);
        assert!(record["indoor.timestamp"].is_some());
    }

    #[test]
    fn rejects_unusable_address() {
        let result = HttpSensor::new("not a host", Duration::from_secs(1), Default::default());
        assert!(matches!(result, Err(Error::InvalidAddress(_))));
    }
}
