use crate::connection::Transport;
use crate::controller::Rego1000;
use crate::registers::c30;
use crate::value::Value;
use futures::future::BoxFuture;
use jiff::{Timestamp, ToSpan as _, Zoned};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A feedback strategy run by the [`crate::scheduler::Scheduler`].
pub trait Strategy: Send {
    /// Identifies the strategy within a scheduler.
    fn name(&self) -> &str;

    fn is_triggerable(&self, now: &Zoned) -> bool;

    /// Compute and apply the strategy's correction.
    ///
    /// Failures to read inputs or apply the output are handled by the strategy itself.
    fn trigger<'a>(&'a mut self, now: &'a Zoned) -> BoxFuture<'a, ()>;

    fn status(&self, now: &Zoned) -> Status;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    NeverTriggered,
    Idle,
    Due,
    Triggering,
}

#[derive(Clone, Debug)]
pub struct Status {
    pub name: String,
    pub phase: Phase,
    pub last_trigger: Option<Timestamp>,
    pub values: BTreeMap<&'static str, Option<f64>>,
}

/// Zero-argument accessor for the current indoor temperature in °C.
pub type IndoorTemperature = Box<dyn Fn() -> Option<f64> + Send + Sync>;

#[derive(Default)]
struct State {
    indoor_temperature: Option<f64>,
    setpoint: Option<f64>,
    offset: f64,
    last_trigger: Option<Timestamp>,
    next_eligible: Option<Timestamp>,
    triggering: bool,
}

/// Biases the outdoor temperature sensed by the controller with the difference between the
/// measured indoor temperature and the controller's indoor setpoint.
///
/// A positive offset makes the controller believe it is warmer outside and so heat less. The
/// correction is purely proportional to the deviation, scaled by `influence`. It is applied at
/// most once per wall-clock hour.
pub struct OffsetOutdoorTemperature<T> {
    name: String,
    rego: Rego1000<T>,
    indoor_temperature: IndoorTemperature,
    influence: f64,
    state: State,
}

impl<T: Transport> OffsetOutdoorTemperature<T> {
    pub fn new(rego: Rego1000<T>, indoor_temperature: IndoorTemperature, influence: f64) -> Self {
        Self {
            name: "offset-outdoor-temperature".to_string(),
            rego,
            indoor_temperature,
            influence,
            state: State::default(),
        }
    }

    pub fn offset(&self) -> f64 {
        self.state.offset
    }

    fn read_setpoint(&mut self) {
        match self.rego.get_variable(c30::ROOM_TEMP_SETPOINT) {
            Ok(value) => match value.as_f64() {
                Some(setpoint) => self.state.setpoint = Some(setpoint),
                None => warn!(%value, "setpoint is not a temperature, keeping the previous one"),
            },
            Err(e) => warn!(
                message = "could not read the setpoint, keeping the previous one",
                previous = ?self.state.setpoint,
                error = (&e as &dyn std::error::Error)
            ),
        }
    }

    async fn apply(&mut self, now: &Zoned) {
        self.state.indoor_temperature = (self.indoor_temperature)();
        self.read_setpoint();
        let offset = match (self.state.indoor_temperature, self.state.setpoint) {
            (Some(indoor), Some(setpoint)) => (indoor - setpoint) * self.influence,
            (indoor, setpoint) => {
                warn!(?indoor, ?setpoint, "missing input, falling back to no offset");
                0.0
            }
        };
        self.state.offset = if offset.is_finite() { offset } else { 0.0 };
        let result =
            self.rego.set_variable(c30::OUTDOOR_TEMP_OFFSET, Value::Float(self.state.offset)).await;
        if let Err(e) = result {
            warn!(
                message = "could not apply the outdoor temperature offset",
                offset = self.state.offset,
                error = (&e as &dyn std::error::Error)
            );
        }
        self.record_trigger(now);
        info!(
            strategy = self.name.as_str(),
            indoor_temperature = ?self.state.indoor_temperature,
            setpoint = ?self.state.setpoint,
            offset = self.state.offset,
            "strategy triggered"
        );
    }

    fn record_trigger(&mut self, now: &Zoned) {
        let now_ts = now.timestamp();
        self.state.last_trigger = Some(self.state.last_trigger.map_or(now_ts, |t| t.max(now_ts)));
        let next = start_of_next_hour(now).unwrap_or_else(|e| {
            warn!(error = (&e as &dyn std::error::Error), "cannot compute the next hour");
            Timestamp::MAX
        });
        self.state.next_eligible = Some(self.state.next_eligible.map_or(next, |t| t.max(next)));
    }
}

fn start_of_next_hour(now: &Zoned) -> Result<Timestamp, jiff::Error> {
    let hour = now.with().minute(0).second(0).subsec_nanosecond(0).build()?;
    Ok(hour.checked_add(1.hour())?.timestamp())
}

impl<T: Transport> Strategy for OffsetOutdoorTemperature<T> {
    fn name(&self) -> &str {
        &self.name
    }

    /// Eligible when never triggered, or once the wall clock has crossed into an hour later than
    /// the one of the last trigger.
    fn is_triggerable(&self, now: &Zoned) -> bool {
        match self.state.next_eligible {
            None => true,
            Some(next) => now.timestamp() >= next,
        }
    }

    fn trigger<'a>(&'a mut self, now: &'a Zoned) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.state.triggering = true;
            self.apply(now).await;
            self.state.triggering = false;
        })
    }

    fn status(&self, now: &Zoned) -> Status {
        let phase = if self.state.triggering {
            Phase::Triggering
        } else if self.state.last_trigger.is_none() {
            Phase::NeverTriggered
        } else if self.is_triggerable(now) {
            Phase::Due
        } else {
            Phase::Idle
        };
        Status {
            name: self.name.clone(),
            phase,
            last_trigger: self.state.last_trigger,
            values: BTreeMap::from([
                ("indoor_temperature", self.state.indoor_temperature),
                ("setpoint_temperature", self.state.setpoint),
                ("requested_offset", Some(self.state.offset)),
                ("influence", Some(self.influence)),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingTransport;
    use crate::gateway::Gateway;
    use jiff::tz::TimeZone;

    fn at(day: i8, hour: i8, minute: i8) -> Zoned {
        jiff::civil::date(2024, 1, day).at(hour, minute, 0, 0).to_zoned(TimeZone::UTC).unwrap()
    }

    fn strategy(indoor: Option<f64>, influence: f64) -> OffsetOutdoorTemperature<RecordingTransport> {
        let gateway = Gateway::new(RecordingTransport::default(), Some("dev".into()));
        OffsetOutdoorTemperature::new(Rego1000::new(gateway), Box::new(move || indoor), influence)
    }

    fn sent_offsets(s: &OffsetOutdoorTemperature<RecordingTransport>) -> Vec<String> {
        let sent = s.rego.gateway().transport().sent();
        assert!(sent.iter().all(|s| s.id == "0217"));
        sent.into_iter().map(|s| s.raw).collect()
    }

    #[tokio::test]
    async fn proportional_offset() {
        let mut s = strategy(Some(22.0), 2.0);
        s.rego.gateway().ingest_message("dev/HP/0203", b"200");
        s.trigger(&at(15, 10, 30)).await;
        assert_eq!(s.offset(), 4.0);
        assert_eq!(sent_offsets(&s), ["40"]);
    }

    #[tokio::test]
    async fn offset_is_clamped_on_write() {
        let mut s = strategy(Some(14.0), 2.0);
        s.rego.gateway().ingest_message("dev/HP/0203", b"215");
        s.trigger(&at(15, 10, 30)).await;
        assert_eq!(s.offset(), -15.0);
        assert_eq!(sent_offsets(&s), ["-100"]);
    }

    #[tokio::test]
    async fn missing_indoor_temperature_means_no_offset() {
        let mut s = strategy(None, 2.0);
        s.rego.gateway().ingest_message("dev/HP/0203", b"200");
        s.trigger(&at(15, 10, 30)).await;
        assert_eq!(s.offset(), 0.0);
        assert_eq!(sent_offsets(&s), ["0"]);
    }

    #[tokio::test]
    async fn missing_setpoint_means_no_offset() {
        let mut s = strategy(Some(22.0), 2.0);
        s.trigger(&at(15, 10, 30)).await;
        assert_eq!(s.offset(), 0.0);
        assert_eq!(sent_offsets(&s), ["0"]);
        assert_eq!(s.status(&at(15, 10, 31)).phase, Phase::Idle);
    }

    #[tokio::test]
    async fn unreadable_setpoint_keeps_the_previous_one() {
        let mut s = strategy(Some(21.0), 1.0);
        s.rego.gateway().ingest_message("dev/HP/0203", b"200");
        s.trigger(&at(15, 10, 30)).await;
        s.rego.gateway().ingest_message("dev/HP/0203", b"garbage");
        s.trigger(&at(15, 11, 30)).await;
        assert_eq!(s.offset(), 1.0);
        assert_eq!(sent_offsets(&s), ["10", "10"]);
    }

    #[tokio::test]
    async fn failed_write_still_completes_the_trigger() {
        let gateway = Gateway::new(RecordingTransport::default(), None);
        let mut s = OffsetOutdoorTemperature::new(Rego1000::new(gateway), Box::new(|| None), 1.0);
        s.trigger(&at(15, 10, 30)).await;
        assert_eq!(s.status(&at(15, 10, 30)).last_trigger, Some(at(15, 10, 30).timestamp()));
        assert!(!s.is_triggerable(&at(15, 10, 45)));
    }

    #[tokio::test]
    async fn triggers_once_per_hour() {
        let mut s = strategy(Some(20.0), 1.0);
        assert!(s.is_triggerable(&at(15, 10, 30)));
        assert_eq!(s.status(&at(15, 10, 30)).phase, Phase::NeverTriggered);

        s.trigger(&at(15, 10, 30)).await;
        assert!(!s.is_triggerable(&at(15, 10, 30)));
        assert!(!s.is_triggerable(&at(15, 10, 59)));
        assert!(s.is_triggerable(&at(15, 11, 0)));
        assert_eq!(s.status(&at(15, 11, 0)).phase, Phase::Due);
    }

    #[tokio::test]
    async fn crosses_midnight() {
        let mut s = strategy(Some(20.0), 1.0);
        s.trigger(&at(15, 23, 59)).await;
        assert!(!s.is_triggerable(&at(15, 23, 59)));
        assert!(s.is_triggerable(&at(16, 0, 1)));
        s.trigger(&at(16, 0, 1)).await;
        assert!(!s.is_triggerable(&at(16, 0, 30)));
    }

    #[tokio::test]
    async fn last_trigger_never_goes_back() {
        let mut s = strategy(Some(20.0), 1.0);
        s.trigger(&at(15, 12, 0)).await;
        s.trigger(&at(15, 9, 0)).await;
        assert_eq!(s.status(&at(15, 12, 0)).last_trigger, Some(at(15, 12, 0).timestamp()));
        assert!(!s.is_triggerable(&at(15, 10, 0)));
        assert!(!s.is_triggerable(&at(15, 12, 59)));
        assert!(s.is_triggerable(&at(15, 13, 0)));
    }
}
