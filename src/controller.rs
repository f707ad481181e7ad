use crate::connection::Transport;
use crate::gateway::{self, Gateway};
use crate::registers::{Register, c30};
use crate::value::Value;
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} is a read-only register")]
    NotWritable(Register),
    #[error(transparent)]
    Gateway(#[from] gateway::Error),
}

/// IVT Rego 1000 (and Bosch Pro Control 500) controller behind an H60 gateway.
///
/// Restricts writes to the registers the controller accepts from outside and keeps the outdoor
/// temperature offset within what the controller supports.
pub struct Rego1000<T> {
    gateway: Gateway<T>,
}

impl<T> Clone for Rego1000<T> {
    fn clone(&self) -> Self {
        Self { gateway: self.gateway.clone() }
    }
}

impl<T> Rego1000<T> {
    pub const WRITABLE: [Register; 11] = [
        c30::ROOM_TEMP_SETPOINT,
        c30::ROOM_SENSOR_INFLUENCE,
        c30::HEAT_SET_1_CURVE_L,
        c30::HEAT_SET_1_CURVE_L_2,
        c30::HEAT_SET_2_CURVE_R_2,
        c30::EXTRA_WARM_WATER,
        c30::WARM_WATER_PROGRAM,
        c30::EXTERNAL_CONTROL,
        c30::EXTERNAL_CONTROL_2,
        c30::OUTDOOR_TEMP_OFFSET,
        c30::POOL_TEMP_SETPOINT,
    ];

    /// The controller only accepts outdoor temperature offsets within this range, in °C.
    pub const OFFSET_RANGE: (f64, f64) = (-10.0, 10.0);

    pub fn is_writable(register: Register) -> bool {
        Self::WRITABLE.contains(&register)
    }

    /// Rename register indices to register names, covering the whole catalog.
    ///
    /// Registers that have not been observed map to `None`.
    pub fn translate(data: &BTreeMap<String, Value>) -> BTreeMap<&'static str, Option<Value>> {
        c30::ALL.iter().map(|r| (r.name(), data.get(r.id()).copied())).collect()
    }
}

impl<T: Transport> Rego1000<T> {
    pub fn new(gateway: Gateway<T>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Gateway<T> {
        &self.gateway
    }

    pub fn get_all_data(&self) -> BTreeMap<String, Value> {
        self.gateway.read_all()
    }

    pub fn get_variable(&self, register: Register) -> Result<Value, Error> {
        Ok(self.gateway.read_one(register.id())?)
    }

    pub async fn set_variable(&self, register: Register, value: Value) -> Result<(), Error> {
        if !Self::is_writable(register) {
            return Err(Error::NotWritable(register));
        }
        let value = if register == c30::OUTDOOR_TEMP_OFFSET {
            clamp_offset(value)
        } else {
            value
        };
        Ok(self.gateway.write(register.id(), &value).await?)
    }
}

fn clamp_offset(value: Value) -> Value {
    let (min, max) = Rego1000::<()>::OFFSET_RANGE;
    match value {
        Value::Float(v) if v.is_nan() => value,
        Value::Float(v) => Value::Float(v.clamp(min, max)),
        Value::Int(v) => Value::Int(v.clamp(min as i64, max as i64)),
        Value::Bool(_) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingTransport;

    fn rego() -> Rego1000<RecordingTransport> {
        Rego1000::new(Gateway::new(RecordingTransport::default(), Some("dev".into())))
    }

    #[tokio::test]
    async fn read_only_registers_never_reach_the_transport() {
        let rego = rego();
        for x in [-100.0, 0.0, 20.0, 1e9] {
            let result = rego.set_variable(c30::HEATING_SETPOINT, Value::Float(x)).await;
            assert!(matches!(result, Err(Error::NotWritable(r)) if r == c30::HEATING_SETPOINT));
        }
        let result = rego.set_variable(c30::COMPRESSOR, Value::Bool(true)).await;
        assert!(matches!(result, Err(Error::NotWritable(_))));
        assert!(rego.gateway().transport().sent().is_empty());
    }

    #[tokio::test]
    async fn offset_saturates_at_bounds() {
        let rego = rego();
        rego.set_variable(c30::OUTDOOR_TEMP_OFFSET, Value::Float(15.0)).await.unwrap();
        rego.set_variable(c30::OUTDOOR_TEMP_OFFSET, Value::Float(-12.5)).await.unwrap();
        rego.set_variable(c30::OUTDOOR_TEMP_OFFSET, Value::Int(11)).await.unwrap();
        rego.set_variable(c30::OUTDOOR_TEMP_OFFSET, Value::Float(4.0)).await.unwrap();
        let raws = rego.gateway().transport().sent().into_iter().map(|s| s.raw).collect::<Vec<_>>();
        assert_eq!(raws, ["100", "-100", "100", "40"]);
    }

    #[tokio::test]
    async fn other_writable_registers_are_not_clamped() {
        let rego = rego();
        rego.set_variable(c30::ROOM_TEMP_SETPOINT, Value::Float(20.0)).await.unwrap();
        rego.set_variable(c30::POOL_TEMP_SETPOINT, Value::Float(28.5)).await.unwrap();
        let sent = rego.gateway().transport().sent();
        assert_eq!(sent[0].id, "0203");
        assert_eq!(sent[0].raw, "200");
        assert_eq!(sent[1].raw, "285");
    }

    #[test]
    fn translate_covers_the_catalog() {
        let rego = rego();
        rego.gateway().ingest_message("dev/HP/0203", b"200");
        rego.gateway().ingest_message("dev/HP/1A01", b"1");
        let translated = Rego1000::<RecordingTransport>::translate(&rego.get_all_data());
        assert_eq!(translated.len(), c30::ALL.len());
        assert_eq!(translated["ROOM_TEMP_SETPOINT"], Some(Value::Float(20.0)));
        assert_eq!(translated["COMPRESSOR"], Some(Value::Bool(true)));
        assert_eq!(translated["OUTDOOR"], None);
        assert_eq!(rego.get_variable(c30::ROOM_TEMP_SETPOINT).unwrap(), Value::Float(20.0));
    }
}
