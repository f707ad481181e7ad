use crate::connection::{self, Transport};
use crate::registers::DataType;
use crate::value::{self, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not exchange data with the H60 gateway")]
    Transport(#[source] connection::Error),
    #[error("register `{0}` has not been observed yet")]
    NotObserved(String),
    #[error("register `{0}` is not an on/off register")]
    NotBoolean(String),
    #[error("the heat pump device id is not known yet; configure it or wait for the first message")]
    UnknownIdentity,
    #[error(transparent)]
    Value(#[from] value::Error),
}

/// Which heat pump the register values belong to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Identity {
    #[default]
    Unknown,
    Known(String),
}

impl Identity {
    pub fn device(&self) -> Option<&str> {
        match self {
            Identity::Unknown => None,
            Identity::Known(device) => Some(device),
        }
    }
}

#[derive(Default)]
struct RawState {
    /// Last observed raw value for each register index.
    values: BTreeMap<String, String>,
    identity: Identity,
}

/// Live register state of one heat pump controller behind an H60 gateway.
///
/// Clones share the same state and transport, so the ingestion task and the control code can
/// each hold one.
pub struct Gateway<T> {
    transport: Arc<T>,
    state: Arc<Mutex<RawState>>,
}

impl<T> Clone for Gateway<T> {
    fn clone(&self) -> Self {
        Self { transport: Arc::clone(&self.transport), state: Arc::clone(&self.state) }
    }
}

impl<T: Transport> Gateway<T> {
    pub fn new(transport: T, device: Option<String>) -> Self {
        let identity = device.map(Identity::Known).unwrap_or_default();
        let state = RawState { values: BTreeMap::new(), identity };
        Self { transport: Arc::new(transport), state: Arc::new(Mutex::new(state)) }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RawState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn identity(&self) -> Identity {
        self.lock().identity.clone()
    }

    /// Poll the transport for a snapshot and merge it into the known state.
    ///
    /// Registers missing from the snapshot keep their previous value.
    pub async fn refresh(&self) -> Result<(), Error> {
        let Some(snapshot) = self.transport.fetch_all().await.map_err(Error::Transport)? else {
            trace!("transport does not support polling");
            return Ok(());
        };
        let count = snapshot.len();
        self.lock().values.extend(snapshot);
        debug!(count, "refreshed register values");
        Ok(())
    }

    /// Refresh every `period` forever. Failed polls are logged and keep the previous values.
    pub async fn poll(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.refresh().await {
                warn!(
                    message = "could not poll the H60 gateway",
                    error = (&e as &dyn std::error::Error)
                );
            }
        }
    }

    /// Record a register value received as an MQTT message on `<device-id>/HP/<register>`.
    pub fn ingest_message(&self, topic: &str, payload: &[u8]) {
        let mut parts = topic.splitn(3, '/');
        let (Some(device), Some(_), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
            debug!(topic, "ignoring message on an unexpected topic");
            return;
        };
        if key.starts_with("SET/") {
            trace!(topic, "ignoring a set command echo");
            return;
        }
        let Ok(payload) = std::str::from_utf8(payload) else {
            warn!(topic, "register value is not valid UTF-8");
            return;
        };
        let mut state = self.lock();
        match &state.identity {
            Identity::Known(known) if known != device => {
                debug!(topic, known, "ignoring message from another device");
                return;
            }
            Identity::Known(_) => {}
            Identity::Unknown => {
                info!(device, "learned heat pump device id");
                state.identity = Identity::Known(device.to_string());
            }
        }
        trace!(register = key, raw = payload, "received register value");
        state.values.insert(key.to_string(), payload.to_string());
    }

    /// Snapshot of the raw values as received from the gateway.
    pub fn read_raw(&self) -> BTreeMap<String, String> {
        self.lock().values.clone()
    }

    /// Snapshot of all decodable register values.
    ///
    /// Entries that fail to decode are logged and left out.
    pub fn read_all(&self) -> BTreeMap<String, Value> {
        self.read_raw()
            .into_iter()
            .filter_map(|(id, raw)| match value::decode(&id, &raw) {
                Ok(value) => Some((id, value)),
                Err(e) => {
                    warn!(
                        message = "could not decode register value",
                        register = id,
                        raw,
                        error = (&e as &dyn std::error::Error)
                    );
                    None
                }
            })
            .collect()
    }

    pub fn read_one(&self, id: &str) -> Result<Value, Error> {
        let raw = self.lock().values.get(id).cloned();
        value::decode_optional(id, raw.as_deref())?.ok_or_else(|| Error::NotObserved(id.to_string()))
    }

    /// Send a set command for register `id`.
    ///
    /// This does not wait for the controller to apply the value; a later read will reflect it.
    pub async fn write(&self, id: &str, value: &Value) -> Result<(), Error> {
        let raw = value::encode(id, value)?;
        let identity = self.identity();
        if T::REQUIRES_IDENTITY && identity.device().is_none() {
            return Err(Error::UnknownIdentity);
        }
        self.transport
            .send_set(identity.device(), id, &raw)
            .await
            .map_err(Error::Transport)?;
        info!(register = id, %value, raw, "requested register change");
        Ok(())
    }

    /// Bring an on/off register into the `desired` state.
    ///
    /// Returns whether a set command was sent.
    pub async fn toggle(&self, id: &str, desired: bool) -> Result<bool, Error> {
        if DataType::classify(id).map_err(value::Error::from)? != DataType::OnOff {
            return Err(Error::NotBoolean(id.to_string()));
        }
        let current = self.read_one(id)?;
        if current == Value::Bool(desired) {
            return Ok(false);
        }
        self.write(id, &Value::Bool(desired)).await?;
        Ok(true)
    }
}
