use crate::connection::{self, HttpTransport, MqttTransport};
use crate::gateway::Gateway;
use crate::mqtt::Router;
use tokio_util::task::AbortOnDropHandle;

/// A gateway over whichever transport is configured.
enum Connected {
    Http(Gateway<HttpTransport>),
    Mqtt(Gateway<MqttTransport>),
}

/// Connect to the H60 gateway, preferring HTTP polling when an address is given.
///
/// When a broker is configured, its event loop is started with `router`, which gets the
/// gateway's own route added when register values are received over MQTT. Polling over HTTP is
/// left to the caller.
fn connect(
    args: &connection::Args,
    mut router: Router,
    tasks: &mut Vec<AbortOnDropHandle<()>>,
) -> Result<Connected, connection::Error> {
    let mqtt = args.mqtt.client();
    let connected = match (&args.http, &mqtt) {
        (Some(address), _) => {
            let transport = HttpTransport::new(address, *args.request_timeout)?;
            Connected::Http(Gateway::new(transport, args.device_id.clone()))
        }
        (None, Some((client, _))) => {
            let gateway = Gateway::new(MqttTransport::new(client.clone()), args.device_id.clone());
            let ingest = gateway.clone();
            router.route(
                MqttTransport::topic_filter(args.device_id.as_deref()),
                Box::new(move |topic: &str, payload: &[u8]| ingest.ingest_message(topic, payload)),
            );
            Connected::Mqtt(gateway)
        }
        (None, None) => return Err(connection::Error::NotConfigured),
    };
    if let Some((client, eventloop)) = mqtt {
        let idle_timeout = *args.mqtt.idle_timeout;
        tasks.push(AbortOnDropHandle::new(tokio::spawn(crate::mqtt::run_event_loop(
            client,
            eventloop,
            router,
            idle_timeout,
        ))));
    }
    Ok(connected)
}

pub mod registers {
    use crate::output;
    use crate::registers::{DataType, Register, c30};
    use crate::controller::Rego1000;

    /// Search and output the known controller registers.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only list registers whose name, index or description contains this text.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the registers")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub id: &'static str,
        pub name: &'static str,
        pub data_type: DataType,
        pub unit: &'static str,
        pub writable: bool,
        pub description: &'static str,
    }

    impl RegisterSchema {
        pub fn new(register: Register) -> Self {
            let data_type = register.data_type();
            RegisterSchema {
                id: register.id(),
                name: register.name(),
                data_type,
                unit: data_type.unit(),
                writable: Rego1000::<()>::is_writable(register),
                description: register.description(),
            }
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.name.contains(&pattern)
                || self.id.contains(&pattern)
                || self.description.to_uppercase().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec!["Index", "Name", "Type", "Unit", "Writable", "Description"])
            .map_err(Error::Output)?;
        let registers = c30::ALL.iter().map(|r| RegisterSchema::new(*r));
        for register in registers {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output
                .result(
                    || {
                        vec![
                            register.id.to_string(),
                            register.name.to_string(),
                            register.data_type.to_string(),
                            register.unit.to_string(),
                            if register.writable { "yes" } else { "no" }.to_string(),
                            register.description.to_string(),
                        ]
                    },
                    || &register,
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn matches_name_index_and_description() {
            let schema = RegisterSchema::new(c30::OUTDOOR_TEMP_OFFSET);
            assert!(schema.writable);
            assert!(schema.is_match("offset"));
            assert!(schema.is_match("0217"));
            assert!(!schema.is_match("compressor"));
            assert!(!RegisterSchema::new(c30::COMPRESSOR).writable);
        }
    }
}

pub mod read {
    use super::{Connected, connect};
    use crate::connection;
    use crate::controller::Rego1000;
    use crate::mqtt::Router;
    use crate::output;
    use crate::registers::c30;
    use crate::value::Value;
    use std::collections::BTreeMap;

    /// Read all controller registers once.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// When receiving register values over MQTT, collect them for this long.
        #[arg(long, default_value = "30s")]
        listen: humantime::Duration,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not connect to the H60 gateway")]
        Connect(#[source] connection::Error),
        #[error("could not read the registers")]
        Read(#[source] crate::gateway::Error),
        #[error("could not output the registers")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Reading {
        id: &'static str,
        name: &'static str,
        value: Option<Value>,
        unit: &'static str,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let mut tasks = Vec::new();
        let data = match connect(&args.connection, Router::new(), &mut tasks).map_err(Error::Connect)? {
            Connected::Http(gateway) => {
                gateway.refresh().await.map_err(Error::Read)?;
                gateway.read_all()
            }
            Connected::Mqtt(gateway) => {
                tokio::time::sleep(*args.listen).await;
                gateway.read_all()
            }
        };
        drop(tasks);
        write(args.output, &data)
    }

    fn write(args: output::Args, data: &BTreeMap<String, Value>) -> Result<(), Error> {
        let translated = Rego1000::<()>::translate(data);
        let mut output = args.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Index", "Name", "Value", "Unit"]).map_err(Error::Output)?;
        for register in c30::ALL {
            let value = translated.get(register.name()).copied().flatten();
            let unit = register.data_type().unit();
            output
                .result(
                    || {
                        vec![
                            register.id().to_string(),
                            register.name().to_string(),
                            value.map(|v| v.to_string()).unwrap_or_default(),
                            unit.to_string(),
                        ]
                    },
                    || Reading { id: register.id(), name: register.name(), value, unit },
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod set {
    use super::{Connected, connect};
    use crate::connection::{self, Transport};
    use crate::controller::{self, Rego1000};
    use crate::gateway::Gateway;
    use crate::mqtt::Router;
    use crate::registers::Register;
    use crate::value;
    use std::time::Duration;
    use tracing::info;

    /// Change one controller register.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// Wait this long to learn the heat pump device id from the broker, if not configured.
        #[arg(long, default_value = "30s")]
        listen: humantime::Duration,
        /// Register name (e.g. `ROOM_TEMP_SETPOINT`) or index (e.g. `0203`).
        register: String,
        /// The new value in engineering units (`21.5`, `on`, `3`).
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("`{0}` is not a known register, see the `registers` command")]
        UnknownRegister(String),
        #[error("could not interpret the value")]
        Value(#[source] value::Error),
        #[error("could not connect to the H60 gateway")]
        Connect(#[source] connection::Error),
        #[error("could not change the register")]
        Set(#[source] controller::Error),
    }

    /// The event loop sends queued requests in order but gives no completion signal.
    const FLUSH_DELAY: Duration = Duration::from_secs(1);

    pub async fn run(args: Args) -> Result<(), Error> {
        let register = Register::from_name(&args.register)
            .or_else(|| Register::from_id(&args.register))
            .ok_or_else(|| Error::UnknownRegister(args.register.clone()))?;
        let value = value::parse(register.id(), &args.value).map_err(Error::Value)?;
        let mut tasks = Vec::new();
        match connect(&args.connection, Router::new(), &mut tasks).map_err(Error::Connect)? {
            Connected::Http(gateway) => set(gateway, register, value).await?,
            Connected::Mqtt(gateway) => {
                wait_for_identity(&gateway, *args.listen).await;
                set(gateway, register, value).await?;
                tokio::time::sleep(FLUSH_DELAY).await;
            }
        }
        drop(tasks);
        Ok(())
    }

    async fn set<T: Transport>(
        gateway: Gateway<T>,
        register: Register,
        value: value::Value,
    ) -> Result<(), Error> {
        let rego = Rego1000::new(gateway);
        rego.set_variable(register, value).await.map_err(Error::Set)?;
        info!(%register, %value, "requested the change, the controller applies it on its own time");
        Ok(())
    }

    async fn wait_for_identity<T: Transport>(gateway: &Gateway<T>, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        while gateway.identity().device().is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

pub mod run {
    use super::{Connected, connect};
    use crate::connection::{self, Transport};
    use crate::controller::Rego1000;
    use crate::gateway::Gateway;
    use crate::mqtt::Router;
    use crate::scheduler::Scheduler;
    use crate::sensors::{self, HttpSensor, SensorReading, TopicSensor};
    use crate::storage::{self, CsvStorage, Record, Storage};
    use crate::strategy::{OffsetOutdoorTemperature, Status};
    use jiff::Timestamp;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio_util::task::AbortOnDropHandle;
    use tracing::{info, warn};

    /// Run the indoor temperature feedback control until interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        sensor: sensors::Args,
        /// Outdoor temperature offset requested per °C of indoor temperature deviation.
        #[arg(long, env = "STRATEGY_INFLUENCE", default_value_t = 1.0)]
        influence: f64,
        /// How often the strategies are checked for being due.
        #[arg(long, default_value = "1s")]
        tick: humantime::Duration,
        /// Store a sample of all values as CSV files in this directory.
        #[arg(long, env = "DATA_DIR")]
        data_dir: Option<PathBuf>,
        #[arg(long, env = "SAMPLE_TIME", default_value = "60s")]
        sample_time: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not connect to the H60 gateway")]
        Connect(#[source] connection::Error),
        #[error("could not set up the indoor temperature sensor")]
        Sensor(#[source] sensors::Error),
        #[error("could not set up sample storage")]
        Storage(#[source] storage::Error),
        #[error("could not listen for the interrupt signal")]
        Signal(#[source] std::io::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let reading = SensorReading::default();
        let mut router = Router::new();
        let mut tasks = Vec::new();
        if let Some(address) = &args.sensor.sensor_address {
            let timeout = *args.connection.request_timeout;
            let sensor = HttpSensor::new(address, timeout, reading.clone()).map_err(Error::Sensor)?;
            let period = *args.sensor.sensor_poll_period;
            tasks.push(AbortOnDropHandle::new(tokio::spawn(sensor.run(period))));
        } else if args.connection.mqtt.mqtt_host.is_some() {
            let topic = args.sensor.sensor_topic.clone();
            router.route(topic, TopicSensor::new(reading.clone()).into_handler());
        } else {
            warn!("no indoor temperature sensor is configured, no offset will be applied");
        }
        let storage = match &args.data_dir {
            Some(dir) => Some(CsvStorage::new(dir).map_err(Error::Storage)?),
            None => None,
        };
        match connect(&args.connection, router, &mut tasks).map_err(Error::Connect)? {
            Connected::Http(gateway) => {
                let poller = gateway.clone();
                let period = *args.connection.poll_period;
                tasks.push(AbortOnDropHandle::new(tokio::spawn(async move {
                    poller.poll(period).await
                })));
                serve(gateway, reading, storage, &args).await
            }
            Connected::Mqtt(gateway) => serve(gateway, reading, storage, &args).await,
        }
    }

    async fn serve<T: Transport>(
        gateway: Gateway<T>,
        reading: SensorReading,
        storage: Option<CsvStorage>,
        args: &Args,
    ) -> Result<(), Error> {
        let rego = Rego1000::new(gateway);
        let indoor_temperature = reading.temperature_accessor(*args.sensor.sensor_max_age);
        let strategy = OffsetOutdoorTemperature::new(rego.clone(), indoor_temperature, args.influence);
        let mut scheduler = Scheduler::new(*args.tick);
        scheduler.register(Box::new(strategy));
        let stop = scheduler.stop_handle();
        let statuses = scheduler.subscribe();
        let scheduler_task = tokio::spawn(async move { scheduler.run().await });
        let _sampler = storage.map(|storage| {
            let sampler = Sampler {
                rego,
                reading,
                sensor_name: args.sensor.sensor_name.clone(),
                statuses,
            };
            AbortOnDropHandle::new(tokio::spawn(sampler.run(storage, *args.sample_time)))
        });

        tokio::signal::ctrl_c().await.map_err(Error::Signal)?;
        info!("interrupted, stopping the scheduler");
        stop.stop();
        if let Err(e) = scheduler_task.await {
            warn!(error = (&e as &dyn std::error::Error), "scheduler task failed");
        }
        Ok(())
    }

    /// Periodically collects everything known about the system into one flat record.
    struct Sampler<T> {
        rego: Rego1000<T>,
        reading: SensorReading,
        sensor_name: String,
        statuses: watch::Receiver<Vec<Status>>,
    }

    impl<T: Transport> Sampler<T> {
        fn record(&self, now: Timestamp) -> Record {
            let mut record = Record::new();
            record.insert("timestamp".into(), Some(now.to_string()));
            for (name, value) in Rego1000::<T>::translate(&self.rego.get_all_data()) {
                record.insert(format!("rego.{name}"), value.map(|v| v.to_string()));
            }
            self.reading.extend_record(&self.sensor_name, &mut record);
            for status in self.statuses.borrow().iter() {
                let prefix = &status.name;
                record.insert(format!("{prefix}.phase"), Some(status.phase.to_string()));
                let last_trigger = status.last_trigger.map(|t| t.to_string());
                record.insert(format!("{prefix}.last_trigger"), last_trigger);
                for (key, value) in &status.values {
                    record.insert(format!("{prefix}.{key}"), value.map(|v| v.to_string()));
                }
            }
            record
        }

        async fn run(self, mut storage: impl Storage, period: Duration) {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(?period, "sampling started");
            loop {
                interval.tick().await;
                let record = self.record(Timestamp::now());
                if let Err(e) = storage.store(&record) {
                    warn!(
                        message = "could not store the sample, dropping it",
                        error = (&e as &dyn std::error::Error)
                    );
                }
            }
        }
    }

}
