use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop, MqttOptions};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Requests the MQTT client can queue while the event loop is not draining them.
const MQTT_REQUEST_CAPACITY: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not a usable H60 address")]
    InvalidAddress(String),
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("H60 read API request failed")]
    HttpRead(#[source] reqwest::Error),
    #[error("H60 returned malformed JSON response")]
    HttpJsonDecode(#[source] reqwest::Error),
    #[error("H60 response is not an object")]
    HttpResponseIsntObject,
    #[error("H60 write API request failed")]
    HttpWrite(#[source] reqwest::Error),
    #[error("could not queue the set command for the MQTT broker")]
    MqttPublish(#[source] rumqttc::v5::ClientError),
    #[error("set commands over MQTT need the heat pump device id")]
    UnknownDevice,
    #[error("neither an H60 address nor an MQTT broker is configured")]
    NotConfigured,
}

/// A way to exchange register values with the H60 gateway.
///
/// Writes are at-most-once and unconfirmed: the gateway does not acknowledge set commands, so
/// the only way to observe that a write applied is a later read.
pub trait Transport: Send + Sync + 'static {
    /// Whether set commands are addressed by the heat pump device id.
    const REQUIRES_IDENTITY: bool;

    /// Fetch a snapshot of all registers.
    ///
    /// Returns `None` for transports that deliver register values as they come instead.
    fn fetch_all(
        &self,
    ) -> impl Future<Output = Result<Option<BTreeMap<String, String>>, Error>> + Send;

    fn send_set(
        &self,
        device: Option<&str>,
        id: &str,
        raw: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Poll the H60 gateway over its HTTP API at this address (e.g. `192.168.1.12`).
    ///
    /// When not given, register values are received from the MQTT broker instead.
    #[arg(long, env = "H60_ADDRESS")]
    pub http: Option<String>,

    #[clap(flatten)]
    pub mqtt: MqttArgs,

    /// The heat pump device id used in MQTT topics (`<device-id>/HP/...`).
    ///
    /// Learned from the first received message when not given. Writes are rejected until then.
    #[arg(long, env = "H60_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Consider an HTTP request failed if it does not complete in this amount of time.
    #[arg(long, default_value = "5s")]
    pub request_timeout: humantime::Duration,

    /// How often to poll the H60 gateway over HTTP.
    #[arg(long, default_value = "30s")]
    pub poll_period: humantime::Duration,
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::MqttArgs")]
pub struct MqttArgs {
    /// The MQTT broker host.
    #[arg(long, env = "MQTT_HOST")]
    pub mqtt_host: Option<String>,
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "controller.climate_control")]
    pub mqtt_client_id: String,
    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,
    #[arg(long, env = "MQTT_PASSWORD", default_value = "")]
    pub mqtt_password: String,
    /// Warn when no message arrives from the broker for this long.
    #[arg(long, default_value = "10min")]
    pub idle_timeout: humantime::Duration,
}

impl MqttArgs {
    /// Create the client and its event loop, if a broker is configured.
    ///
    /// Nothing is sent to the broker until the event loop is polled.
    pub fn client(&self) -> Option<(AsyncClient, EventLoop)> {
        let host = self.mqtt_host.as_ref()?;
        let mut options = MqttOptions::new(&self.mqtt_client_id, host, self.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &self.mqtt_username {
            options.set_credentials(username, &self.mqtt_password);
        }
        Some(AsyncClient::new(options, MQTT_REQUEST_CAPACITY))
    }
}

/// Polls `http://<address>/api/alldata` and writes through `http://<address>/api/set`.
pub struct HttpTransport {
    address: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(address: &str, timeout: Duration) -> Result<Self, Error> {
        if reqwest::Url::parse(&format!("http://{address}/api/")).is_err() {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(Error::CreateReqwest)?;
        Ok(Self { address: address.to_string(), client })
    }
}

impl Transport for HttpTransport {
    const REQUIRES_IDENTITY: bool = false;

    async fn fetch_all(&self) -> Result<Option<BTreeMap<String, String>>, Error> {
        let url = format!("http://{}/api/alldata", self.address);
        let resp = self.client.get(url).send().await.map_err(Error::HttpRead)?;
        let resp = resp.error_for_status().map_err(Error::HttpRead)?;
        let resp = resp.json::<serde_json::Value>().await.map_err(Error::HttpJsonDecode)?;
        parse_snapshot(&resp).map(Some)
    }

    async fn send_set(&self, _device: Option<&str>, id: &str, raw: &str) -> Result<(), Error> {
        let url = format!("http://{}/api/set", self.address);
        let resp = self
            .client
            .get(url)
            .query(&[("idx", id), ("val", raw)])
            .send()
            .await
            .map_err(Error::HttpWrite)?;
        resp.error_for_status().map_err(Error::HttpWrite)?;
        debug!(register = id, raw, "sent set command over HTTP");
        Ok(())
    }
}

/// Interpret the `alldata` response: an object mapping register indices to raw values.
///
/// The gateway firmware reports values as strings, but numbers are accepted as well.
fn parse_snapshot(resp: &serde_json::Value) -> Result<BTreeMap<String, String>, Error> {
    let obj = resp.as_object().ok_or(Error::HttpResponseIsntObject)?;
    let values = obj
        .iter()
        .filter_map(|(k, v)| {
            let raw = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => {
                    warn!(key = k, unexpected_val = ?v, "register value isn't a string or number");
                    return None;
                }
            };
            Some((k.clone(), raw))
        })
        .collect();
    Ok(values)
}

/// Publishes set commands to `<device-id>/HP/SET/<register>`.
///
/// Register values arrive through the event loop, see [`crate::mqtt::Router`].
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    /// Topic filter covering the register values of `device`, or of any device when not known.
    pub fn topic_filter(device: Option<&str>) -> String {
        format!("{}/HP/#", device.unwrap_or("+"))
    }
}

impl Transport for MqttTransport {
    const REQUIRES_IDENTITY: bool = true;

    async fn fetch_all(&self) -> Result<Option<BTreeMap<String, String>>, Error> {
        Ok(None)
    }

    async fn send_set(&self, device: Option<&str>, id: &str, raw: &str) -> Result<(), Error> {
        let device = device.ok_or(Error::UnknownDevice)?;
        let topic = format!("{device}/HP/SET/{id}");
        // Fails instead of waiting when the queue is full, e.g. while the broker is unreachable.
        self.client
            .try_publish(topic.clone(), QoS::AtMostOnce, false, raw.to_string())
            .map_err(Error::MqttPublish)?;
        debug!(topic, raw, "queued set command");
        Ok(())
    }
}
