//! Sharing one MQTT broker connection between the gateway and the sensors.

use futures::{Stream, StreamExt as _};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::pin::pin;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub type Handler = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Ordered list of topic filters and the handlers interested in them.
#[derive(Default)]
pub struct Router {
    routes: Vec<(String, Handler)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every message whose topic matches `filter`.
    pub fn route(&mut self, filter: impl Into<String>, handler: Handler) -> &mut Self {
        self.routes.push((filter.into(), handler));
        self
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(filter, _)| filter.as_str())
    }

    /// Call every handler whose filter matches `topic`, in the order they were added.
    ///
    /// Returns the number of handlers called.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let mut handled = 0;
        for (filter, handler) in &self.routes {
            if rumqttc::v5::mqttbytes::matches(topic, filter) {
                handler(topic, payload);
                handled += 1;
            }
        }
        if handled == 0 {
            trace!(topic, "no route for message");
        }
        handled
    }

    /// Request a subscription for every routed filter.
    ///
    /// Must not block the event loop, which is the one draining the request queue.
    fn subscribe_all(&self, client: &AsyncClient) {
        for filter in self.filters() {
            match client.try_subscribe(filter, QoS::AtMostOnce) {
                Ok(()) => debug!(filter, "subscribing"),
                Err(e) => warn!(
                    message = "could not request a subscription",
                    filter,
                    error = (&e as &dyn std::error::Error)
                ),
            }
        }
    }
}

/// Stream of messages published to us, polling `eventloop` in the process.
///
/// Connection errors are logged and the connection is retried after a short delay, so the
/// stream never ends. `on_connect` is called on every (re)connection.
pub fn publishes(
    mut eventloop: EventLoop,
    idle_timeout: Duration,
    on_connect: impl Fn() + Send + 'static,
) -> impl Stream<Item = Publish> + Send {
    async_stream::stream! {
        let mut last_message = Instant::now();
        let mut stale = false;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    last_message = Instant::now();
                    stale = false;
                    yield publish;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to the MQTT broker");
                    on_connect();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        message = "MQTT connection failed, retrying",
                        delay = ?RECONNECT_DELAY,
                        error = (&e as &dyn std::error::Error)
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
            let idle = last_message.elapsed();
            if !stale && idle > idle_timeout {
                stale = true;
                warn!(?idle, "no messages from the MQTT broker, the publishers may be down");
            }
        }
    }
}

/// Poll the broker connection forever, handing every message to `router`.
///
/// Subscriptions for all routed filters are (re)established whenever the connection is.
pub async fn run_event_loop(
    client: AsyncClient,
    eventloop: EventLoop,
    router: Router,
    idle_timeout: Duration,
) {
    let router = std::sync::Arc::new(router);
    let on_connect = {
        let router = std::sync::Arc::clone(&router);
        move || router.subscribe_all(&client)
    };
    let mut messages = pin!(publishes(eventloop, idle_timeout, on_connect));
    while let Some(publish) = messages.next().await {
        let Ok(topic) = std::str::from_utf8(&publish.topic) else {
            warn!(topic = ?publish.topic, "message topic is not valid UTF-8");
            continue;
        };
        router.dispatch(topic, &publish.payload);
    }
}
