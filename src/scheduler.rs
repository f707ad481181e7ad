use crate::strategy::{Status, Strategy};
use futures::FutureExt as _;
use jiff::Zoned;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Runs registered strategies whenever they report themselves triggerable.
///
/// Strategies are visited sequentially in registration order, so a slow trigger delays the
/// strategies after it but never overlaps with another trigger.
pub struct Scheduler {
    strategies: Vec<Box<dyn Strategy>>,
    interval: Duration,
    running: Arc<AtomicBool>,
    statuses: watch::Sender<Vec<Status>>,
}

/// Asks a running [`Scheduler`] to stop.
///
/// The request is observed before the next tick; a trigger that is already running completes.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            strategies: Vec::new(),
            interval,
            running: Arc::new(AtomicBool::new(true)),
            statuses: watch::Sender::new(Vec::new()),
        }
    }

    /// Add a strategy, unless one with the same name is already registered.
    pub fn register(&mut self, strategy: Box<dyn Strategy>) -> bool {
        if self.strategies.iter().any(|s| s.name() == strategy.name()) {
            debug!(strategy = strategy.name(), "strategy is already registered");
            return false;
        }
        info!(strategy = strategy.name(), "registered strategy");
        self.strategies.push(strategy);
        true
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Latest statuses, updated after every tick.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Status>> {
        self.statuses.subscribe()
    }

    pub fn statuses(&self, now: &Zoned) -> Vec<Status> {
        self.strategies.iter().map(|s| s.status(now)).collect()
    }

    pub async fn tick(&mut self, now: &Zoned) {
        for strategy in &mut self.strategies {
            if !strategy.is_triggerable(now) {
                continue;
            }
            debug!(strategy = strategy.name(), "triggering strategy");
            let outcome = AssertUnwindSafe(strategy.trigger(now)).catch_unwind().await;
            if let Err(panic) = outcome {
                let message = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("<non-string panic payload>");
                error!(strategy = strategy.name(), panic = message, "strategy trigger panicked");
            }
        }
        self.statuses.send_replace(self.statuses(now));
    }

    /// Tick every interval until stopped through a [`StopHandle`].
    pub async fn run(&mut self) {
        info!(interval = ?self.interval, strategies = self.strategies.len(), "scheduler started");
        while self.running.load(Ordering::Acquire) {
            tokio::time::sleep(self.interval).await;
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            self.tick(&Zoned::now()).await;
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Phase;
    use futures::future::BoxFuture;
    use jiff::tz::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        eligible: bool,
        panics: bool,
        log: Log,
    }

    impl Recording {
        fn boxed(name: &'static str, log: &Log) -> Box<dyn Strategy> {
            Box::new(Recording { name, eligible: true, panics: false, log: Arc::clone(log) })
        }
    }

    impl Strategy for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn is_triggerable(&self, _: &Zoned) -> bool {
            self.eligible
        }

        fn trigger<'a>(&'a mut self, _: &'a Zoned) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                if self.panics {
                    panic!("{} exploded", self.name);
                }
                self.log.lock().unwrap().push(self.name.to_string());
            })
        }

        fn status(&self, _: &Zoned) -> Status {
            Status {
                name: self.name.to_string(),
                phase: Phase::Idle,
                last_trigger: None,
                values: BTreeMap::new(),
            }
        }
    }

    fn now() -> Zoned {
        jiff::civil::date(2024, 3, 1).at(12, 0, 0, 0).to_zoned(TimeZone::UTC).unwrap()
    }

    #[tokio::test]
    async fn duplicate_names_register_once() {
        let log = Log::default();
        let mut scheduler = Scheduler::default();
        assert!(scheduler.register(Recording::boxed("a", &log)));
        assert!(!scheduler.register(Recording::boxed("a", &log)));
        assert_eq!(scheduler.len(), 1);
        scheduler.tick(&now()).await;
        assert_eq!(*log.lock().unwrap(), ["a"]);
    }

    #[tokio::test]
    async fn triggers_in_registration_order() {
        let log = Log::default();
        let mut scheduler = Scheduler::default();
        scheduler.register(Recording::boxed("b", &log));
        scheduler.register(Recording::boxed("a", &log));
        scheduler.register(Box::new(Recording {
            name: "idle",
            eligible: false,
            panics: false,
            log: Arc::clone(&log),
        }));
        scheduler.register(Recording::boxed("c", &log));
        scheduler.tick(&now()).await;
        assert_eq!(*log.lock().unwrap(), ["b", "a", "c"]);
        let names = scheduler.statuses(&now()).into_iter().map(|s| s.name).collect::<Vec<_>>();
        assert_eq!(names, ["b", "a", "idle", "c"]);
    }

    #[tokio::test]
    async fn panicking_strategy_does_not_stop_the_others() {
        let log = Log::default();
        let mut scheduler = Scheduler::default();
        scheduler.register(Box::new(Recording {
            name: "broken",
            eligible: true,
            panics: true,
            log: Arc::clone(&log),
        }));
        scheduler.register(Recording::boxed("fine", &log));
        scheduler.tick(&now()).await;
        scheduler.tick(&now()).await;
        assert_eq!(*log.lock().unwrap(), ["fine", "fine"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_next_tick() {
        let log = Log::default();
        let mut scheduler = Scheduler::new(Duration::from_secs(1));
        scheduler.register(Recording::boxed("a", &log));
        let stop = scheduler.stop_handle();
        let mut statuses = scheduler.subscribe();
        let task = tokio::spawn(async move {
            scheduler.run().await;
            scheduler
        });
        statuses.changed().await.unwrap();
        assert_eq!(statuses.borrow().len(), 1);
        stop.stop();
        let scheduler = task.await.unwrap();
        let ticks = log.lock().unwrap().len();
        assert!(ticks >= 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(log.lock().unwrap().len(), ticks);
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn stopped_before_running_returns_immediately() {
        let mut scheduler = Scheduler::new(Duration::from_millis(1));
        scheduler.stop_handle().stop();
        scheduler.run().await;
        assert!(scheduler.is_empty());
    }
}
