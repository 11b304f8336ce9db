//! Fixed-delay aggregation loop.
//!
//! Each tick selects up to `concurrency` stale feeds, runs one
//! [`FetchWorker`](crate::worker::FetchWorker) per feed in parallel and waits
//! for all of them before sleeping for `interval`. A slow tick delays the next
//! one; ticks never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::db::Store;
use crate::reader::FeedReader;
use crate::worker::{FeedFetched, FetchWorker, WorkerSettings};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct AggregatorSettings {
    pub interval: Duration,
    /// Upper bound on feeds per tick, and so on workers in flight
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub store_timeout: Duration,
}

/// Fires a [`Shutdown`] signal.
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Cooperative stop signal, checked between ticks and before each worker dispatch.
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger(tx), Shutdown(rx))
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the trigger fires. Never resolves if the trigger is
    /// dropped without firing.
    pub async fn triggered(&mut self) {
        let closed = self.0.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub selected: usize,
    pub dispatched: usize,
    pub results: Vec<FeedFetched>,
}

pub struct Aggregator {
    store: Arc<dyn Store>,
    worker: FetchWorker,
    settings: AggregatorSettings,
    events: broadcast::Sender<FeedFetched>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn Store>, reader: FeedReader, settings: AggregatorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let worker = FetchWorker::new(
            store.clone(),
            reader,
            WorkerSettings {
                fetch_timeout: settings.fetch_timeout,
                store_timeout: settings.store_timeout,
            },
            events.clone(),
        );

        Self {
            store,
            worker,
            settings,
            events,
        }
    }

    /// A [`FeedFetched`] event is published after every worker run.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedFetched> {
        self.events.subscribe()
    }

    /// Ticks until `shutdown` fires. The first tick starts immediately.
    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(
            "Collecting feeds every {:?} with concurrency {}",
            self.settings.interval, self.settings.concurrency
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            self.tick(&shutdown).await;

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = shutdown.triggered() => break,
            }
        }

        info!("Aggregation loop stopped");
    }

    /// Selects stale feeds and fetches them, returning once every dispatched
    /// worker has finished.
    pub async fn tick(&self, shutdown: &Shutdown) -> TickReport {
        let selected = tokio::time::timeout(
            self.settings.store_timeout,
            self.store.select_stale_feeds(self.settings.concurrency),
        )
        .await;

        let feeds = match selected {
            Ok(Ok(feeds)) => feeds,
            Ok(Err(e)) => {
                error!("Error getting feeds: {}", e);
                return TickReport::default();
            }
            Err(_) => {
                error!("Timed out selecting feeds to fetch");
                return TickReport::default();
            }
        };

        if feeds.is_empty() {
            info!("No feeds to fetch");
            return TickReport::default();
        }

        let mut report = TickReport {
            selected: feeds.len(),
            ..Default::default()
        };
        info!("Fetching {} feeds concurrently", feeds.len());

        let mut workers = JoinSet::new();
        for feed in feeds.into_iter().take(self.settings.concurrency) {
            if shutdown.is_triggered() {
                info!("Shutdown requested, not dispatching remaining feeds");
                break;
            }
            let worker = self.worker.clone();
            workers.spawn(async move { worker.run(feed).await });
            report.dispatched += 1;
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(event) => report.results.push(event),
                Err(e) => warn!("Fetch worker did not complete: {}", e),
            }
        }

        report
    }
}
