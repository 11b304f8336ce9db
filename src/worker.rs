//! Per-feed unit of work: mark the feed fetched, read it, store new posts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::{Feed, NewPost, Store, StoreError};
use crate::reader::FeedReader;

/// Published once per worker run, whatever the outcome.
#[derive(Debug, Clone)]
pub struct FeedFetched {
    pub feed_id: i64,
    pub feed_name: String,
    /// Timestamp passed to `mark_feed_fetched`
    pub fetched_at: DateTime<Utc>,
    pub outcome: FetchOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The timestamp write failed, so the feed was not fetched
    MarkFailed(String),
    /// The feed was marked fetched but reading it failed
    FetchFailed(String),
    Stored(StoreSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    /// Items in the fetched document
    pub found: usize,
    pub inserted: usize,
    /// Items whose url was already stored
    pub duplicates: usize,
    /// Items without a link
    pub skipped: usize,
    /// Items dropped because of a storage error
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub fetch_timeout: Duration,
    pub store_timeout: Duration,
}

#[derive(Clone)]
pub struct FetchWorker {
    store: Arc<dyn Store>,
    reader: FeedReader,
    settings: WorkerSettings,
    events: broadcast::Sender<FeedFetched>,
}

impl FetchWorker {
    pub fn new(
        store: Arc<dyn Store>,
        reader: FeedReader,
        settings: WorkerSettings,
        events: broadcast::Sender<FeedFetched>,
    ) -> Self {
        Self {
            store,
            reader,
            settings,
            events,
        }
    }

    /// Runs the feed through mark, fetch and store. Failures are logged and
    /// reported in the returned event, never propagated.
    pub async fn run(&self, feed: Feed) -> FeedFetched {
        let fetched_at = Utc::now();
        let outcome = self.process(&feed, fetched_at).await;
        let event = FeedFetched {
            feed_id: feed.id,
            feed_name: feed.name,
            fetched_at,
            outcome,
        };
        // No subscribers is fine
        let _ = self.events.send(event.clone());
        event
    }

    async fn process(&self, feed: &Feed, now: DateTime<Utc>) -> FetchOutcome {
        let marked = self
            .with_deadline(self.store.mark_feed_fetched(feed.id, now))
            .await;
        if let Err(e) = marked {
            error!("Error marking feed '{}' as fetched: {}", feed.name, e);
            return FetchOutcome::MarkFailed(e.to_string());
        }

        debug!(feed = %feed.url, "Fetching feed");
        let channel = match self.reader.fetch(&feed.url, self.settings.fetch_timeout).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Error fetching feed '{}': {}", feed.name, e);
                return FetchOutcome::FetchFailed(e.to_string());
            }
        };

        let mut summary = StoreSummary {
            found: channel.items.len(),
            ..Default::default()
        };

        for item in &channel.items {
            let url = item.link.trim();
            if url.is_empty() {
                debug!(feed = %feed.url, title = %item.title, "Skipping item with no link");
                summary.skipped += 1;
                continue;
            }

            let post = NewPost {
                feed_id: feed.id,
                title: item.title.trim(),
                url,
                description: Some(item.description.trim()).filter(|d| !d.is_empty()),
                published_at: item.published_at(),
            };

            match self.with_deadline(self.store.insert_post(post)).await {
                Ok(_) => summary.inserted += 1,
                Err(StoreError::Duplicate { .. }) => summary.duplicates += 1,
                Err(e) => {
                    error!("Error storing post '{}' from '{}': {}", item.title, feed.name, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Found {} posts in '{}' ({} new, {} already stored)",
            summary.found, feed.name, summary.inserted, summary.duplicates
        );
        FetchOutcome::Stored(summary)
    }

    async fn with_deadline<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.settings.store_timeout, op)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }
}
