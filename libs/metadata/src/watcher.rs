//! The perpetual metadata poll loop.
//!
//! One watcher runs per agent. It waits for the next document, publishes
//! it to every subscriber in registration order, and goes back to waiting.
//! Publishing is synchronous with respect to polling: a slow subscriber
//! delays the next request, so subscribers never observe documents
//! concurrently or out of order.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{ChangeToken, MetadataClient};
use crate::document::MetadataDocument;
use crate::error::MetadataError;

/// Receives every document the watcher publishes.
///
/// Implementations own their failure handling: the watcher does not
/// inspect results, and a subscriber must not let one bad document stop
/// the loop.
#[async_trait]
pub trait Subscriber: Send {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Handle one published document.
    async fn on_metadata(&mut self, document: &MetadataDocument);
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Fixed delay after a failed request before trying again.
    pub retry_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Reports network failures once, and recovery once.
#[derive(Debug, Default)]
struct ConnectivityLog {
    failing: bool,
}

impl ConnectivityLog {
    /// Record a failed request. Returns true if a line was logged.
    fn failed(&mut self, err: &MetadataError) -> bool {
        if self.failing {
            debug!(error = %err, "Metadata request failed again");
            return false;
        }
        self.failing = true;
        warn!(error = %err, "Error waiting for metadata change, will keep retrying");
        true
    }

    /// Record a successful request. Returns true if a line was logged.
    fn succeeded(&mut self) -> bool {
        if !self.failing {
            return false;
        }
        self.failing = false;
        info!("Network access restored");
        true
    }
}

/// Long-polls the metadata server and fans documents out to subscribers.
pub struct MetadataWatcher {
    client: MetadataClient,
    config: WatcherConfig,
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl MetadataWatcher {
    /// Create a watcher with no subscribers.
    pub fn new(client: MetadataClient, config: WatcherConfig) -> Self {
        Self {
            client,
            config,
            subscribers: Vec::new(),
        }
    }

    /// Register a subscriber. Subscribers are invoked in registration order.
    pub fn subscribe(&mut self, subscriber: impl Subscriber + 'static) {
        debug!(subscriber = subscriber.name(), "Subscriber registered");
        self.subscribers.push(Box::new(subscriber));
    }

    /// Names of registered subscribers, in invocation order.
    pub fn subscriber_names(&self) -> Vec<&str> {
        self.subscribers.iter().map(|s| s.name()).collect()
    }

    /// Run the poll loop until shutdown is signalled.
    ///
    /// The signal is checked at the top of every iteration and during the
    /// retry backoff. A request that is already in flight is allowed to
    /// finish; its latency is bounded by the client's request timeout.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            subscribers = ?self.subscriber_names(),
            retry_delay_secs = self.config.retry_delay.as_secs(),
            "Starting metadata watcher"
        );

        let mut token = ChangeToken::none();
        let mut connectivity = ConnectivityLog::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.client.fetch_once(&token).await {
                Ok(response) => {
                    connectivity.succeeded();
                    token = response.token;

                    if response.body.is_empty() {
                        debug!("Empty metadata response, waiting again");
                        continue;
                    }

                    match MetadataDocument::from_slice(&response.body) {
                        Ok(document) => self.publish(&document).await,
                        Err(e) => error!(error = %e, "Failed to parse metadata document"),
                    }
                }
                Err(e) => {
                    token = ChangeToken::none();
                    connectivity.failed(&e);
                    if backoff(self.config.retry_delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Metadata watcher stopped");
    }

    async fn publish(&mut self, document: &MetadataDocument) {
        for subscriber in self.subscribers.iter_mut() {
            debug!(subscriber = subscriber.name(), "Publishing metadata");
            subscriber.on_metadata(document).await;
        }
    }
}

/// Sleep for `delay`, returning early with `true` if shutdown is signalled.
async fn backoff(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        changed = shutdown.changed() => {
            if changed.is_err() {
                // Sender is gone; nobody can signal shutdown any more.
                tokio::time::sleep(delay).await;
            }
        }
    }
    *shutdown.borrow()
}

/// Fetch exactly one document, retrying until a non-empty, parseable
/// response arrives.
///
/// Used by one-shot callers that need the current metadata and then exit.
/// There is no cancellation: the call returns only with a document.
pub async fn fetch_snapshot(client: &MetadataClient, config: &WatcherConfig) -> MetadataDocument {
    let mut token = ChangeToken::none();
    let mut connectivity = ConnectivityLog::default();

    loop {
        match client.fetch_once(&token).await {
            Ok(response) => {
                connectivity.succeeded();
                token = response.token;

                if response.body.is_empty() {
                    continue;
                }

                match MetadataDocument::from_slice(&response.body) {
                    Ok(document) => return document,
                    Err(e) => error!(error = %e, "Failed to parse metadata document"),
                }
            }
            Err(e) => {
                token = ChangeToken::none();
                connectivity.failed(&e);
                tokio::time::sleep(config.retry_delay).await;
            }
        }
    }
}
