//! Integration tests for the metadata watcher against a fake metadata server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gce_metadata::{
    fetch_snapshot, ClientConfig, MetadataClient, MetadataDocument, MetadataWatcher, Subscriber,
    WatcherConfig,
};
use tokio::sync::watch;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Records the `step` attribute of every document it sees.
struct Recorder {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Subscriber for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_metadata(&mut self, document: &MetadataDocument) {
        let step = document
            .instance_attributes()
            .and_then(|a| a.get("step"))
            .unwrap_or("-")
            .to_string();
        self.log.lock().unwrap().push(format!("{}:{}", self.name, step));
    }
}

/// Signals shutdown after seeing `limit` documents.
struct Stopper {
    seen: usize,
    limit: usize,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Subscriber for Stopper {
    fn name(&self) -> &str {
        "stopper"
    }

    async fn on_metadata(&mut self, _document: &MetadataDocument) {
        self.seen += 1;
        if self.seen >= self.limit {
            let _ = self.shutdown.send(true);
        }
    }
}

/// Formatted log output of the current thread.
#[derive(Clone, Default)]
struct Logs(Arc<Mutex<Vec<u8>>>);

impl Logs {
    fn capture() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    fn count(&self, needle: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .filter(|l| l.contains(needle))
            .count()
    }
}

impl std::io::Write for Logs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Logs {
    type Writer = Logs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn doc(step: &str) -> String {
    format!(r#"{{"instance": {{"attributes": {{"step": "{}"}}}}}}"#, step)
}

fn watcher_for(server: &MockServer) -> MetadataWatcher {
    let client = MetadataClient::new(ClientConfig::with_base_url(server.uri())).unwrap();
    MetadataWatcher::new(
        client,
        WatcherConfig {
            retry_delay: Duration::from_millis(10),
        },
    )
}

async fn run_to_completion(watcher: MetadataWatcher, rx: watch::Receiver<bool>) {
    tokio::time::timeout(Duration::from_secs(10), watcher.run(rx))
        .await
        .expect("watcher did not stop");
}

#[tokio::test]
async fn test_etag_carried_to_next_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("last_etag", "NONE"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "e1")
                .set_body_string(doc("1")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("last_etag", "e1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "e2")
                .set_body_string(doc("2")),
        )
        .mount(&server)
        .await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = watch::channel(false);

    let mut watcher = watcher_for(&server);
    watcher.subscribe(Recorder {
        name: "rec".to_string(),
        log: Arc::clone(&log),
    });
    watcher.subscribe(Stopper {
        seen: 0,
        limit: 2,
        shutdown: tx,
    });

    run_to_completion(watcher, rx).await;

    assert_eq!(*log.lock().unwrap(), vec!["rec:1", "rec:2"]);
}

#[tokio::test]
async fn test_subscribers_called_in_registration_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "e1")
                .set_body_string(doc("1")),
        )
        .mount(&server)
        .await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = watch::channel(false);

    let mut watcher = watcher_for(&server);
    for name in ["accounts", "addresses", "updates"] {
        watcher.subscribe(Recorder {
            name: name.to_string(),
            log: Arc::clone(&log),
        });
    }
    watcher.subscribe(Stopper {
        seen: 0,
        limit: 1,
        shutdown: tx,
    });

    assert_eq!(
        watcher.subscriber_names(),
        vec!["accounts", "addresses", "updates", "stopper"]
    );

    run_to_completion(watcher, rx).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["accounts:1", "addresses:1", "updates:1"]
    );
}

#[tokio::test]
async fn test_failed_request_resets_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("last_etag", "NONE"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "e1")
                .set_body_string(doc("1")),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("last_etag", "e1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("last_etag", "NONE"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "e2")
                .set_body_string(doc("2")),
        )
        .mount(&server)
        .await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = watch::channel(false);

    let mut watcher = watcher_for(&server);
    watcher.subscribe(Recorder {
        name: "rec".to_string(),
        log: Arc::clone(&log),
    });
    watcher.subscribe(Stopper {
        seen: 0,
        limit: 2,
        shutdown: tx,
    });

    run_to_completion(watcher, rx).await;

    assert_eq!(*log.lock().unwrap(), vec!["rec:1", "rec:2"]);
}

#[tokio::test]
async fn test_outage_and_recovery_logged_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "e1")
                .set_body_string(doc("1")),
        )
        .mount(&server)
        .await;

    let (logs, _guard) = Logs::capture();
    let (tx, rx) = watch::channel(false);

    let mut watcher = watcher_for(&server);
    watcher.subscribe(Stopper {
        seen: 0,
        limit: 1,
        shutdown: tx,
    });

    run_to_completion(watcher, rx).await;

    assert_eq!(logs.count("Error waiting for metadata change"), 1);
    assert_eq!(logs.count("Network access restored"), 1);
}

#[tokio::test]
async fn test_malformed_document_skipped_without_publishing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("last_etag", "NONE"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "e1")
                .set_body_string("{not json"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("last_etag", "e1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "e2")
                .set_body_string(doc("2")),
        )
        .mount(&server)
        .await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = watch::channel(false);

    let mut watcher = watcher_for(&server);
    watcher.subscribe(Recorder {
        name: "rec".to_string(),
        log: Arc::clone(&log),
    });
    watcher.subscribe(Stopper {
        seen: 0,
        limit: 1,
        shutdown: tx,
    });

    run_to_completion(watcher, rx).await;

    assert_eq!(*log.lock().unwrap(), vec!["rec:2"]);
}

#[tokio::test]
async fn test_shutdown_before_start_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(doc("1")))
        .expect(0)
        .mount(&server)
        .await;

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    run_to_completion(watcher_for(&server), rx).await;
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = MetadataClient::new(ClientConfig::with_base_url(server.uri())).unwrap();
    let watcher = MetadataWatcher::new(
        client,
        WatcherConfig {
            retry_delay: Duration::from_secs(60),
        },
    );

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(watcher.run(rx));

    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("watcher did not observe shutdown during backoff")
        .unwrap();
}

#[tokio::test]
async fn test_fetch_snapshot_skips_empty_and_failed_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(doc("snap")))
        .mount(&server)
        .await;

    let client = MetadataClient::new(ClientConfig::with_base_url(server.uri())).unwrap();
    let config = WatcherConfig {
        retry_delay: Duration::from_millis(10),
    };

    let document = tokio::time::timeout(Duration::from_secs(10), fetch_snapshot(&client, &config))
        .await
        .unwrap();

    assert_eq!(
        document.instance_attributes().and_then(|a| a.get("step")),
        Some("snap")
    );
}
