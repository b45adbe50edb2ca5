//! Reconciliation loop primitives.
//!
//! Each domain the agent manages (accounts, forwarded addresses, update
//! policy) is a [`Reader`] + [`Writer`] pair. A [`Manager`] wraps one pair
//! and turns the stream of published metadata documents into at most one
//! `apply` per actual change:
//!
//! - **Desired state**: the value a [`Reader`] extracts from the latest document.
//! - **Applied state**: the value the [`Writer`] last pushed successfully.
//! - **Convergence**: apply only when desired differs from applied.
//!
//! # Invariants
//!
//! - A Manager never applies a value equal to its cached value
//! - The cache is replaced only after `apply` succeeds
//! - A failure (error or panic) in one Manager never escapes it

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use async_trait::async_trait;
use futures_util::FutureExt;
use gce_metadata::{MetadataDocument, Subscriber};
use tracing::{debug, error, info};

/// Extracts and compares one domain's desired state.
pub trait Reader<T>: Send + Sync {
    /// Desired state from the document.
    ///
    /// `None` means the field is absent and the domain should be left
    /// untouched. It is not the same as an empty value.
    fn extract(&self, document: &MetadataDocument) -> Option<T>;

    /// Domain equality. Must be reflexive, symmetric, and order-insensitive
    /// for collection values. Two `None`s are equal; `None` never equals `Some`.
    fn equal(&self, a: Option<&T>, b: Option<&T>) -> bool;

    /// Whether the domain is enabled for this document. Defaults to enabled
    /// when the disable flag is missing.
    fn is_enabled(&self, document: &MetadataDocument) -> bool;
}

/// Pushes one domain's desired state to the external system.
///
/// `apply` must be idempotent: a previous partial failure can lead to the
/// same value being applied again.
#[async_trait]
pub trait Writer<T>: Send + Sync {
    async fn apply(&self, desired: &T) -> anyhow::Result<()>;
}

/// What a single reconcile pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The domain is disabled for this document.
    Disabled,
    /// The document does not carry the domain's field.
    Absent,
    /// Desired state equals the cached applied state.
    Unchanged,
    /// The writer applied a new value and the cache was updated.
    Applied,
    /// The writer failed or panicked; the cache is untouched.
    Failed,
}

/// Per-domain control loop.
///
/// Owns the cached applied value exclusively; it is only ever touched from
/// the watcher task, so no locking is needed.
pub struct Manager<T, R, W> {
    name: &'static str,
    cached: Option<T>,
    enabled: bool,
    reader: R,
    writer: W,
}

impl<T, R, W> Manager<T, R, W>
where
    T: Send + Sync,
    R: Reader<T>,
    W: Writer<T>,
{
    /// Create a manager whose cache starts at the domain's zero value.
    pub fn new(name: &'static str, zero: T, reader: R, writer: W) -> Self {
        install_panic_capture();
        Self {
            name,
            cached: Some(zero),
            enabled: true,
            reader,
            writer,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The last successfully applied value.
    pub fn cached(&self) -> Option<&T> {
        self.cached.as_ref()
    }

    /// Enabled state as of the last document.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Run one reconcile pass for a published document.
    ///
    /// Never fails: errors and panics from the domain are logged here.
    pub async fn reconcile(&mut self, document: &MetadataDocument) -> SyncOutcome {
        let name = self.name;
        match AssertUnwindSafe(self.sync(document)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(
                    domain = name,
                    error = %e,
                    details = ?e,
                    "Failed to apply desired state, will retry on next change"
                );
                SyncOutcome::Failed
            }
            Err(panic) => {
                let details = take_panic_details().unwrap_or_else(|| "no stack captured".to_string());
                error!(
                    domain = name,
                    panic = %panic_message(panic.as_ref()),
                    details = %details,
                    "Reconciler panicked, will retry on next change"
                );
                SyncOutcome::Failed
            }
        }
    }

    async fn sync(&mut self, document: &MetadataDocument) -> anyhow::Result<SyncOutcome> {
        let enabled = self.reader.is_enabled(document);
        if enabled != self.enabled {
            info!(
                domain = self.name,
                status = if enabled { "enabled" } else { "disabled" },
                "Manager status changed"
            );
            self.enabled = enabled;
        }

        if !enabled {
            return Ok(SyncOutcome::Disabled);
        }

        let Some(desired) = self.reader.extract(document) else {
            debug!(domain = self.name, "Field absent, leaving domain untouched");
            return Ok(SyncOutcome::Absent);
        };

        if self.reader.equal(self.cached.as_ref(), Some(&desired)) {
            return Ok(SyncOutcome::Unchanged);
        }

        self.writer.apply(&desired).await?;
        self.cached = Some(desired);

        debug!(domain = self.name, "Desired state applied");
        Ok(SyncOutcome::Applied)
    }
}

#[async_trait]
impl<T, R, W> Subscriber for Manager<T, R, W>
where
    T: Send + Sync,
    R: Reader<T>,
    W: Writer<T>,
{
    fn name(&self) -> &str {
        self.name
    }

    async fn on_metadata(&mut self, document: &MetadataDocument) {
        self.reconcile(document).await;
    }
}

thread_local! {
    static PANIC_DETAILS: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records where the panic happened and the stack,
/// for the thread that panicked. The previous hook still runs.
fn install_panic_capture() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown location".to_string());
            let details = format!("at {location}\n{}", Backtrace::force_capture());
            PANIC_DETAILS.with(|slot| *slot.borrow_mut() = Some(details));
            previous(info);
        }));
    });
}

/// Location and stack of the last panic on this thread, if any.
fn take_panic_details() -> Option<String> {
    PANIC_DETAILS.with(|slot| slot.borrow_mut().take())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
