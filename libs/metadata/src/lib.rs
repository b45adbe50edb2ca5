//! # gce-metadata
//!
//! Client and watcher for the instance metadata server.
//!
//! The metadata server is the single source of truth for the guest agent.
//! This crate knows how to:
//!
//! - Issue the hanging GET (`wait_for_change=true`) and track the ETag
//!   change token between requests
//! - Parse the recursive JSON document into an immutable [`MetadataDocument`]
//! - Run the perpetual poll loop and publish every new document to the
//!   registered [`Subscriber`]s, in registration order
//! - Fetch exactly one document for one-shot callers ([`fetch_snapshot`])
//!
//! Reconciliation itself lives in `gce-reconcile`; this crate only moves
//! documents from the server to subscribers.

mod client;
mod document;
mod error;
mod watcher;

pub use client::{ChangeToken, ClientConfig, FetchResponse, MetadataClient, DEFAULT_METADATA_URL};
pub use document::{Attributes, Instance, MetadataDocument, NetworkInterface, Project};
pub use error::MetadataError;
pub use watcher::{fetch_snapshot, MetadataWatcher, Subscriber, WatcherConfig};
