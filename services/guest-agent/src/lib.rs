//! Compute Engine guest agent.
//!
//! Keeps local accounts, forwarded IPs, and the update policy in sync with
//! the metadata server. One watcher task long-polls the server and hands
//! every document to three [`gce_reconcile::Manager`]s:
//!
//! - **accounts**: `windows-keys` entries become local admin accounts
//! - **addresses**: `forwardedIps` per NIC become local routes
//! - **updates**: `disable-agent-updates` becomes an updater marker
//!
//! OS side effects go through the capability traits in [`os`]; the fakes
//! in [`testing`] stand in for them in tests.

pub mod accounts;
pub mod addresses;
pub mod config;
pub mod logging;
pub mod os;
pub mod serial;
pub mod service;
pub mod state;
pub mod testing;
pub mod updates;
