//! Durable side-store for applied state.
//!
//! Writers record what they actually applied here so that diffing still
//! works after the agent restarts and its in-memory caches are gone.
//! Values live under a path (namespace) and a name, mirroring a
//! registry-style key/value area.

mod store;

pub use store::{SideStore, SqliteSideStore, StoreError};

/// Namespace shared by the account and address reconcilers.
pub const AGENT_PATH: &str = "compute-engine";

/// Serialized windows-keys that have been applied.
pub const PUBLIC_KEYS: &str = "PublicKeys";

/// Forwarded IPs the agent has bound.
pub const FORWARDED_IPS: &str = "ForwardedIps";

/// Update client state for the agent's application id.
pub const UPDATE_CLIENT_STATE_PATH: &str =
    "update/client-state/{3FCD4520-3859-4183-866E-C54153A286EB}";

/// Additional-parameters value read by the updater (`enabled` / `disabled`).
pub const UPDATE_CHANNEL: &str = "ap";
