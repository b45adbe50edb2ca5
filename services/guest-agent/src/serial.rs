//! Structured side channel.
//!
//! Credential disclosures and the startup notice are written as
//! newline-delimited JSON objects to a serial port that the host side reads.
//! Nothing else is ever written there.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Line-oriented output channel.
#[async_trait]
pub trait SideChannel: Send + Sync {
    /// Write one line. The channel appends the terminator.
    async fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Serialize `message` and write it as one line.
pub async fn send<T: Serialize + Sync>(channel: &dyn SideChannel, message: &T) -> Result<()> {
    let json = serde_json::to_string(message).context("failed to serialize side-channel message")?;
    channel
        .write_line(&json)
        .await
        .context("failed to write side-channel message")?;
    Ok(())
}

/// Result of creating or resetting an account for a windows-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialReport {
    pub password_found: bool,
    pub exponent: String,
    pub modulus: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_function: Option<String>,
}

/// Agent readiness notice, sent once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub ready: bool,
    pub version: String,
}

impl StartupReport {
    pub fn ready(version: impl Into<String>) -> Self {
        Self {
            ready: true,
            version: version.into(),
        }
    }
}

/// Side channel backed by a serial device (or any appendable file).
///
/// The device is opened for every line so a port that appears late, or is
/// reset underneath the agent, does not wedge the channel.
pub struct SerialPort {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SerialPort {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl SideChannel for SerialPort {
    async fn write_line(&self, line: &str) -> io::Result<()> {
        let _guard = self.lock.lock().await;

        let mut port = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');
        port.write_all(&framed).await?;
        port.flush().await?;

        debug!(port = %self.path.display(), bytes = line.len(), "Wrote side-channel message");
        Ok(())
    }
}
