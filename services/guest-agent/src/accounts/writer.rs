//! Account provisioning and encrypted credential disclosure.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gce_reconcile::Writer;
use tracing::{error, info, warn};

use super::crypto;
use super::key::WindowsKey;
use super::password;
use super::reader::KeySet;
use crate::os::{remove_partial_user, UserAccountError, UserAccountService};
use crate::serial::{self, CredentialReport, SideChannel};
use crate::state::{SideStore, AGENT_PATH, PUBLIC_KEYS};

/// Creates or resets local accounts for new windows-keys.
///
/// The generated password is only ever disclosed encrypted, on the side
/// channel. Keys that disappear from metadata are forgotten but their
/// accounts are left in place.
pub struct AccountsWriter {
    users: Arc<dyn UserAccountService>,
    channel: Arc<dyn SideChannel>,
    store: Arc<dyn SideStore>,
}

impl AccountsWriter {
    pub fn new(
        users: Arc<dyn UserAccountService>,
        channel: Arc<dyn SideChannel>,
        store: Arc<dyn SideStore>,
    ) -> Self {
        Self {
            users,
            channel,
            store,
        }
    }

    /// Keys recorded as applied. Lines that no longer parse are ignored.
    fn applied(&self) -> Result<HashSet<WindowsKey>> {
        let lines = self
            .store
            .get_multi(AGENT_PATH, PUBLIC_KEYS)
            .context("failed to read applied keys")?;
        Ok(lines
            .iter()
            .filter_map(|line| WindowsKey::from_line(line).ok())
            .collect())
    }

    /// Provision one key and report the outcome on the side channel.
    async fn provision(&self, key: &WindowsKey) {
        let report = match self.create_or_reset(key).await {
            Ok(report) => report,
            Err(e) => {
                warn!(user = %key.user_name, error = %e, "Failed to set up account");
                failure_report(key, &e)
            }
        };

        if let Err(e) = serial::send(self.channel.as_ref(), &report).await {
            error!(user = %key.user_name, error = %e, "Failed to report credentials");
        }
    }

    async fn create_or_reset(&self, key: &WindowsKey) -> Result<CredentialReport> {
        // Reject an unusable hash before touching the account.
        let hash = crypto::hash_function(key)?;

        let password = match self.set_credentials(&key.user_name).await {
            Err(e) if e.is_password_policy() => {
                info!(user = %key.user_name, "Password rejected by policy, retrying");
                self.set_credentials(&key.user_name).await?
            }
            other => other?,
        };

        let encrypted = crypto::encrypt_password(key, hash, &password)?;

        Ok(CredentialReport {
            password_found: true,
            exponent: key.exponent.clone(),
            modulus: key.modulus.clone(),
            user_name: key.user_name.clone(),
            encrypted_password: Some(encrypted),
            error_message: None,
            hash_function: key.hash_function.clone(),
        })
    }

    /// Create the user, or reset its password if it exists, with a fresh
    /// password. Returns the password on success.
    async fn set_credentials(&self, user: &str) -> Result<String, UserAccountError> {
        let password = password::generate();

        if self.users.user_exists(user).await? {
            info!(user, "Resetting password for existing user");
            self.users.set_password(user, &password).await?;
            self.users.add_to_admin_group(user).await?;
            return Ok(password);
        }

        info!(user, "Creating user");
        self.users.create_user(user, &password).await?;
        if let Err(e) = self.users.add_to_admin_group(user).await {
            remove_partial_user(self.users.as_ref(), user).await;
            return Err(e);
        }
        Ok(password)
    }
}

fn failure_report(key: &WindowsKey, err: &anyhow::Error) -> CredentialReport {
    CredentialReport {
        password_found: false,
        exponent: key.exponent.clone(),
        modulus: key.modulus.clone(),
        user_name: key.user_name.clone(),
        encrypted_password: None,
        error_message: Some(err.to_string()),
        hash_function: key.hash_function.clone(),
    }
}

#[async_trait]
impl Writer<KeySet> for AccountsWriter {
    async fn apply(&self, desired: &KeySet) -> Result<()> {
        let applied = self.applied()?;

        let mut to_create: Vec<&WindowsKey> = desired.difference(&applied).collect();
        to_create.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        let removed = applied.difference(desired).count();

        if !to_create.is_empty() || removed > 0 {
            info!(
                create = to_create.len(),
                remove = removed,
                "Updating accounts from windows-keys"
            );
        }

        for key in to_create {
            self.provision(key).await;
        }

        let mut lines = desired
            .iter()
            .map(WindowsKey::to_line)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to serialize windows-keys")?;
        lines.sort();

        self.store
            .set_multi(AGENT_PATH, PUBLIC_KEYS, &lines)
            .context("failed to record applied keys")?;

        Ok(())
    }
}
