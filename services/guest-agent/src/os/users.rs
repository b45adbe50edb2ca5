use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::{run, stderr_of};

/// Errors from user account operations.
#[derive(Debug, Error)]
pub enum UserAccountError {
    /// The password was rejected by the local password policy.
    #[error("password rejected by policy for user {user}: {detail}")]
    PasswordPolicy { user: String, detail: String },

    /// A management command exited unsuccessfully.
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UserAccountError {
    pub fn is_password_policy(&self) -> bool {
        matches!(self, Self::PasswordPolicy { .. })
    }
}

/// Local user account management.
#[async_trait]
pub trait UserAccountService: Send + Sync {
    async fn user_exists(&self, user: &str) -> Result<bool, UserAccountError>;

    /// Create a user with the given password.
    async fn create_user(&self, user: &str, password: &str) -> Result<(), UserAccountError>;

    async fn set_password(&self, user: &str, password: &str) -> Result<(), UserAccountError>;

    async fn add_to_admin_group(&self, user: &str) -> Result<(), UserAccountError>;

    async fn delete_user(&self, user: &str) -> Result<(), UserAccountError>;
}

/// Delete a user whose provisioning failed halfway.
///
/// A failed delete is logged and otherwise ignored; the caller is already
/// reporting the original error. Returns whether the user was removed.
pub async fn remove_partial_user(
    service: &(impl UserAccountService + ?Sized),
    user: &str,
) -> bool {
    match service.delete_user(user).await {
        Ok(()) => {
            debug!(user, "Removed partially created user");
            true
        }
        Err(e) => {
            warn!(user, error = %e, "Failed to remove partially created user");
            false
        }
    }
}

/// Shadow-utils backed implementation.
#[derive(Debug, Clone)]
pub struct LinuxUserAccounts {
    admin_group: String,
}

impl LinuxUserAccounts {
    pub fn new(admin_group: impl Into<String>) -> Self {
        Self {
            admin_group: admin_group.into(),
        }
    }
}

/// Messages chpasswd and PAM use when a password fails quality checks.
const POLICY_MARKERS: &[&str] = &["BAD PASSWORD", "pam_chauthtok", "password quality"];

async fn checked(program: &str, args: &[&str]) -> Result<(), UserAccountError> {
    let output = run(program, args, None).await?;
    if !output.status.success() {
        return Err(UserAccountError::Command {
            command: format!("{} {}", program, args.join(" ")),
            stderr: stderr_of(&output),
        });
    }
    Ok(())
}

#[async_trait]
impl UserAccountService for LinuxUserAccounts {
    async fn user_exists(&self, user: &str) -> Result<bool, UserAccountError> {
        let output = run("id", &["-u", user], None).await?;
        Ok(output.status.success())
    }

    async fn create_user(&self, user: &str, password: &str) -> Result<(), UserAccountError> {
        checked("useradd", &["--create-home", "--shell", "/bin/bash", user]).await?;
        debug!(user, "User created");

        if let Err(e) = self.set_password(user, password).await {
            // Leave no passwordless account behind.
            remove_partial_user(self, user).await;
            return Err(e);
        }
        Ok(())
    }

    async fn set_password(&self, user: &str, password: &str) -> Result<(), UserAccountError> {
        // The password only ever travels over stdin.
        let input = format!("{user}:{password}\n");
        let output = run("chpasswd", &[], Some(input.as_bytes())).await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = stderr_of(&output);
        if POLICY_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Err(UserAccountError::PasswordPolicy {
                user: user.to_string(),
                detail: stderr,
            });
        }
        Err(UserAccountError::Command {
            command: "chpasswd".to_string(),
            stderr,
        })
    }

    async fn add_to_admin_group(&self, user: &str) -> Result<(), UserAccountError> {
        checked("usermod", &["--append", "--groups", &self.admin_group, user]).await
    }

    async fn delete_user(&self, user: &str) -> Result<(), UserAccountError> {
        checked("userdel", &["--remove", user]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CapturedLogs, FakeUserAccounts};

    #[tokio::test]
    async fn test_remove_partial_user_deletes() {
        let users = FakeUserAccounts::new().with_user("carol");

        assert!(remove_partial_user(&users, "carol").await);
        assert!(users.user("carol").is_none());
        assert_eq!(users.calls(), vec!["delete carol"]);
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_logged() {
        let (logs, _guard) = CapturedLogs::install(tracing::Level::WARN);
        let users = FakeUserAccounts::new().with_user("carol");
        users.fail_user("carol");

        assert!(!remove_partial_user(&users, "carol").await);
        assert_eq!(logs.count("Failed to remove partially created user"), 1);
        assert!(logs.contents().contains("delete refused for carol"));
    }

    #[test]
    fn test_policy_classification() {
        let policy = UserAccountError::PasswordPolicy {
            user: "carol".to_string(),
            detail: "BAD PASSWORD".to_string(),
        };
        let command = UserAccountError::Command {
            command: "useradd carol".to_string(),
            stderr: "exists".to_string(),
        };
        assert!(policy.is_password_policy());
        assert!(!command.is_password_policy());
    }
}
