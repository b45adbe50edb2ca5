//! In-memory fakes for the OS capabilities.
//!
//! Always compiled so integration tests (and local dry runs) can drive the
//! reconcilers without touching the host.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::info;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use crate::os::{
    Adapter, MacAddress, NetworkError, NetworkInterfaceService, UserAccountError,
    UserAccountService,
};
use crate::serial::SideChannel;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fake local account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeUser {
    pub password: String,
    pub admin: bool,
}

#[derive(Debug, Default)]
struct UsersState {
    users: BTreeMap<String, FakeUser>,
    policy_rejections: usize,
    failing: HashSet<String>,
    calls: Vec<String>,
}

/// In-memory user database.
#[derive(Debug, Default)]
pub struct FakeUserAccounts {
    state: Mutex<UsersState>,
}

impl FakeUserAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing, non-admin user.
    pub fn with_user(self, user: &str) -> Self {
        lock(&self.state).users.insert(
            user.to_string(),
            FakeUser {
                password: "initial".to_string(),
                admin: false,
            },
        );
        self
    }

    /// Reject the next `count` passwords as too weak.
    pub fn reject_passwords(&self, count: usize) {
        lock(&self.state).policy_rejections = count;
    }

    /// Make every operation on `user` fail.
    pub fn fail_user(&self, user: &str) {
        lock(&self.state).failing.insert(user.to_string());
    }

    pub fn user(&self, user: &str) -> Option<FakeUser> {
        lock(&self.state).users.get(user).cloned()
    }

    pub fn user_names(&self) -> Vec<String> {
        lock(&self.state).users.keys().cloned().collect()
    }

    /// Operations performed, as `"<op> <user>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn begin(&self, op: &str, user: &str) -> Result<MutexGuard<'_, UsersState>, UserAccountError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{op} {user}"));
        if state.failing.contains(user) {
            return Err(UserAccountError::Command {
                command: op.to_string(),
                stderr: format!("{op} refused for {user}"),
            });
        }
        Ok(state)
    }
}

fn check_policy(state: &mut UsersState, user: &str) -> Result<(), UserAccountError> {
    if state.policy_rejections > 0 {
        state.policy_rejections -= 1;
        return Err(UserAccountError::PasswordPolicy {
            user: user.to_string(),
            detail: "BAD PASSWORD: too simple".to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl UserAccountService for FakeUserAccounts {
    async fn user_exists(&self, user: &str) -> Result<bool, UserAccountError> {
        Ok(lock(&self.state).users.contains_key(user))
    }

    async fn create_user(&self, user: &str, password: &str) -> Result<(), UserAccountError> {
        let mut state = self.begin("create", user)?;
        check_policy(&mut state, user)?;
        state.users.insert(
            user.to_string(),
            FakeUser {
                password: password.to_string(),
                admin: false,
            },
        );
        Ok(())
    }

    async fn set_password(&self, user: &str, password: &str) -> Result<(), UserAccountError> {
        let mut state = self.begin("set-password", user)?;
        check_policy(&mut state, user)?;
        match state.users.get_mut(user) {
            Some(account) => {
                account.password = password.to_string();
                Ok(())
            }
            None => Err(UserAccountError::Command {
                command: "set-password".to_string(),
                stderr: format!("no such user {user}"),
            }),
        }
    }

    async fn add_to_admin_group(&self, user: &str) -> Result<(), UserAccountError> {
        let mut state = self.begin("add-admin", user)?;
        if let Some(account) = state.users.get_mut(user) {
            account.admin = true;
        }
        Ok(())
    }

    async fn delete_user(&self, user: &str) -> Result<(), UserAccountError> {
        let mut state = self.begin("delete", user)?;
        state.users.remove(user);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    adapters: Vec<Adapter>,
    bound: BTreeMap<String, BTreeSet<IpAddr>>,
    failing: HashSet<IpAddr>,
    calls: Vec<String>,
}

/// In-memory adapter table.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    state: Mutex<NetworkState>,
}

impl FakeNetwork {
    pub fn new(adapters: Vec<Adapter>) -> Self {
        Self {
            state: Mutex::new(NetworkState {
                adapters,
                ..NetworkState::default()
            }),
        }
    }

    /// An IPv4 Ethernet adapter.
    pub fn ethernet(name: &str, mac: &str) -> Adapter {
        Adapter {
            name: name.to_string(),
            mac: mac.parse::<MacAddress>().ok(),
            is_ethernet: true,
            has_ipv4: true,
        }
    }

    /// Start with `address` already bound to `adapter`.
    pub fn with_bound(self, adapter: &str, address: IpAddr) -> Self {
        lock(&self.state)
            .bound
            .entry(adapter.to_string())
            .or_default()
            .insert(address);
        self
    }

    /// Make bind and unbind of `address` fail.
    pub fn fail_address(&self, address: IpAddr) {
        lock(&self.state).failing.insert(address);
    }

    pub fn bound(&self, adapter: &str) -> BTreeSet<IpAddr> {
        lock(&self.state)
            .bound
            .get(adapter)
            .cloned()
            .unwrap_or_default()
    }

    /// Mutations performed, as `"<op> <adapter> <address>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }
}

#[async_trait]
impl NetworkInterfaceService for FakeNetwork {
    async fn adapters(&self) -> Result<Vec<Adapter>, NetworkError> {
        Ok(lock(&self.state).adapters.clone())
    }

    async fn bound_addresses(&self, adapter: &Adapter) -> Result<BTreeSet<IpAddr>, NetworkError> {
        Ok(self.bound(&adapter.name))
    }

    async fn bind(&self, adapter: &Adapter, address: IpAddr) -> Result<(), NetworkError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("bind {} {}", adapter.name, address));
        if state.failing.contains(&address) {
            return Err(NetworkError::Command {
                command: format!("bind {address}"),
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }
        if state.bound.values().any(|b| b.contains(&address)) {
            return Err(NetworkError::Command {
                command: format!("bind {address}"),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        state
            .bound
            .entry(adapter.name.clone())
            .or_default()
            .insert(address);
        Ok(())
    }

    async fn unbind(&self, adapter: &Adapter, address: IpAddr) -> Result<(), NetworkError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("unbind {} {}", adapter.name, address));
        if state.failing.contains(&address) {
            return Err(NetworkError::Command {
                command: format!("unbind {address}"),
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }
        if let Some(bound) = state.bound.get_mut(&adapter.name) {
            bound.remove(&address);
        }
        Ok(())
    }
}

/// Side channel that keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    lines: Mutex<Vec<String>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    /// Every line parsed as JSON. Unparsable lines are skipped.
    pub fn messages(&self) -> Vec<serde_json::Value> {
        lock(&self.lines)
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

#[async_trait]
impl SideChannel for MemoryChannel {
    async fn write_line(&self, line: &str) -> io::Result<()> {
        info!(line, "[FAKE] Side-channel message");
        lock(&self.lines).push(line.to_string());
        Ok(())
    }
}

/// Log sink for asserting on emitted events.
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Capture events at `level` and above on the current thread until the
    /// returned guard drops.
    pub fn install(level: tracing::Level) -> (Self, DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }

    /// Number of captured lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.contents().lines().filter(|l| l.contains(needle)).count()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
