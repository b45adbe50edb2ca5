//! OS capabilities used by the reconcilers.
//!
//! Each capability is a narrow async trait so the reconcilers can be
//! exercised against fakes (see [`crate::testing`]). The Linux
//! implementations shell out to the standard tools.

mod mac;
mod network;
mod users;

use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub use mac::{MacAddress, MacParseError};
pub use network::{Adapter, LinuxNetwork, NetworkError, NetworkInterfaceService};
pub use users::{remove_partial_user, LinuxUserAccounts, UserAccountError, UserAccountService};

/// Run a program to completion, optionally feeding it stdin.
async fn run(program: &str, args: &[&str], stdin: Option<&[u8]>) -> std::io::Result<Output> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        // Dropping the pipe closes it so the child sees EOF.
        drop(pipe);
    }

    child.wait_with_output().await
}

/// Trimmed stderr of a finished command.
fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}
