//! Executing a fetched script and relaying its output to the log.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::fetch::LocalScript;
use crate::script::Suffix;

/// Program and arguments that run `script`.
pub fn command_line(script: &LocalScript) -> (OsString, Vec<OsString>) {
    match script.suffix {
        Suffix::Ps1 => (
            "powershell".into(),
            vec![
                "-NoProfile".into(),
                "-NoLogo".into(),
                "-ExecutionPolicy".into(),
                "ByPass".into(),
                "-File".into(),
                script.path.clone().into_os_string(),
            ],
        ),
        _ => (script.path.clone().into_os_string(), Vec::new()),
    }
}

/// Run the script to completion, logging each output line under its key.
pub async fn run(script: &LocalScript) -> std::io::Result<ExitStatus> {
    make_executable(script).await?;

    let (program, args) = command_line(script);
    info!(key = %script.key, "Running script");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        relay(&script.key, stdout),
        relay(&script.key, stderr)
    );

    let status = child.wait().await?;
    match status.code() {
        Some(0) => info!(key = %script.key, "Script finished"),
        Some(code) => warn!(key = %script.key, exit_code = code, "Script exited with an error"),
        None => warn!(key = %script.key, "Script terminated by signal"),
    }
    Ok(status)
}

async fn relay<R: AsyncRead + Unpin>(key: &str, stream: Option<R>) {
    let Some(stream) = stream else { return };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("{}: {}", key, line),
            Ok(None) => break,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read script output");
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn make_executable(script: &LocalScript) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if script.suffix == Suffix::Ps1 {
        return Ok(());
    }
    tokio::fs::set_permissions(&script.path, std::fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn make_executable(_script: &LocalScript) -> std::io::Result<()> {
    Ok(())
}
