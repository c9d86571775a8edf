//! Network backend implementations.

pub mod mock;
pub mod network_manager;

use crate::{Error, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::process::Command;

/// Output of a finished child process with decoded streams.
#[derive(Debug)]
pub(crate) struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a program with an argv array (no shell involved) and collect its
/// output. Spawn failures surface as I/O errors; non-zero exits are left
/// for the caller to interpret.
pub(crate) async fn run_command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<CmdOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(Error::Io)?;

    Ok(CmdOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
