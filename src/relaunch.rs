//! Replacing the running process with a fresh instance.

use std::env;
use std::io;
use std::process::{self, Command, Stdio};

use tracing::{info, warn};

/// Start this executable again with the arguments it was started with.
pub fn relaunch() -> io::Result<()> {
    let exe = env::current_exe()?;
    let child = Command::new(&exe)
        .args(env::args_os().skip(1))
        .stdin(Stdio::null())
        .spawn()?;
    info!(pid = child.id(), exe = %exe.display(), "relaunched");
    Ok(())
}

/// Ask the companion UI process to quit.
pub fn terminate_companion(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    match terminate(pid) {
        Ok(()) => info!(pid, "asked companion process to terminate"),
        Err(e) => warn!(pid, error = %e, "could not terminate companion process"),
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)?;
    Ok(())
}

#[cfg(windows)]
fn terminate(pid: u32) -> io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, format!("taskkill exited with {status}")))
    }
}

#[cfg(not(any(unix, windows)))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "cannot signal processes on this platform"))
}

/// Companion first, then this process. Never returns.
pub fn exit_for_restart(companion: Option<u32>) -> ! {
    terminate_companion(companion);
    info!("exiting for restart");
    process::exit(0)
}
