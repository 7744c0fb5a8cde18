use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A child process the `server` command keeps alive alongside its siblings.
pub struct ManagedChild {
    role: &'static str,
    child: Child,
}

impl ManagedChild {
    pub fn spawn(role: &'static str, program: &Path, args: &[&str]) -> Result<Self> {
        let child = Command::new(program)
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start {role} process at {}", program.display()))?;

        log::info!("[Manager] {role} process started with PID {}", child.id());
        Ok(ManagedChild { role, child })
    }

    /// `Some` once the process has ended on its own.
    pub fn exited(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                log::warn!("[Manager] Could not poll {} process: {e}", self.role);
                None
            }
        }
    }

    /// Kills the process if it is still running and reaps it.
    pub fn terminate(mut self) {
        if self.exited().is_none() {
            if let Err(e) = self.child.kill() {
                log::error!("[Manager] Error killing {} process: {e}", self.role);
            }
        }

        match self.child.wait() {
            Ok(status) => log::info!("[Manager] {} process ended with {status}", self.role),
            Err(e) => log::error!("[Manager] Error waiting for {} process: {e}", self.role),
        }
    }
}

/// Path of a binary installed next to the running executable.
pub fn sibling_binary(name: &str) -> Result<PathBuf> {
    let mut path = std::env::current_exe().context("failed to locate current executable")?;
    path.set_file_name(name);
    Ok(path)
}

/// Runs the proxy and the sweep process until either exits or ctrl-c arrives, then stops both.
pub fn run(mut children: Vec<ManagedChild>) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        log::info!("[Manager] Shutdown signal received");
        flag.store(false, Ordering::SeqCst);
    })
    .context("failed to install ctrl-c handler")?;

    'watch: while running.load(Ordering::SeqCst) {
        for child in children.iter_mut() {
            if let Some(status) = child.exited() {
                log::warn!("[Manager] {} process exited with {status}, stopping", child.role);
                break 'watch;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    for child in children {
        child.terminate();
    }
    log::info!("[Manager] Shutdown complete");

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_exited_reports_finished_process() {
        let mut child = ManagedChild::spawn("short-lived", Path::new("true"), &[]).unwrap();

        let mut status = None;
        for _ in 0..100 {
            status = child.exited();
            if status.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(status.unwrap().success());
        child.terminate();
    }

    #[test]
    fn test_terminate_stops_running_process() {
        let mut child = ManagedChild::spawn("sleeper", Path::new("sleep"), &["30"]).unwrap();
        assert!(child.exited().is_none());
        child.terminate();
    }

    #[test]
    fn test_missing_program_is_an_error() {
        assert!(ManagedChild::spawn("ghost", Path::new("/nonexistent/ghost-binary"), &[]).is_err());
    }
}
