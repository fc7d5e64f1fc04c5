// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::{Deref, DerefMut};
use std::os::unix::process::CommandExt as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time};

use nix::sys::signal;
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command};

const GRACEFUL_SHUTDOWN_POLL_TIME: time::Duration = time::Duration::from_millis(50);

/// A child process running in its own process group, killed (or signalled)
/// as a group rather than as a single pid so that a window manager's or
/// Xvfb's own children die with it.
pub struct ManagedChild {
  child: Child,
  graceful_shutdown_timeout: time::Duration,
  killed: AtomicBool,
}

impl ManagedChild {
  pub fn spawn(mut command: Command, graceful_shutdown_timeout: time::Duration) -> Result<Self, String> {
    command.kill_on_drop(true);
    unsafe {
      command.pre_exec(|| {
        nix::unistd::setsid().map(|_pgid| ()).map_err(|e| {
          std::io::Error::new(std::io::ErrorKind::Other, format!("could not create new pgid: {e}"))
        })
      });
    }
    let child = command
      .spawn()
      .map_err(|e| format!("error executing display subprocess: {e}"))?;
    Ok(Self {
      child,
      graceful_shutdown_timeout,
      killed: AtomicBool::new(false),
    })
  }

  fn get_pgid(&self) -> Result<Pid, String> {
    let pid = self.id().ok_or_else(|| "process had no pid".to_owned())?;
    getpgid(Some(Pid::from_raw(pid as i32))).map_err(|e| format!("could not get pgid: {e}"))
  }

  fn signal_pg<T: Into<Option<signal::Signal>>>(&self, signal: T) -> Result<(), String> {
    let pgid = self.get_pgid()?;
    signal::kill(Pid::from_raw(-pgid.as_raw()), signal)
      .map_err(|e| format!("failed to signal child process group: {e}"))
  }

  fn check_child_has_exited(&mut self) -> Result<bool, String> {
    self.child.try_wait().map(|o| o.is_some()).map_err(|e| e.to_string())
  }

  fn wait_for_child_exit_sync(&mut self, max_wait_duration: time::Duration) -> Result<bool, String> {
    let deadline = time::Instant::now() + max_wait_duration;
    while time::Instant::now() <= deadline {
      if self.check_child_has_exited()? {
        return Ok(true);
      }
      thread::sleep(GRACEFUL_SHUTDOWN_POLL_TIME);
    }
    Ok(false)
  }

  /// Sends SIGTERM to the process group, waits up to `graceful_shutdown_timeout`,
  /// and falls back to SIGKILL if the group is still alive.
  pub fn graceful_shutdown_sync(&mut self) -> Result<(), String> {
    self.signal_pg(signal::Signal::SIGTERM)?;
    match self.wait_for_child_exit_sync(self.graceful_shutdown_timeout) {
      Ok(true) => {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
      }
      Ok(false) => {
        log::warn!("timed out waiting for display subprocess to exit, sending SIGKILL");
        self.kill_pgid()
      }
      Err(e) => {
        log::warn!("error waiting for display subprocess to exit ({e}), sending SIGKILL");
        self.kill_pgid()
      }
    }
  }

  fn kill_pgid(&mut self) -> Result<(), String> {
    self.signal_pg(signal::Signal::SIGKILL)?;
    self.killed.store(true, Ordering::SeqCst);
    Ok(())
  }

  /// True if the process group has already exited or been signalled.
  pub fn poll_alive(&mut self) -> bool {
    !matches!(self.check_child_has_exited(), Ok(true))
  }
}

impl Deref for ManagedChild {
  type Target = Child;
  fn deref(&self) -> &Child {
    &self.child
  }
}

impl DerefMut for ManagedChild {
  fn deref_mut(&mut self) -> &mut Child {
    &mut self.child
  }
}

impl Drop for ManagedChild {
  fn drop(&mut self) {
    if !self.killed.load(Ordering::SeqCst) {
      let _ = self.graceful_shutdown_sync();
    }
  }
}
