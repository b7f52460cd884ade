//! Target lifecycle control.
//!
//! A [`Restarter`] owns the instrumented process: it spawns it with the
//! coverage channel's identifier in its environment, asserts its health
//! between test cases, and tears it down (descendants first) when it is
//! suspected of having crashed. Modules are looked up through an explicit
//! registry; `afl_fork` is the one that manages an AFL-instrumented binary,
//! `external` is the no-op module for targets managed outside the fuzzer.

mod procfs;

use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill as send_signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::utils::shell_split;

/// How long a freshly spawned target may take to reach the "sleeping on
/// I/O" scheduler state before the restart is reported as failed.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period between SIGTERM and SIGKILL during teardown.
const KILL_GRACE: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_micros(100);

pub trait Restarter: std::fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Bring a fresh target instance up. Returns `false` when spawning
    /// failed or the process never settled; both are non-fatal, the session
    /// retries. Unplanned restarts are counted.
    fn restart(&mut self, planned: bool) -> bool;

    /// Terminate the target (descendants first) and collect its exit code.
    /// Counted as a crash unless `ignore` is set.
    fn kill(&mut self, ignore: bool) -> i32;

    /// Whether the process exists and is neither dead nor a zombie.
    fn healthy(&mut self) -> bool;

    /// Kill-and-restart until the target is healthy. Returns
    /// `(true, exit_code)` iff a kill-and-restart happened during this call.
    fn assert_healthy(&mut self, force_kill: bool) -> (bool, i32);

    fn suspend(&mut self) -> bool {
        true
    }

    fn resume(&mut self) -> bool {
        true
    }

    fn restarts(&self) -> u64;
    fn crashes(&self) -> u64;

    /// The configured target command line, for run metadata.
    fn command(&self) -> &str;
}

/// Names of the registered restarter modules.
pub fn registry() -> &'static [&'static str] {
    &["afl_fork", "external"]
}

/// Instantiate a restarter module by registry name.
pub fn create(
    module: &str,
    command: &str,
    env_var: &'static str,
    identifier: &str,
) -> Result<Box<dyn Restarter>> {
    match module {
        "afl_fork" => Ok(Box::new(AflForkRestarter::new(command, env_var, identifier)?)),
        "external" => Ok(Box::new(ExternalRestarter::new(command))),
        other => Err(Error::UnknownRestarter(other.to_owned())),
    }
}

/// Fork-and-exec controller for an AFL-instrumented binary.
///
/// The instrumentation expects the shared-memory identifier in a predefined
/// environment variable and attaches to the segment on start-up. The target
/// is *not* restarted per test case; one instance serves many iterations
/// until it crashes or is killed.
#[derive(Debug)]
pub struct AflForkRestarter {
    command: String,
    argv: Vec<String>,
    env_var: &'static str,
    identifier: String,
    child: Option<Child>,
    /// Exit status collected by a health probe before `kill` ran.
    reaped: Option<ExitStatus>,
    restarts: u64,
    crashes: u64,
}

impl AflForkRestarter {
    pub fn new(command: &str, env_var: &'static str, identifier: &str) -> Result<Self> {
        let argv = shell_split(command);
        if argv.is_empty() {
            return Err(Error::RestartFailed("empty target command".to_owned()));
        }
        Ok(Self {
            command: command.to_owned(),
            argv,
            env_var,
            identifier: identifier.to_owned(),
            child: None,
            reaped: None,
            restarts: 0,
            crashes: 0,
        })
    }

    fn wait_for_state(&mut self, wanted: char, timeout: Duration) -> bool {
        let Some(pid) = self.child.as_ref().map(Child::id) else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        while procfs::process_state(pid) != Some(wanted) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        true
    }

    fn terminate_descendants(&self, pid: u32) {
        let descendants = procfs::children(pid);
        for &desc in &descendants {
            let _ = send_signal(Pid::from_raw(desc as i32), Signal::SIGTERM);
        }
        let deadline = Instant::now() + KILL_GRACE;
        while descendants.iter().any(|&d| procfs::alive(d)) && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }
        for &desc in &descendants {
            if procfs::alive(desc) {
                let _ = send_signal(Pid::from_raw(desc as i32), Signal::SIGKILL);
            }
        }
    }

    fn terminate_child(child: &mut Child) -> ExitStatus {
        let pid = Pid::from_raw(child.id() as i32);
        let _ = send_signal(pid, Signal::SIGTERM);
        let deadline = Instant::now() + KILL_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status,
                Ok(None) if Instant::now() >= deadline => break,
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(_) => break,
            }
        }
        let _ = send_signal(pid, Signal::SIGKILL);
        child.wait().unwrap_or_else(|_| ExitStatus::from_raw(0))
    }
}

impl Restarter for AflForkRestarter {
    fn name(&self) -> &'static str {
        "afl_fork"
    }

    fn restart(&mut self, planned: bool) -> bool {
        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .env(self.env_var, &self.identifier)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                Ok(())
            });
        }
        match command.spawn() {
            Ok(child) => {
                debug!(pid = child.id(), "target spawned");
                self.child = Some(child);
                self.reaped = None;
            }
            Err(err) => {
                warn!(%err, command = %self.command, "spawning target failed");
                return false;
            }
        }
        // The instrumented process has settled once it blocks on its
        // listening socket.
        if !self.wait_for_state('S', STARTUP_TIMEOUT) {
            warn!("target never reached a sleeping state after spawn");
            return false;
        }
        if !planned {
            self.restarts += 1;
        }
        self.healthy()
    }

    fn kill(&mut self, ignore: bool) -> i32 {
        let Some(mut child) = self.child.take() else {
            return -1;
        };
        let status = match self.reaped.take() {
            Some(status) => status,
            None => {
                self.terminate_descendants(child.id());
                Self::terminate_child(&mut child)
            }
        };
        if !ignore {
            self.crashes += 1;
        }
        exit_code(status)
    }

    fn healthy(&mut self) -> bool {
        if self.reaped.is_some() {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.reaped = Some(status);
                false
            }
            Ok(None) => !matches!(procfs::process_state(child.id()), None | Some('Z' | 'X')),
            Err(_) => false,
        }
    }

    fn assert_healthy(&mut self, force_kill: bool) -> (bool, i32) {
        let mut complications = false;
        let mut exit = 0;
        let mut force = force_kill;
        while !self.healthy() || force {
            exit = self.kill(false);
            complications = true;
            force = false;
            if !self.restart(false) {
                warn!("target could not be restarted; continuing degraded");
                break;
            }
        }
        if complications { (true, exit) } else { (false, 0) }
    }

    fn restarts(&self) -> u64 {
        self.restarts
    }

    fn crashes(&self) -> u64 {
        self.crashes
    }

    fn command(&self) -> &str {
        &self.command
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

/// Module for targets whose lifecycle is managed outside the fuzzer. Every
/// probe reports healthy; a crashed target surfaces as connection failures
/// instead of suspects with exit codes.
#[derive(Debug)]
pub struct ExternalRestarter {
    command: String,
}

impl ExternalRestarter {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_owned(),
        }
    }
}

impl Restarter for ExternalRestarter {
    fn name(&self) -> &'static str {
        "external"
    }

    fn restart(&mut self, _planned: bool) -> bool {
        true
    }

    fn kill(&mut self, _ignore: bool) -> i32 {
        0
    }

    fn healthy(&mut self) -> bool {
        true
    }

    fn assert_healthy(&mut self, _force_kill: bool) -> (bool, i32) {
        (false, 0)
    }

    fn restarts(&self) -> u64 {
        0
    }

    fn crashes(&self) -> u64 {
        0
    }

    fn command(&self) -> &str {
        &self.command
    }
}

#[cfg(test)]
mod tests {
    use super::{AflForkRestarter, Restarter, create, registry};

    #[test]
    fn registry_contains_both_modules() {
        assert_eq!(registry(), ["afl_fork", "external"]);
        assert!(create("afl_fork", "/bin/true", "__AFL_SHM_ID", "1").is_ok());
        assert!(create("external", "", "__AFL_SHM_ID", "1").is_ok());
        assert!(create("nope", "/bin/true", "__AFL_SHM_ID", "1").is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(AflForkRestarter::new("   ", "__AFL_SHM_ID", "1").is_err());
    }

    #[test]
    fn restart_kill_cycle() {
        let mut restarter = AflForkRestarter::new("/bin/sleep 30", "__AFL_SHM_ID", "42").unwrap();
        assert!(restarter.restart(true));
        assert!(restarter.healthy());
        assert_eq!(restarter.restarts(), 0);

        let code = restarter.kill(false);
        // Terminated by SIGTERM.
        assert_eq!(code, -15);
        assert_eq!(restarter.crashes(), 1);
        assert!(!restarter.healthy());
    }

    #[test]
    fn assert_healthy_reports_complications() {
        let mut restarter = AflForkRestarter::new("/bin/sleep 30", "__AFL_SHM_ID", "7").unwrap();
        assert!(restarter.restart(true));
        // Healthy target: nothing to do.
        assert_eq!(restarter.assert_healthy(false), (false, 0));
        // Force one kill-and-restart cycle.
        let (complications, code) = restarter.assert_healthy(true);
        assert!(complications);
        assert_eq!(code, -15);
        assert!(restarter.healthy());
        restarter.kill(true);
    }

    #[test]
    fn spawn_failure_is_nonfatal() {
        let mut restarter =
            AflForkRestarter::new("/nonexistent-binary-for-test", "__AFL_SHM_ID", "1").unwrap();
        assert!(!restarter.restart(false));
        assert!(!restarter.healthy());
    }

    #[test]
    fn dead_target_is_detected_and_kill_collects_the_code() {
        let mut restarter = AflForkRestarter::new("/bin/true", "__AFL_SHM_ID", "1").unwrap();
        // /bin/true exits immediately; give it a moment.
        let _ = restarter.restart(true);
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!restarter.healthy());
        assert_eq!(restarter.kill(true), 0);
        assert_eq!(restarter.crashes(), 0);
    }
}
