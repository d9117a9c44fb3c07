//! Simulator process supervision.
//!
//! The simulator is an independent OS process that may fork helpers of its
//! own (Renode runs under a Mono launcher, for instance). It is started as
//! the leader of a new session, so its process-group id equals its pid and
//! the whole tree can be signaled as one unit on teardown.
//!
//! # Teardown
//!
//! ```text
//! stop()
//!   → killpg(pgid, SIGTERM)
//!   → poll try_wait() for up to the grace period
//!   → killpg(pgid, SIGKILL)    descendants may outlive the leader
//!   → wait()                   reap the leader
//! ```
//!
//! Every step tolerates the process (or group) being gone already.
//!
//! # Platform Support
//!
//! Signaling goes through the [`ProcessControl`] trait. The
//! [`UnixProcessGroup`] adapter implements it with `killpg(2)`.

// Rust guideline compliant 2026-02

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::constants::STOP_POLL_INTERVAL;
use crate::error::TransportError;
use crate::simulator::SimulatorCommand;

/// Capability to signal and reap a supervised process tree.
pub trait ProcessControl: std::fmt::Debug + Send {
    /// Pid of the top-level process.
    fn pid(&self) -> u32;

    /// Process-group id covering the whole tree.
    fn group_id(&self) -> u32;

    /// Ask the whole tree to exit.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcefully kill the whole tree.
    fn kill(&mut self) -> io::Result<()>;

    /// Exit status of the top-level process if it has exited, without
    /// blocking.
    ///
    /// Implementations must not reap here: until [`wait`](Self::wait) runs,
    /// the exited leader keeps its pid, and with it the group id, reserved
    /// so a later group signal cannot reach an unrelated process group.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Block until the top-level process has exited, and reap it.
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

/// Unix adapter: a child that leads its own session and process group.
#[derive(Debug)]
pub struct UnixProcessGroup {
    child: Child,
    pgid: libc::pid_t,
    /// Held open so the simulator's console never reads EOF.
    _stdin: Option<ChildStdin>,
}

impl UnixProcessGroup {
    /// Wrap a child spawned with `setsid()` in its pre-exec hook.
    pub fn new(mut child: Child) -> Self {
        let pgid = child.id() as libc::pid_t;
        let stdin = child.stdin.take();
        Self {
            child,
            pgid,
            _stdin: stdin,
        }
    }

    fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        // SAFETY: killpg only sends a signal; pgid came from our own child.
        if unsafe { libc::killpg(self.pgid, signal) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Whole group already gone.
            return Ok(());
        }
        Err(err)
    }
}

impl ProcessControl for UnixProcessGroup {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn group_id(&self) -> u32 {
        self.pgid as u32
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signal_group(libc::SIGTERM)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signal_group(libc::SIGKILL)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        // SAFETY: an all-zero siginfo_t is a valid out-parameter.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: waitid only writes into `info`. WNOWAIT leaves the child
        // as a zombie for `wait` to reap.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                self.child.id() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                // Already reaped through `wait`; std caches the status.
                return self.child.try_wait();
            }
            return Err(err);
        }

        // SAFETY: waitid filled `info` for a child-state change, so the
        // SIGCHLD fields are the initialized ones.
        let (pid, status) = unsafe { (info.si_pid(), info.si_status()) };
        if pid == 0 {
            return Ok(None);
        }
        let raw = match info.si_code {
            libc::CLD_EXITED => (status & 0xff) << 8,
            libc::CLD_DUMPED => status | 0x80,
            _ => status,
        };
        Ok(Some(ExitStatus::from_raw(raw)))
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }
}

/// Lifecycle state of a supervised simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorState {
    /// Started and not yet stopped.
    Running,
    /// Stopped or observed to have exited.
    Terminated,
}

/// A started simulator and the means to tear it down.
#[derive(Debug)]
pub struct SimulatorHandle {
    control: Box<dyn ProcessControl>,
    state: SimulatorState,
    output_log: Option<PathBuf>,
}

impl SimulatorHandle {
    /// Pid of the simulator process.
    pub fn pid(&self) -> u32 {
        self.control.pid()
    }

    /// Process-group id of the simulator tree.
    pub fn pgid(&self) -> u32 {
        self.control.group_id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SimulatorState {
        self.state
    }

    /// Where the simulator's merged stdout/stderr is captured, if anywhere.
    pub fn output_log(&self) -> Option<&Path> {
        self.output_log.as_deref()
    }
}

/// Starts and stops the simulator. Owns at most one running handle.
#[derive(Debug)]
pub struct ProcessSupervisor {
    handle: Option<SimulatorHandle>,
    grace: Duration,
}

impl ProcessSupervisor {
    /// Supervisor that waits `grace` between SIGTERM and SIGKILL.
    pub fn new(grace: Duration) -> Self {
        Self { handle: None, grace }
    }

    /// Spawn `command` as a new session leader.
    ///
    /// stdout and stderr are merged into `output_log` (truncated first), or
    /// discarded when `None`. Fails with [`TransportError::Spawn`] if a
    /// simulator is already running or the spawn itself fails.
    pub fn start(
        &mut self,
        command: &SimulatorCommand,
        output_log: Option<&Path>,
    ) -> Result<&SimulatorHandle, TransportError> {
        let rendered = command.display();
        let spawn_err = |source: io::Error| TransportError::Spawn {
            command: rendered.clone(),
            source,
        };

        if self.handle.is_some() {
            return Err(spawn_err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a simulator is already running for this bridge",
            )));
        }

        let mut cmd = command.to_command();
        match output_log {
            Some(path) => {
                let log = File::create(path).map_err(&spawn_err)?;
                cmd.stdout(log.try_clone().map_err(&spawn_err)?);
                cmd.stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }
        cmd.stdin(Stdio::piped());

        // SAFETY: the hook runs in the forked child before exec and only
        // calls setsid(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        log::info!("Starting simulator: {rendered}");
        let child = cmd.spawn().map_err(&spawn_err)?;
        log::info!("Simulator started (pid {})", child.id());

        let handle = self.adopt_with_log(Box::new(UnixProcessGroup::new(child)), output_log);
        Ok(handle)
    }

    /// Take ownership of an already-started process tree.
    ///
    /// Lets other platform adapters (or test doubles) plug into the same
    /// teardown path. Any previously adopted process is stopped first.
    pub fn adopt(&mut self, control: Box<dyn ProcessControl>) -> &SimulatorHandle {
        self.adopt_with_log(control, None)
    }

    fn adopt_with_log(
        &mut self,
        control: Box<dyn ProcessControl>,
        output_log: Option<&Path>,
    ) -> &SimulatorHandle {
        self.stop();
        self.handle.insert(SimulatorHandle {
            control,
            state: SimulatorState::Running,
            output_log: output_log.map(Path::to_path_buf),
        })
    }

    /// The running simulator, if any.
    pub fn handle(&self) -> Option<&SimulatorHandle> {
        self.handle.as_ref()
    }

    /// Whether the supervised process is still alive.
    ///
    /// Polls without blocking; an exited process is marked
    /// [`SimulatorState::Terminated`] but only reaped by [`stop`](Self::stop).
    pub fn is_running(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if handle.state == SimulatorState::Terminated {
            return false;
        }
        match handle.control.try_wait() {
            Ok(Some(status)) => {
                log::info!("Simulator (pid {}) exited: {status}", handle.pid());
                handle.state = SimulatorState::Terminated;
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("Failed to poll simulator status: {e}");
                true
            }
        }
    }

    /// Stop the whole simulator tree. Idempotent.
    ///
    /// Sends SIGTERM to the group, allows the grace period, sends SIGKILL to
    /// the group, then reaps the leader. Conditions caused by the process
    /// having exited already are ignored.
    pub fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        let pid = handle.pid();
        let pgid = handle.pgid();
        log::info!("Stopping simulator (pid {pid}, pgid {pgid})");

        if let Err(e) = handle.control.terminate() {
            log::warn!("Failed to send SIGTERM to simulator group {pgid}: {e}");
        }

        let grace_end = Instant::now() + self.grace;
        while Instant::now() < grace_end {
            match handle.control.try_wait() {
                Ok(Some(_)) | Err(_) => break,
                Ok(None) => std::thread::sleep(STOP_POLL_INTERVAL),
            }
        }

        // Helpers forked by the simulator may ignore SIGTERM or outlive the
        // leader, so the group is always killed. The leader is not reaped
        // yet, so its group id cannot have been reused.
        if let Err(e) = handle.control.kill() {
            log::warn!("Failed to send SIGKILL to simulator group {pgid}: {e}");
        }

        match handle.control.wait() {
            Ok(status) => log::debug!("Simulator (pid {pid}) reaped: {status}"),
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {}
            Err(e) => log::warn!("Failed to reap simulator (pid {pid}): {e}"),
        }
        handle.state = SimulatorState::Terminated;
    }

    /// Last `max_bytes` of the simulator's output log, lossily decoded.
    ///
    /// Returns `None` when output is discarded or the log is unreadable.
    pub fn output_tail(&self, max_bytes: usize) -> Option<String> {
        let path = self.handle.as_ref()?.output_log()?;
        read_tail(path, max_bytes).ok()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_tail(path: &Path, max_bytes: usize) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes as u64);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
