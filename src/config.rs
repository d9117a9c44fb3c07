//! Bridge configuration.
//!
//! A JSON file describes where the project lives, how to launch the
//! simulator, and the transport's timeouts. Environment variables override
//! the file, which is how host tooling points the bridge at a freshly
//! generated project without rewriting config.
//!
//! Relative paths are resolved against `project_dir`; `~` is expanded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::constants::{
    CONFIG_FILE_NAME, DEVICE_FILE_NAME, DEVICE_WAIT_TIMEOUT, FRAME_MARKER, SIMULATOR_LOG_FILE_NAME,
    STOP_GRACE_PERIOD, SYNC_TIMEOUT, WAKE_BYTE, WRITE_PACING_DELAY,
};
use crate::simulator::{SimulatorCommand, UartSetup};
use crate::transport::{ChannelSettings, SessionTimeouts};

/// How to launch the simulator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Simulator executable. A bare name is looked up on `PATH`.
    pub executable: PathBuf,
    /// Directory the simulator runs from.
    pub working_dir: PathBuf,
    /// Platform script loaded first, without the leading `@`.
    pub platform_script: String,
    /// Peripheral path of the board UART.
    pub uart: String,
    /// Simulator-side name of the PTY terminal.
    pub terminal_name: String,
    /// Directives run after the UART is connected.
    pub extra_directives: Vec<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("renode"),
            working_dir: PathBuf::from("build/renode"),
            platform_script: "digilent_arty.resc".to_string(),
            uart: "sysbus.uart".to_string(),
            terminal_name: "term".to_string(),
            extra_directives: Vec::new(),
        }
    }
}

/// Configuration for one transport session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Generated project directory; base for relative paths.
    pub project_dir: PathBuf,
    /// Simulator launch settings.
    pub simulator: SimulatorConfig,
    /// Device node the simulator creates.
    pub device_file: PathBuf,
    /// Byte sent once to wake the target.
    pub wake_byte: u8,
    /// First byte of the RPC stream.
    pub frame_marker: u8,
    /// Milliseconds to wait for the device node.
    pub device_timeout_ms: u64,
    /// Milliseconds allowed for finding the frame marker.
    pub sync_timeout_ms: u64,
    /// Milliseconds between SIGTERM and SIGKILL on teardown.
    pub stop_grace_ms: u64,
    /// Milliseconds between partial-write retries.
    pub write_pacing_ms: u64,
    /// Simulator output log; `null` discards output.
    pub output_log: Option<PathBuf>,
    /// Timeouts reported to the host RPC layer.
    pub session_timeouts: SessionTimeouts,
    /// Log every byte crossing the link.
    pub trace_io: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            simulator: SimulatorConfig::default(),
            device_file: PathBuf::from(DEVICE_FILE_NAME),
            wake_byte: WAKE_BYTE,
            frame_marker: FRAME_MARKER,
            device_timeout_ms: DEVICE_WAIT_TIMEOUT.as_millis() as u64,
            sync_timeout_ms: SYNC_TIMEOUT.as_millis() as u64,
            stop_grace_ms: STOP_GRACE_PERIOD.as_millis() as u64,
            write_pacing_ms: WRITE_PACING_DELAY.as_millis() as u64,
            output_log: Some(PathBuf::from(SIMULATOR_LOG_FILE_NAME)),
            session_timeouts: SessionTimeouts::default(),
            trace_io: false,
        }
    }
}

impl BridgeConfig {
    /// Layout of a CFU-playground project.
    ///
    /// Renode ships inside the playground checkout; the simulator runs from
    /// the project's build output.
    pub fn for_cfu_project(cfu_root: impl AsRef<Path>, project_dir: impl AsRef<Path>) -> Self {
        let mut config = Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            ..Self::default()
        };
        config.use_cfu_root(cfu_root.as_ref());
        config
    }

    fn use_cfu_root(&mut self, cfu_root: &Path) {
        self.simulator.executable = cfu_root.join("third_party").join("renode").join("renode");
        self.simulator.working_dir = PathBuf::from("build").join("renode");
    }

    /// Platform config directory: `SIMBRIDGE_CONFIG_DIR`, or
    /// `<platform config dir>/simbridge`.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = env::var("SIMBRIDGE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("simbridge"))
    }

    /// Load `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load the platform config file if present (defaults otherwise), then
    /// apply environment overrides.
    pub fn load_default() -> Result<Self> {
        let path = Self::config_dir()?.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply `SIMBRIDGE_*` and `CFU_ROOT` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("SIMBRIDGE_PROJECT_DIR") {
            self.project_dir = PathBuf::from(dir);
        }

        if let Some(cfu_root) = lookup("CFU_ROOT") {
            self.use_cfu_root(&expand(Path::new(&cfu_root)));
        }

        if let Some(ms) = parse_override(&lookup, "SIMBRIDGE_DEVICE_TIMEOUT_MS") {
            self.device_timeout_ms = ms;
        }

        if let Some(ms) = parse_override(&lookup, "SIMBRIDGE_SYNC_TIMEOUT_MS") {
            self.sync_timeout_ms = ms;
        }

        if let Some(value) = lookup("SIMBRIDGE_TRACE_IO") {
            self.trace_io = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// `path` with `~` expanded and, if relative, joined to `project_dir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let expanded = expand(path);
        if expanded.is_absolute() {
            expanded
        } else {
            expand(&self.project_dir).join(expanded)
        }
    }

    /// Resolved device node path.
    pub fn device_path(&self) -> PathBuf {
        self.resolve(&self.device_file)
    }

    /// Resolved simulator working directory.
    pub fn working_dir(&self) -> PathBuf {
        self.resolve(&self.simulator.working_dir)
    }

    /// Resolved simulator executable. Bare names are left for `PATH` lookup.
    pub fn executable(&self) -> PathBuf {
        let exe = &self.simulator.executable;
        if exe.components().count() == 1 && !exe.is_absolute() {
            exe.clone()
        } else {
            self.resolve(exe)
        }
    }

    /// Resolved output log path, or `None` when output is discarded.
    pub fn output_log_path(&self) -> Option<PathBuf> {
        self.output_log.as_deref().map(|p| self.resolve(p))
    }

    /// Check that the collaborators that run before the bridge left their
    /// artifacts behind: the simulator executable and its working directory.
    pub fn validate(&self) -> Result<()> {
        let exe = self.executable();
        let found = if exe.components().count() == 1 && !exe.is_absolute() {
            find_on_path(&exe).is_some()
        } else {
            exe.is_file()
        };
        if !found {
            anyhow::bail!("Missing: {}", exe.display());
        }

        let working_dir = self.working_dir();
        if !working_dir.is_dir() {
            anyhow::bail!("Missing: {}", working_dir.display());
        }

        if self.wake_byte == self.frame_marker {
            anyhow::bail!(
                "wake_byte and frame_marker must differ (both 0x{:02x})",
                self.wake_byte
            );
        }
        Ok(())
    }

    /// Simulator invocation that exposes the UART at [`device_path`](Self::device_path).
    pub fn simulator_command(&self) -> SimulatorCommand {
        let setup = UartSetup {
            platform_script: self.simulator.platform_script.clone(),
            terminal_name: self.simulator.terminal_name.clone(),
            uart: self.simulator.uart.clone(),
            device_path: self.device_path(),
            extra_directives: self.simulator.extra_directives.clone(),
        };
        SimulatorCommand::with_uart(self.executable(), self.working_dir(), &setup)
    }

    /// Transport settings derived from this config.
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            device_path: self.device_path(),
            device_timeout: Duration::from_millis(self.device_timeout_ms),
            wake_byte: self.wake_byte,
            frame_marker: self.frame_marker,
            sync_timeout: Duration::from_millis(self.sync_timeout_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            write_pacing: Duration::from_millis(self.write_pacing_ms),
            output_log: self.output_log_path(),
            session_timeouts: self.session_timeouts,
            trace_io: self.trace_io,
        }
    }
}

fn parse_override(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {key}={raw:?}: {e}");
            None
        }
    }
}

fn expand(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&text).as_ref())
}

fn find_on_path(name: &Path) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
