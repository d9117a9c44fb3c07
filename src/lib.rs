//! simbridge - byte transport between host tooling and a simulated target.
//!
//! This crate launches a hardware simulator (Renode in the reference
//! deployment), attaches to the virtual UART it exposes as a PTY, and
//! offers a synchronized byte channel for an RPC protocol running on the
//! simulated target.
//!
//! # Architecture
//!
//! Components, leaf first:
//!
//! - **ProcessSupervisor** - Starts the simulator as a process-group leader,
//!   tears the whole group down
//! - **DeviceChannel** - Waits for the device node, opens it raw and
//!   non-blocking
//! - **FrameSynchronizer** - Wakes the target and skips to the frame marker
//! - **TransportChannel** - Read/write/close surface with per-call timeouts
//!
//! # Modules
//!
//! - [`transport`] - [`TransportChannel`], deadlines, readiness, sync
//! - [`device`] - Device node handling
//! - [`process`] - Simulator process supervision
//! - [`simulator`] - Simulator command line
//! - [`config`] - Configuration loading
//! - [`commands`] - CLI subcommands
//!
//! # Example
//!
//! ```no_run
//! use simbridge::{BridgeConfig, TransportChannel};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = BridgeConfig::for_cfu_project("/opt/CFU-Playground", "/tmp/project");
//! config.validate()?;
//!
//! let mut channel = TransportChannel::new(config.channel_settings());
//! channel.open(&config.simulator_command())?;
//! channel.write(b"\xfe\x00", Some(Duration::from_secs(1)))?;
//! let reply = channel.read(64, Some(Duration::from_secs(1)))?;
//! channel.close();
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod process;
pub mod simulator;
pub mod transport;

// Re-export commonly used types
pub use config::BridgeConfig;
pub use device::ChannelDescriptor;
pub use error::TransportError;
pub use process::{ProcessControl, ProcessSupervisor, SimulatorHandle, SimulatorState};
pub use simulator::SimulatorCommand;
pub use transport::deadline::Deadline;
pub use transport::sync::{FrameSynchronizer, SyncBuffer};
pub use transport::{ChannelSettings, ChannelState, SessionTimeouts, TransportChannel};
