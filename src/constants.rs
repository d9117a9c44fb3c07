//! Bridge-wide constants for simbridge.
//!
//! Centralizes the wire bytes, polling intervals, and default timeouts
//! used by the transport. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Wire**: Bytes exchanged with the simulated target
//! - **Layout**: File names inside the project directory
//! - **Timeouts**: Default deadlines for each blocking phase
//! - **Polling**: Intervals for bounded polling and write pacing
//! - **Commands**: Buffer sizes and timeouts for the CLI subcommands

use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// Byte sent once after the device opens to switch the target into its
/// RPC-serving mode.
///
/// The target firmware presents a numbered project menu on its UART;
/// ASCII `'3'` selects the RPC server entry.
pub const WAKE_BYTE: u8 = b'3';

/// First byte of the RPC byte stream.
///
/// Everything the target prints before this byte (banner, menu text) is
/// noise and is discarded during synchronization.
pub const FRAME_MARKER: u8 = 0xFE;

/// Maximum number of discarded bytes retained for sync diagnostics.
///
/// Only the most recent bytes are kept so a chatty target cannot grow
/// the history without bound.
pub const SYNC_HISTORY_LIMIT: usize = 4096;

/// Largest buffer a single `TransportChannel::read` allocates.
pub const MAX_READ_CHUNK: usize = 64 * 1024;

// ============================================================================
// Layout
// ============================================================================

/// File name of the virtual UART device node inside the project directory.
pub const DEVICE_FILE_NAME: &str = "uart.pty";

/// File name of the simulator's merged stdout/stderr log.
pub const SIMULATOR_LOG_FILE_NAME: &str = "simulator.log";

/// Config file name inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

// ============================================================================
// Timeouts
// ============================================================================

/// How long to wait for the simulator to create the device node.
///
/// Renode takes several seconds to boot and load the platform script
/// before the PTY terminal exists.
pub const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cumulative bound on reading noise before the frame marker appears.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL when stopping the simulator.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_millis(200);

// ============================================================================
// Polling
// ============================================================================

/// Interval between existence checks while waiting for the device node.
pub const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Delay between write attempts when the link accepts only part of a buffer.
///
/// The virtual UART drains slowly; retrying immediately would spin.
pub const WRITE_PACING_DELAY: Duration = Duration::from_millis(50);

/// Longest a cancellable wait goes without checking the shutdown flag.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Interval between liveness checks during the stop grace period.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Commands
// ============================================================================

/// Size of the relay buffer used by the `relay` subcommand.
pub const RELAY_CHUNK_SIZE: usize = 4096;

/// Readiness timeout used by the relay loop between shutdown-flag checks.
pub const RELAY_TICK: Duration = Duration::from_millis(50);

/// Bound on forwarding one relay chunk to the target.
pub const RELAY_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for data in the `probe` subcommand.
pub const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(2);
