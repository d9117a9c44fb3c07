//! `simbridge relay`: bridge stdio to the simulated target.
//!
//! Host tooling that speaks the RPC protocol over a pipe launches the relay
//! and talks to its stdin/stdout. Everything runs on one thread around a
//! single readiness wait.
//!
//! # Architecture
//!
//! ```text
//! stdin (fd 0) ──libc::read──▶ TransportChannel::write ──▶ target
//! target ──▶ TransportChannel::read ──▶ stdout (flushed per chunk)
//!
//! loop: wait_ready([stdin, device], tick) → service → check shutdown flag
//! ```
//!
//! The relay ends on stdin EOF, on channel closure, or when the shutdown
//! flag is raised (SIGINT/SIGTERM/SIGHUP in the binary).

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::constants::{RELAY_CHUNK_SIZE, RELAY_TICK, RELAY_WRITE_TIMEOUT};
use crate::error::TransportError;
use crate::transport::deadline::Deadline;
use crate::transport::ready::wait_ready;
use crate::transport::TransportChannel;

/// Why a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The input side reached end of stream.
    InputClosed,
    /// The target side closed the link.
    TargetClosed,
    /// The shutdown flag was raised.
    Shutdown,
}

/// Byte counts for one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes forwarded from input to the target.
    pub to_target: u64,
    /// Bytes forwarded from the target to output.
    pub from_target: u64,
    /// How the session ended.
    pub end: RelayEnd,
}

/// Open the transport and relay stdin/stdout until either side closes or
/// `shutdown` is raised. Raising it while the transport is still opening
/// abandons the open.
pub fn run(config: &BridgeConfig, shutdown: &Arc<AtomicBool>) -> Result<()> {
    config.validate()?;

    let mut channel =
        TransportChannel::new(config.channel_settings()).with_shutdown_flag(Arc::clone(shutdown));
    channel.open(&config.simulator_command())?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = pump(&mut channel, libc::STDIN_FILENO, &mut out, shutdown);
    channel.close();

    let stats = result?;
    log::info!(
        "Relay finished ({:?}): {} bytes to target, {} bytes from target",
        stats.end,
        stats.to_target,
        stats.from_target
    );
    Ok(())
}

/// Relay between `input` and `output` over an open `channel`.
///
/// `input` is read with raw `read(2)` so readiness stays in step with the
/// kernel descriptor; it is never closed here.
pub fn pump(
    channel: &mut TransportChannel,
    input: RawFd,
    output: &mut impl Write,
    shutdown: &AtomicBool,
) -> Result<RelayStats> {
    let mut stats = RelayStats {
        to_target: 0,
        from_target: 0,
        end: RelayEnd::Shutdown,
    };
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];

    while !shutdown.load(Ordering::Relaxed) {
        // A synchronized marker never shows up as device readiness.
        if channel.has_pending() {
            if !forward_from_target(channel, output, &mut stats)? {
                stats.end = RelayEnd::TargetClosed;
                return Ok(stats);
            }
            continue;
        }

        let Some(device) = channel.raw_fd() else {
            stats.end = RelayEnd::TargetClosed;
            return Ok(stats);
        };

        let readiness = match wait_ready(&[input, device], &[], Deadline::after(RELAY_TICK)) {
            Ok(readiness) => readiness,
            Err(TransportError::IoTimeout) => continue,
            Err(e) => return Err(e).context("Relay wait failed"),
        };
        let has = |fd: RawFd| readiness.readable.contains(&fd) || readiness.exceptional.contains(&fd);

        if has(device) && !forward_from_target(channel, output, &mut stats)? {
            stats.end = RelayEnd::TargetClosed;
            return Ok(stats);
        }

        if has(input) {
            match read_input(input, &mut buf) {
                Ok(0) => {
                    log::debug!("Relay input reached end of stream");
                    stats.end = RelayEnd::InputClosed;
                    return Ok(stats);
                }
                Ok(n) => match channel.write(&buf[..n], Some(RELAY_WRITE_TIMEOUT)) {
                    Ok(()) => stats.to_target += n as u64,
                    Err(TransportError::ChannelClosed) => {
                        stats.end = RelayEnd::TargetClosed;
                        return Ok(stats);
                    }
                    Err(e) => return Err(e).context("Failed to forward input to target"),
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e).context("Failed to read relay input"),
            }
        }
    }

    log::info!("Relay shutdown requested");
    Ok(stats)
}

/// Read one chunk from the target into `output`. Returns `false` once the
/// target side has closed.
fn forward_from_target(
    channel: &mut TransportChannel,
    output: &mut impl Write,
    stats: &mut RelayStats,
) -> Result<bool> {
    match channel.read(RELAY_CHUNK_SIZE, Some(RELAY_TICK)) {
        Ok(chunk) => {
            output.write_all(&chunk).context("Failed to write relay output")?;
            output.flush().context("Failed to flush relay output")?;
            stats.from_target += chunk.len() as u64;
            Ok(true)
        }
        Err(TransportError::IoTimeout) => Ok(true),
        Err(TransportError::ChannelClosed) => Ok(false),
        Err(e) => Err(e).context("Failed to read from target"),
    }
}

fn read_input(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is a valid, exclusively borrowed buffer of `buf.len()`
    // bytes; `fd` stays open for the duration of the call.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
