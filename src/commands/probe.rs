//! `simbridge probe`: check that a session can be opened end to end.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::constants::RELAY_CHUNK_SIZE;
use crate::transport::sync::hex;
use crate::transport::TransportChannel;

/// Open the transport, print the frame marker and the first chunk the
/// target sends, then close.
///
/// A target that stays quiet after the marker is not an error. Raising
/// `shutdown` abandons the open, or skips the remaining reads once open.
pub fn run(config: &BridgeConfig, read_timeout: Duration, shutdown: &Arc<AtomicBool>) -> Result<()> {
    config.validate()?;

    let mut channel =
        TransportChannel::new(config.channel_settings()).with_shutdown_flag(Arc::clone(shutdown));
    let timeouts = channel.open(&config.simulator_command())?;

    if let (Some(path), Some(pid)) = (channel.device_path(), channel.simulator_pid()) {
        println!("Transport open on {} (simulator pid {pid})", path.display());
    }
    println!(
        "Session timeouts: {}",
        serde_json::to_string(&timeouts).context("Failed to render session timeouts")?
    );

    let marker = channel.read(1, Some(read_timeout))?;
    println!("Frame marker: {}", hex(&marker));

    if shutdown.load(Ordering::Relaxed) {
        log::info!("Probe interrupted before the first chunk");
    } else {
        match channel.read(RELAY_CHUNK_SIZE, Some(read_timeout)) {
            Ok(chunk) => println!("First chunk ({} bytes): {}", chunk.len(), hex(&chunk)),
            Err(e) if e.is_timeout() => println!("No data within {read_timeout:?}"),
            Err(e) => return Err(e.into()),
        }
    }

    channel.close();
    println!("Transport closed");
    Ok(())
}
