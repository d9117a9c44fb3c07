//! CLI subcommand implementations for simbridge.
//!
//! Each submodule opens a [`TransportChannel`](crate::TransportChannel)
//! from a [`BridgeConfig`](crate::BridgeConfig) and drives it:
//!
//! - [`probe`] - Open, print the marker and the first chunk, close
//! - [`relay`] - Pump stdin to the target and the target to stdout
//!
//! # Usage
//!
//! ```ignore
//! use simbridge::{commands, BridgeConfig};
//!
//! let config = BridgeConfig::load_default()?;
//! let shutdown = Arc::new(AtomicBool::new(false));
//! commands::probe::run(&config, Duration::from_secs(2), &shutdown)?;
//! ```

pub mod probe;
pub mod relay;
