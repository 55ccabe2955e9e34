// file: src/lib.rs
// version: 1.2.0
// guid: 4f2a9c1e-8b3d-4e6f-9a07-5c1d2e3f4a5b

//! # Pi Provision Agent
//!
//! End-to-end provisioning for headless single-board computers: writes an OS
//! image to removable media with unattended network/SSH bootstrap baked in,
//! locates the booted device on the local network, and drives a staged remote
//! installation over SSH while streaming progress to the caller.

pub mod cli;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod flash;
pub mod keys;
pub mod logging;
pub mod progress;
pub mod remote;
pub mod session;
pub mod store;

pub use error::{ProvisionError, Result};

/// Version information for the agent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
