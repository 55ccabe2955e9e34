// file: src/logging/mod.rs
// version: 1.0.0
// guid: 9a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9

//! Logging system for the provisioning agent

pub mod logger;

pub use logger::init_logger;
