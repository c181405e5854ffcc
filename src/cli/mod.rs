//! CLI commands for poolguard
//!
//! # Usage
//!
//! ```bash
//! # Serve the HTTP surface
//! poolguard serve --listen 0.0.0.0:8080
//!
//! # Validate a configuration file
//! poolguard --config poolguard.yaml check-config
//!
//! # Drive the read path against the in-memory database
//! poolguard simulate --tenants 50 --requests 100000 --concurrency 64
//! ```

pub mod commands;

pub use commands::{cmd_check_config, cmd_simulate, CmdSimulate, OutputFormat, SimulationSummary};
