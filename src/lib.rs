//! Library crate for mqtt-scan-rs exposing reusable modules.
pub mod mqtt;
pub mod output;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod targets;
pub mod types;
