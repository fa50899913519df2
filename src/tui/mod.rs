//! TUI module for terminal user interfaces

mod monitor;

pub use monitor::ProbeMonitor;
