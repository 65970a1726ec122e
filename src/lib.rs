pub mod auth;
pub mod config;
pub mod extension;
pub mod ipc;
pub mod monitor;
pub mod process_monitor;
pub mod supervisor;
pub mod tunnel;
pub mod utils;
