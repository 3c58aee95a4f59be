//! Launcher configuration and emulator config files

mod launch_config;
mod sidecar_files;

pub use launch_config::*;
pub use sidecar_files::*;
