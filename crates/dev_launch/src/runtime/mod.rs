//! Runtime components: reaping, process supervision, log watching, probing

pub mod browser;
pub mod orchestrator;
pub mod probe;
pub mod process;
pub mod reaper;
pub mod watcher;

pub use browser::*;
pub use orchestrator::*;
pub use probe::*;
pub use process::*;
pub use reaper::*;
pub use watcher::*;
