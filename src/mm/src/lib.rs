mod anon;
mod config;
mod engine;
mod opts;

pub use anon::AnonArena;
pub use config::{AnonStrategy, MmapConfig, DEFAULT_ARENA_SIZE};
pub use engine::MmapEngine;
pub use opts::MmapOpts;
