pub mod cli;
pub mod config;
pub mod context;
pub mod posix;
pub mod script;
