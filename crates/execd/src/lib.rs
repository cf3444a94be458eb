pub mod cli;
pub mod commands;
pub mod error;

pub use execd_core::{config, runtime, utils};
