mod cli;
pub mod commands;
pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod geometry;
pub mod gpt;
mod io;
pub mod layout;
pub mod path;
pub mod provider;
pub mod source;
pub mod stage;
pub mod types;
pub mod utils;

pub use cli::{DeviceArgs, DiskAction};
pub use commands::run;
pub use error::{DiskError, Result};
