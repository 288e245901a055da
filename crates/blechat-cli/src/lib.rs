//! blechat CLI library
//!
//! The pieces of the `blechat` binary: argument parsing, configuration, the
//! interactive command parser and the chat loop driving the runtime.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod display;
pub mod error;

pub use app::ChatApp;
pub use cli::{Cli, Commands};
pub use config::{AppConfig, ChatConfig};
pub use error::{CliError, Result};
