//! Operator console for the outpost controller
//!
//! Parses prompt lines into [`ConsoleCommand`]s and runs them against the
//! session hive and the management service.

pub mod command;
pub mod console;
pub mod context;
pub mod format;
pub mod payloads;

pub use command::{render_command_help, render_help, split_words, ConsoleCommand, ParseError};
pub use console::{Console, ConsoleError, Flow};
pub use context::ConsoleContext;
pub use payloads::{
    AgentConfig, AgentGenerator, CommandGenerator, MsfVenom, PayloadRequest, PayloadSource,
};
