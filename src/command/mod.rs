//! Local commands invoked from the body with `/name[:argument]`.

pub mod handler;
pub mod safety;

use thiserror::Error;

use crate::source::SourceError;

pub use handler::{
    CodeInput, CommandContext, CommandHandler, CommandInvocation, CommandRegistry, DirCommand, FileCommand,
    PrintCommand, ShellCommand, WriteCommand,
};
pub use safety::{DefaultShellSafetyChecker, MockShellSafetyChecker, SafetyVerdict, ShellSafetyChecker};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandExecutionError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("`{command}` requires an argument")]
    MissingArgument { command: String },
    #[error("`{command}` requires a following code block")]
    MissingCodeBlock { command: String },
    #[error("invalid line range {start}-{end} for `{path}`")]
    InvalidRange { path: String, start: usize, end: usize },
    #[error("`{command}` blocked: {reason}")]
    Blocked { command: String, reason: String },
    #[error("`{command}` timed out after {millis}ms")]
    Timeout { command: String, millis: u128 },
    #[error("`{command}` failed: {message}")]
    Failed { command: String, message: String },
    #[error("`{0}` cancelled")]
    Cancelled(String),
    #[error(transparent)]
    Source(#[from] SourceError),
}
