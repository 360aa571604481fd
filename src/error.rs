use thiserror::Error;

use crate::analyzer::ParseError;
use crate::ast::SyntaxError;
use crate::command::CommandExecutionError;
use crate::compiler::AgentDispatchError;
use crate::config::ConfigError;
use crate::snapshot::SnapshotError;
use crate::source::SourceError;
use crate::streaming::PostProcessError;
use crate::variable::VariableResolutionError;

#[derive(Error, Debug)]
pub enum ShireError {
    #[error("Syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Variable error: {0}")]
    Variable(#[from] VariableResolutionError),
    #[error("Command error: {0}")]
    Command(#[from] CommandExecutionError),
    #[error("Agent dispatch error: {0}")]
    AgentDispatch(#[from] AgentDispatchError),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("Post-process error: {0}")]
    PostProcess(#[from] PostProcessError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ShireResult<T> = Result<T, ShireError>;

impl ShireError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        ShireError::Internal(message.into())
    }
}
