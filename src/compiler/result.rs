use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::{BodyNode, FrontMatterBlock, SyntaxError};
use crate::variable::VariableTable;

/// Prefix of every inline error written into the output.
pub const ERROR_MARKER: &str = "<ShireError>";

pub fn error_marker(message: impl std::fmt::Display) -> String {
    format!("{}: {}", ERROR_MARKER, message)
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentDispatchError {
    #[error("unknown agent `{0}`")]
    UnknownAgent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CompileState {
    Parsed,
    VariablesResolved,
    BodyExecuted,
    LocalResult,
    AgentDispatch,
    Done,
    Error,
}

/// A follow-up script, resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub path: String,
}

/// Hand-off of the rest of the body to a conversational agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocationRequest {
    pub name: String,
    /// Output produced before the mention.
    pub context: String,
    /// Body nodes after the mention, not executed.
    pub deferred_nodes: Vec<BodyNode>,
    /// Source text of the deferred nodes.
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledResult {
    pub input: String,
    pub output: String,
    pub is_local_command: bool,
    pub has_error: bool,
    pub error_message: Option<String>,
    pub agent_invocation: Option<AgentInvocationRequest>,
    pub next_job: Option<DocumentRef>,
    pub resolved_config: Option<FrontMatterBlock>,
    pub dispatch_error: Option<AgentDispatchError>,
    /// Result of the front-matter `when` guard; true when there is none.
    pub condition_met: bool,
    pub warnings: Vec<String>,
    /// Recoverable syntax errors of the body.
    pub errors: Vec<SyntaxError>,
    pub variables: VariableTable,
    pub state: CompileState,
    /// Every state the run passed through, in order.
    pub transitions: Vec<CompileState>,
}

impl CompiledResult {
    pub(crate) fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
            output: String::new(),
            is_local_command: true,
            has_error: false,
            error_message: None,
            agent_invocation: None,
            next_job: None,
            resolved_config: None,
            dispatch_error: None,
            condition_met: true,
            warnings: Vec::new(),
            errors: Vec::new(),
            variables: VariableTable::new(),
            state: CompileState::Parsed,
            transitions: vec![CompileState::Parsed],
        }
    }

    pub(crate) fn transition(&mut self, state: CompileState) {
        tracing::debug!("compile state {} -> {}", self.state, state);
        self.state = state;
        self.transitions.push(state);
    }

    /// Ends the run in `ERROR` with `message`.
    pub(crate) fn fail(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("compilation failed: {}", message);
        self.has_error = true;
        self.error_message = Some(message);
        self.transition(CompileState::Error);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == CompileState::Error
            && self
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("cancelled"))
    }
}
