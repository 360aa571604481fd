//! # Variable Resolution
//!
//! Declared variables are evaluated in declaration order:
//!
//! ```text
//! "logs": /logs\/.*\.log/ { read | grep("ERROR") | head(5) }
//!          └── source ──┘   └───────── pipeline ─────────┘
//! ```
//!
//! The source is selected first, then each pipeline function is applied to
//! the previous value through the [`ResolverRegistry`]. Every applied step is
//! recorded in the [`VariableTable`] operation arena.

pub mod condition;
pub mod engine;
pub mod resolver;
pub mod table;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::SourceError;

pub use condition::{Condition, ConditionError};
pub use engine::{AppliedStep, PipelineFailure, VariableEngine};
pub use resolver::{
    BuiltinFunction, NamedReference, ResolverContext, ResolverRegistry, ScriptExecutor, VariableResolver,
};
pub use table::{ResolvedVariable, VariableOperation, VariableScope, VariableTable};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VariableResolutionError {
    #[error("no source matches `{pattern}` for variable `{variable}`")]
    MissingSource { variable: String, pattern: String },
    #[error("invalid pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("unknown function `{function}` in variable `{variable}`")]
    UnknownFunction { variable: String, function: String },
    #[error("variable `{variable}` refers to `{reference}` before it is declared")]
    ForwardReference { variable: String, reference: String },
    #[error("variable `{variable}` refers to unknown variable `{reference}`")]
    UnknownReference { variable: String, reference: String },
    #[error("invalid argument for `{function}`: {message}")]
    InvalidArgument { function: String, message: String },
    #[error("`{function}` failed in variable `{variable}`: {message}")]
    StepFailed {
        variable: String,
        function: String,
        message: String,
    },
    #[error("required variable `{variable}` failed: {cause}")]
    RequiredFailed {
        variable: String,
        cause: Box<VariableResolutionError>,
    },
    #[error("script `{path}` failed: {message}")]
    ScriptFailed { path: String, message: String },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("variable resolution cancelled")]
    Cancelled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum VariableType {
    Null,
    String,
    Integer,
    Float,
    Boolean,
    List,
}

/// A resolved value. Lists render one item per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    #[default]
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    List(Vec<Value>),
}

impl Value {
    pub fn value_type(&self) -> VariableType {
        match self {
            Value::Null => VariableType::Null,
            Value::String(_) => VariableType::String,
            Value::Integer(_) => VariableType::Integer,
            Value::Float(_) => VariableType::Float,
            Value::Boolean(_) => VariableType::Boolean,
            Value::List(_) => VariableType::List,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(lines.into_iter().map(|l| Value::String(l.into())).collect())
    }

    /// Line view used by the line-oriented pipeline functions.
    pub fn as_lines(&self) -> Vec<String> {
        match self {
            Value::Null => Vec::new(),
            Value::List(items) => items.iter().map(ToString::to_string).collect(),
            other => other.to_string().lines().map(str::to_string).collect(),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "{}", items.join("\n"))
            }
        }
    }
}
