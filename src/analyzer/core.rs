//! # Core Parser Definitions
//!
//! The parser interface and error type shared by every combinator in
//! [`super::combinators`].

use thiserror::Error;

/// A parser over a slice of input items.
///
/// `parse` starts at `pos` and on success returns the position after the
/// consumed items together with the produced value.
pub trait Parser<I, O> {
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<O>;
}

/// `Ok((next_position, value))` or the reason parsing failed.
pub type ParseResult<O> = Result<(usize, O), ParseError>;

/// Failure of a combinator. Positions are indices into the input slice.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Unexpected EOF: {message} at position {position}, context: {context:?}")]
    UnexpectedEof {
        message: String,
        position: usize,
        context: Option<String>,
    },
    #[error("Unexpected: expected {expected}, found {found} at position {position}, context: {context:?}")]
    Unexpected {
        expected: String,
        found: String,
        position: usize,
        context: Option<String>,
    },
    #[error("No alternative matched at position {position}, context: {context:?}")]
    NoAlternative {
        position: usize,
        context: Option<String>,
    },
    #[error("Failure: {message} at position {position}, context: {context:?}")]
    Failure {
        message: String,
        position: usize,
        context: Option<String>,
    },
}

impl ParseError {
    pub fn eof(message: impl Into<String>, position: usize) -> Self {
        ParseError::UnexpectedEof {
            message: message.into(),
            position,
            context: None,
        }
    }

    pub fn unexpected(expected: impl Into<String>, found: impl Into<String>, position: usize) -> Self {
        ParseError::Unexpected {
            expected: expected.into(),
            found: found.into(),
            position,
            context: None,
        }
    }

    pub fn failure(message: impl Into<String>, position: usize) -> Self {
        ParseError::Failure {
            message: message.into(),
            position,
            context: None,
        }
    }

    /// Prepends `ctx` to the context chain, outermost first.
    pub fn with_context(self, ctx: &str) -> Self {
        let chain = |context: Option<String>| {
            Some(match context {
                Some(inner) => format!("{} -> {}", ctx, inner),
                None => ctx.to_string(),
            })
        };
        match self {
            ParseError::UnexpectedEof {
                message,
                position,
                context,
            } => ParseError::UnexpectedEof {
                message,
                position,
                context: chain(context),
            },
            ParseError::Unexpected {
                expected,
                found,
                position,
                context,
            } => ParseError::Unexpected {
                expected,
                found,
                position,
                context: chain(context),
            },
            ParseError::NoAlternative { position, context } => ParseError::NoAlternative {
                position,
                context: chain(context),
            },
            ParseError::Failure {
                message,
                position,
                context,
            } => ParseError::Failure {
                message,
                position,
                context: chain(context),
            },
        }
    }

    pub fn get_position(&self) -> usize {
        match self {
            ParseError::UnexpectedEof { position, .. } => *position,
            ParseError::Unexpected { position, .. } => *position,
            ParseError::NoAlternative { position, .. } => *position,
            ParseError::Failure { position, .. } => *position,
        }
    }

    /// Short human readable description without the position suffix.
    pub fn description(&self) -> String {
        match self {
            ParseError::UnexpectedEof { message, .. } => format!("unexpected end of input: {}", message),
            ParseError::Unexpected {
                expected, found, ..
            } => format!("expected {}, found {}", expected, found),
            ParseError::NoAlternative { context, .. } => match context {
                Some(ctx) => format!("unrecognized {}", ctx),
                None => "unrecognized input".to_string(),
            },
            ParseError::Failure { message, .. } => message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain() {
        let err = ParseError::eof("value", 3)
            .with_context("pipeline")
            .with_context("variable");
        assert_eq!(err.get_position(), 3);
        match err {
            ParseError::UnexpectedEof { context, .. } => {
                assert_eq!(context.as_deref(), Some("variable -> pipeline"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_description() {
        let err = ParseError::unexpected("'}'", "'|'", 4);
        assert_eq!(err.description(), "expected '}', found '|'");
        assert_eq!(ParseError::failure("boom", 0).description(), "boom");
    }
}
