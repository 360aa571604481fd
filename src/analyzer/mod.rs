//! # Analyzer
//!
//! Turns the token stream into a [`Document`]:
//!
//! ```text
//! tokens ─┬─ header tokens ── HeaderLineSplitter ── front_matter ──┐
//!         └─ body tokens ─────────────────────────── body ─────────┴─ Document
//! ```
//!
//! Front-matter errors are fatal and returned as `Err`. Body errors are
//! recoverable and collected in [`Document::errors`].

pub mod combinators;
pub mod core;
pub mod parsers;
pub mod prelude;

pub use core::ParseError;
pub use core::ParseResult;
pub use core::Parser;

use crate::ast::{Document, SyntaxError};
use crate::tokenizer::{tokenize, TokenKind, TokenSpan};

/// Parses a token stream produced by [`crate::tokenizer::Tokenizer`].
#[tracing::instrument(level = "debug", skip(tokens))]
pub fn parse(tokens: &[TokenSpan]) -> Result<Document, SyntaxError> {
    let opening = tokens
        .iter()
        .position(|t| !matches!(t.kind, TokenKind::Whitespace | TokenKind::Newline))
        .filter(|&i| tokens[i].kind == TokenKind::FrontMatterDelim);

    let (front_matter, body_start) = match opening {
        Some(open) => {
            let close = tokens[open + 1..]
                .iter()
                .position(|t| t.kind == TokenKind::FrontMatterDelim)
                .map(|i| i + open + 1)
                .ok_or_else(|| SyntaxError {
                    offset: tokens[open].start,
                    line: tokens[open].line,
                    column: tokens[open].column,
                    description: "unterminated front-matter".to_string(),
                })?;
            let block = parsers::front_matter::parse_front_matter(&tokens[open + 1..close])?;
            (Some(block), skip_delimiter_line(tokens, close + 1))
        }
        None => (None, 0),
    };

    let (body, errors) = parsers::body::parse_body(&tokens[body_start..]);
    tracing::debug!(
        "parsed document with {} body nodes and {} errors",
        body.len(),
        errors.len()
    );
    Ok(Document {
        front_matter,
        body,
        errors,
    })
}

/// Tokenizes and parses `source`.
pub fn parse_source(source: &str) -> Result<Document, SyntaxError> {
    parse(&tokenize(source))
}

/// Skips trailing whitespace and the line break that end the closing `---`.
fn skip_delimiter_line(tokens: &[TokenSpan], mut pos: usize) -> usize {
    while tokens.get(pos).is_some_and(|t| t.kind == TokenKind::Whitespace) {
        pos += 1;
    }
    if tokens.get(pos).is_some_and(|t| t.kind == TokenKind::Newline) {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BodyNode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_document_without_front_matter() {
        let doc = parse_source("Hello $name").unwrap();
        assert!(doc.front_matter.is_none());
        assert_eq!(doc.body.len(), 2);
    }

    #[test]
    fn test_document_with_front_matter() {
        let doc = parse_source("\n---\nname: demo\n---  \nBody\n").unwrap();
        let block = doc.front_matter.unwrap();
        assert_eq!(block.name.as_deref(), Some("demo"));
        assert_eq!(
            doc.body,
            vec![BodyNode::Text {
                text: "Body\n".to_string()
            }]
        );
    }

    #[test]
    fn test_unterminated_front_matter_is_fatal() {
        let err = parse_source("---\nname: demo\nBody").unwrap_err();
        assert_eq!(err.description, "unterminated front-matter");
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_empty_front_matter() {
        let doc = parse_source("---\n---\n").unwrap();
        assert_eq!(doc.front_matter, Some(Default::default()));
        assert!(doc.body.is_empty());
    }
}
