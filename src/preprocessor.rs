//! # Token Preprocessing
//!
//! Sits between the tokenizer and the front-matter parser:
//!
//! ```text
//! Source → Tokenizer → Preprocessor → Parser → Compiler
//! ```
//!
//! The header grammar is line and indentation based, so the raw header tokens
//! are first grouped into logical lines ([`HeaderLineSplitter`]) and each line
//! is then stripped of trivia ([`TriviaFilter`]). Body tokens are never
//! preprocessed; the body parser needs every token to stay lossless.

use crate::tokenizer::{TokenKind, TokenSpan};

pub trait Preprocessor<T, U = T> {
    fn process(&self, input: T) -> U;
}

/// Drops whitespace, comments and line breaks.
#[derive(Debug, Default, Clone, Copy)]
pub struct TriviaFilter;

impl Preprocessor<Vec<TokenSpan>> for TriviaFilter {
    fn process(&self, input: Vec<TokenSpan>) -> Vec<TokenSpan> {
        input
            .into_iter()
            .filter(|t| !t.kind.is_trivia() && t.kind != TokenKind::Newline)
            .collect()
    }
}

/// One logical header line. Line breaks inside `{}`, `[]` or `()` do not end a
/// line, so a pipeline may span several physical lines.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderLine {
    /// Width of the leading whitespace, tabs counting as two columns.
    pub indent: usize,
    /// Every token of the line, trivia included.
    pub raw: Vec<TokenSpan>,
}

impl HeaderLine {
    /// Tokens that matter to the grammar.
    pub fn significant(&self) -> Vec<TokenSpan> {
        TriviaFilter.process(self.raw.clone())
    }

    /// Source text from byte offset `from` onwards, without comments, trimmed.
    pub fn text_from(&self, from: usize) -> String {
        self.raw
            .iter()
            .filter(|t| t.start >= from && t.kind != TokenKind::Comment)
            .map(|t| t.text.as_str())
            .collect::<String>()
            .trim()
            .to_string()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderLineSplitter;

impl Preprocessor<&[TokenSpan], Vec<HeaderLine>> for HeaderLineSplitter {
    fn process(&self, input: &[TokenSpan]) -> Vec<HeaderLine> {
        let mut lines = Vec::new();
        let mut current: Vec<TokenSpan> = Vec::new();
        let mut depth: usize = 0;

        for token in input {
            match token.kind {
                TokenKind::OpenBrace | TokenKind::OpenBracket | TokenKind::OpenParen => depth += 1,
                TokenKind::CloseBrace | TokenKind::CloseBracket | TokenKind::CloseParen => {
                    depth = depth.saturating_sub(1)
                }
                TokenKind::Newline if depth == 0 => {
                    push_line(&mut lines, std::mem::take(&mut current));
                    continue;
                }
                _ => {}
            }
            current.push(token.clone());
        }
        push_line(&mut lines, current);
        lines
    }
}

fn push_line(lines: &mut Vec<HeaderLine>, raw: Vec<TokenSpan>) {
    if raw.iter().all(|t| t.kind.is_trivia() || t.kind == TokenKind::Newline) {
        return;
    }
    let indent = match raw.first() {
        Some(t) if t.kind == TokenKind::Whitespace => t
            .text
            .chars()
            .map(|c| if c == '\t' { 2 } else { 1 })
            .sum(),
        _ => 0,
    };
    lines.push(HeaderLine { indent, raw });
}
