//! # Shire Tokenizer
//!
//! Converts raw script text into a flat, lossless stream of [`token::TokenSpan`]s.
//!
//! The tokenizer never fails: characters that do not start any recognized lexeme
//! become [`token::TokenKind::Text`] so that syntax problems are reported by the
//! parser with proper positions instead of aborting lexing.
//!
//! ## Lexing modes
//!
//! * **Preamble**: whitespace before an opening `---` line.
//! * **Front-matter**: the header between the two `---` lines. Produces keys,
//!   literals, patterns and punctuation.
//! * **Body**: markdown-like text with sigil constructs (`@agent`, `/command`,
//!   `$variable`), code fences and link-label comments.
//!
//! Fence contents are emitted as a single [`token::TokenKind::CodeContent`]
//! token and are never re-lexed.

pub mod comment;
pub mod keyword;
pub mod literal;
pub mod token;
pub mod whitespace;

pub use token::{tokenize, TokenKind, TokenSpan, Tokenizer};
