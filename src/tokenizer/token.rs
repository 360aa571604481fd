use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::one_of,
    combinator::map,
    error::{context, VerboseError},
    IResult,
};
use serde::Serialize;

use super::{
    comment::{parse_hash_comment, parse_label_comment},
    keyword::{is_identifier_start, parse_identifier, parse_variable_name, parse_word, Keyword},
    literal::{parse_number, parse_pattern, parse_quoted_string},
    whitespace::{is_delimiter_line, parse_newline, parse_whitespace, starts_with_front_matter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    // Sigils
    AgentSigil,
    CommandSigil,
    VariableSigil,
    // Structure
    FrontMatterDelim,
    CodeFenceStart,
    CodeFenceEnd,
    LanguageId,
    CodeContent,
    // Values
    Identifier,
    QuotedString,
    Number,
    Boolean,
    PatternExpr,
    CommandProp,
    Keyword(Keyword),
    // Punctuation
    Colon,
    Comma,
    Pipe,
    Bang,
    Dash,
    OpenBrace,
    CloseBrace,
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    // Formatting
    Comment,
    Whitespace,
    Newline,
    Text,
}

impl TokenKind {
    /// Tokens that carry no meaning for the front-matter grammar.
    pub fn is_trivia(&self) -> bool {
        matches!(self, TokenKind::Whitespace | TokenKind::Comment)
    }

    pub fn is_sigil(&self) -> bool {
        matches!(
            self,
            TokenKind::AgentSigil | TokenKind::CommandSigil | TokenKind::VariableSigil
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSpan {
    pub kind: TokenKind,
    pub text: String,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl TokenSpan {
    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }
}

impl std::fmt::Display for TokenSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({:?}) at line: {}, column: {}",
            self.kind, self.text, self.line, self.column
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexerMode {
    Preamble,
    FrontMatter,
    Body,
}

/// A lexeme recognized in one step: its kind and byte length.
type Piece = (TokenKind, usize);

#[derive(Debug, Clone)]
pub struct Tokenizer {
    current_position: usize,
    current_line: usize,
    current_column: usize,
    previous_char: Option<char>,
    /// Quote character of a prose quotation still open on this line.
    open_quote: Option<char>,
    mode: LexerMode,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            current_position: 0,
            current_line: 1,   // 1-based
            current_column: 1, // 1-based
            previous_char: None,
            open_quote: None,
            mode: LexerMode::Body,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, input))]
    pub fn tokenize(&mut self, input: &str) -> Vec<TokenSpan> {
        let mut tokens: Vec<TokenSpan> = Vec::new();
        self.mode = if starts_with_front_matter(input) {
            LexerMode::Preamble
        } else {
            LexerMode::Body
        };

        let mut remaining = input;
        while !remaining.is_empty() {
            let pieces = match self.mode {
                LexerMode::Preamble => self.preamble_step(remaining),
                LexerMode::FrontMatter => self.front_matter_step(remaining),
                LexerMode::Body => self.body_step(remaining),
            };

            for (kind, len) in pieces {
                let (consumed, rest) = remaining.split_at(len);
                self.push(&mut tokens, kind, consumed);
                remaining = rest;
            }
        }

        tracing::debug!("tokenized {} bytes into {} tokens", input.len(), tokens.len());
        tokens
    }

    fn push(&mut self, tokens: &mut Vec<TokenSpan>, kind: TokenKind, text: &str) {
        let start = self.current_position;
        let (line, column) = (self.current_line, self.current_column);
        self.update_position(text);

        // Adjacent text runs collapse into one token.
        if kind == TokenKind::Text {
            if let Some(last) = tokens.last_mut() {
                if last.kind == TokenKind::Text && last.end == start {
                    last.text.push_str(text);
                    last.end = self.current_position;
                    return;
                }
            }
        }

        tokens.push(TokenSpan {
            kind,
            text: text.to_string(),
            start,
            end: self.current_position,
            line,
            column,
        });
    }

    fn update_position(&mut self, text: &str) {
        for c in text.chars() {
            self.current_position += c.len_utf8();
            if c == '\n' {
                self.current_line += 1;
                self.current_column = 1;
            } else {
                self.current_column += 1;
            }
            self.previous_char = Some(c);
        }
    }

    fn at_line_start(&self) -> bool {
        self.current_column == 1
    }

    fn preamble_step(&mut self, input: &str) -> Vec<Piece> {
        if self.at_line_start() && is_delimiter_line(input) {
            self.mode = LexerMode::FrontMatter;
            return delimiter_pieces(input);
        }
        vec![single(alt((parse_whitespace, parse_newline))(input), input)]
    }

    fn front_matter_step(&mut self, input: &str) -> Vec<Piece> {
        if self.at_line_start() && is_delimiter_line(input) {
            self.mode = LexerMode::Body;
            return delimiter_pieces(input);
        }
        let result = alt((
            parse_whitespace,
            parse_newline,
            parse_hash_comment,
            parse_quoted_string,
            parse_pattern,
            parse_number,
            parse_word,
            parse_punctuation,
        ))(input);
        vec![single(result, input)]
    }

    fn body_step(&mut self, input: &str) -> Vec<Piece> {
        if self.at_line_start() {
            if let Ok(found) = parse_label_comment(input) {
                return vec![single(Ok(found), input)];
            }
        }
        if let Ok(found) = parse_newline(input) {
            self.open_quote = None;
            return vec![single(Ok(found), input)];
        }
        if input.starts_with(FENCE) {
            self.open_quote = None;
            return fence_pieces(input);
        }
        if self.open_quote.is_none() {
            if let Some(pieces) = sigil_pieces(input, self.previous_char) {
                return pieces;
            }
        }
        let (len, open_quote) = text_run_len(input, self.previous_char, self.open_quote);
        self.open_quote = open_quote;
        vec![(TokenKind::Text, len)]
    }
}

/// Tokenizes `source` with a fresh [`Tokenizer`].
pub fn tokenize(source: &str) -> Vec<TokenSpan> {
    Tokenizer::new().tokenize(source)
}

const FENCE: &str = "```";

/// Converts a nom result into a piece, falling back to one character of text.
fn single(result: ParserResult<TokenKind>, input: &str) -> Piece {
    match result {
        Ok((rest, kind)) if rest.len() < input.len() => (kind, input.len() - rest.len()),
        _ => (TokenKind::Text, first_char_len(input)),
    }
}

fn first_char_len(input: &str) -> usize {
    input.chars().next().map(char::len_utf8).unwrap_or(0)
}

fn delimiter_pieces(input: &str) -> Vec<Piece> {
    let line = input.split('\n').next().unwrap_or_default();
    let line = line.strip_suffix('\r').unwrap_or(line);
    let leading = line.len() - line.trim_start().len();
    let trailing = line.len() - line.trim_end().len();
    let mut pieces = Vec::new();
    if leading > 0 {
        pieces.push((TokenKind::Whitespace, leading));
    }
    pieces.push((TokenKind::FrontMatterDelim, 3));
    if trailing > 0 {
        pieces.push((TokenKind::Whitespace, trailing));
    }
    pieces
}

#[tracing::instrument(level = "debug", skip(input))]
fn parse_punctuation(input: &str) -> ParserResult<TokenKind> {
    context(
        "punctuation",
        map(one_of(":,|!{}()[]-$"), |c| match c {
            ':' => TokenKind::Colon,
            ',' => TokenKind::Comma,
            '|' => TokenKind::Pipe,
            '!' => TokenKind::Bang,
            '{' => TokenKind::OpenBrace,
            '}' => TokenKind::CloseBrace,
            '(' => TokenKind::OpenParen,
            ')' => TokenKind::CloseParen,
            '[' => TokenKind::OpenBracket,
            ']' => TokenKind::CloseBracket,
            '-' => TokenKind::Dash,
            _ => TokenKind::VariableSigil,
        }),
    )(input)
}

/// Opening fence, optional language id, and content plus closing fence when
/// a closing fence exists further on.
fn fence_pieces(input: &str) -> Vec<Piece> {
    let mut pieces = vec![(TokenKind::CodeFenceStart, FENCE.len())];
    let mut offset = FENCE.len();

    let lang: ParserResult<&str> =
        take_while1(|c: char| c.is_alphanumeric() || matches!(c, '+' | '-' | '#' | '_' | '.'))(
            &input[offset..],
        );
    if let Ok((_, lang)) = lang {
        pieces.push((TokenKind::LanguageId, lang.len()));
        offset += lang.len();
    }

    if let Some(content_len) = input[offset..].find(FENCE) {
        if content_len > 0 {
            pieces.push((TokenKind::CodeContent, content_len));
        }
        pieces.push((TokenKind::CodeFenceEnd, FENCE.len()));
    }
    pieces
}

fn sigil_allowed_after(previous: Option<char>) -> bool {
    match previous {
        None => true,
        Some(c) => c.is_whitespace() || matches!(c, '(' | '[' | '{'),
    }
}

/// Quote state after `c`. A quote opens only at the start of a word, so
/// apostrophes inside words (`don't`) never open one; it closes at the same
/// character or at the end of the line.
fn next_quote_state(open: Option<char>, previous: Option<char>, c: char) -> Option<char> {
    match open {
        _ if c == '\n' => None,
        Some(q) if c == q => None,
        Some(q) => Some(q),
        None if matches!(c, '"' | '\'') && sigil_allowed_after(previous) => Some(c),
        None => None,
    }
}

/// Recognizes `@agent`, `/command[:prop]`, `$var` and `${var}`.
fn sigil_pieces(input: &str, previous: Option<char>) -> Option<Vec<Piece>> {
    if !sigil_allowed_after(previous) {
        return None;
    }
    let mut chars = input.chars();
    let sigil = chars.next()?;
    let next = chars.next()?;
    let rest = &input[1..];

    match sigil {
        '@' if is_identifier_start(next) => {
            let (_, name) = parse_identifier(rest).ok()?;
            Some(vec![(TokenKind::AgentSigil, 1), (TokenKind::Identifier, name.len())])
        }
        '@' if next == '"' => {
            let (after, _) = parse_quoted_string(rest).ok()?;
            Some(vec![
                (TokenKind::AgentSigil, 1),
                (TokenKind::QuotedString, rest.len() - after.len()),
            ])
        }
        '/' if is_identifier_start(next) => {
            let (after, name) = parse_identifier(rest).ok()?;
            let mut pieces = vec![(TokenKind::CommandSigil, 1), (TokenKind::Identifier, name.len())];
            if let Some(prop) = after.strip_prefix(':') {
                pieces.push((TokenKind::Colon, 1));
                if let Ok((left, _)) = parse_quoted_string(prop) {
                    pieces.push((TokenKind::QuotedString, prop.len() - left.len()));
                } else {
                    let len = prop.find(char::is_whitespace).unwrap_or(prop.len());
                    if len > 0 {
                        pieces.push((TokenKind::CommandProp, len));
                    }
                }
            }
            Some(pieces)
        }
        '$' if is_identifier_start(next) => {
            let (_, name) = parse_variable_name(rest).ok()?;
            Some(vec![(TokenKind::VariableSigil, 1), (TokenKind::Identifier, name.len())])
        }
        '$' if next == '{' => {
            let (after, name) = parse_variable_name(&rest[1..]).ok()?;
            let mut pieces = vec![
                (TokenKind::VariableSigil, 1),
                (TokenKind::OpenBrace, 1),
                (TokenKind::Identifier, name.len()),
            ];
            if after.starts_with('}') {
                pieces.push((TokenKind::CloseBrace, 1));
            }
            Some(pieces)
        }
        _ => None,
    }
}

/// Length of plain text up to the next newline, fence or sigil construct,
/// and the quote state at its end. Sigils inside an open quote are text.
fn text_run_len(input: &str, previous: Option<char>, open_quote: Option<char>) -> (usize, Option<char>) {
    let mut prev = previous;
    let mut quote = open_quote;
    for (idx, c) in input.char_indices() {
        if idx > 0 {
            let here = &input[idx..];
            let boundary = c == '\n'
                || here.starts_with("\r\n")
                || here.starts_with(FENCE)
                || (quote.is_none()
                    && matches!(c, '@' | '/' | '$')
                    && sigil_pieces(here, prev).is_some());
            if boundary {
                return (idx, quote);
            }
        }
        quote = next_quote_state(quote, prev, c);
        prev = Some(c);
    }
    (input.len(), quote)
}

pub type ParserResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;
