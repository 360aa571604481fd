//! # Comment Tokens
//!
//! Two comment forms exist:
//!
//! * **Front-matter comments**: `# text` up to the end of the line.
//! * **Body directives**: a line that starts with a markdown link label the
//!   compiler acts on, `[flow]: next.shire`. They are dropped from compiled
//!   output. Any other `[label]: text` line (a reference link, say) is text.

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, not_line_ending},
    combinator::{map, recognize, value, verify},
    error::context,
    sequence::{delimited, preceded, tuple},
};

use super::token::{ParserResult, TokenKind};

/// `# comment` in the front-matter header.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_hash_comment(input: &str) -> ParserResult<TokenKind> {
    context(
        "hash comment",
        value(
            TokenKind::Comment,
            recognize(preceded(char('#'), not_line_ending)),
        ),
    )(input)
}

/// Labels that make a body line a directive instead of text.
pub const DIRECTIVE_LABELS: &[&str] = &["flow"];

pub fn is_directive_label(label: &str) -> bool {
    DIRECTIVE_LABELS.contains(&label)
}

/// `[flow]: text` at the start of a body line.
#[tracing::instrument(level = "debug", skip(input))]
pub fn parse_label_comment(input: &str) -> ParserResult<TokenKind> {
    context(
        "label comment",
        value(
            TokenKind::Comment,
            recognize(tuple((
                verify(
                    delimited(char('['), take_while1(is_label_char), tag("]:")),
                    |label: &str| is_directive_label(label),
                ),
                not_line_ending,
            ))),
        ),
    )(input)
}

fn is_label_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '/')
}

/// Splits the text of a label comment into its label and trimmed content.
pub fn split_label_comment(text: &str) -> Option<(&str, &str)> {
    let parsed: ParserResult<(&str, &str)> = tuple((
        delimited(char('['), take_while1(is_label_char), tag("]:")),
        map(not_line_ending, str::trim),
    ))(text);
    parsed.ok().map(|(_, pair)| pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_comment() {
        let (rest, kind) = parse_hash_comment("# note\nname: x").unwrap();
        assert_eq!(kind, TokenKind::Comment);
        assert_eq!(rest, "\nname: x");
    }

    #[test]
    fn test_label_comment() {
        let (rest, kind) = parse_label_comment("[flow]: next.shire\nbody").unwrap();
        assert_eq!(kind, TokenKind::Comment);
        assert_eq!(rest, "\nbody");

        assert!(parse_label_comment("[not a label]: x").is_err());
        assert!(parse_label_comment("[flow] x").is_err());
        assert!(parse_label_comment("[1]: https://example.com").is_err());
        assert!(parse_label_comment("[//]: # hidden").is_err());
    }

    #[test]
    fn test_split_label_comment() {
        assert_eq!(
            split_label_comment("[flow]:  follow.shire "),
            Some(("flow", "follow.shire"))
        );
        assert_eq!(split_label_comment("[//]: # hidden"), Some(("//", "# hidden")));
        assert_eq!(split_label_comment("plain"), None);
    }
}
