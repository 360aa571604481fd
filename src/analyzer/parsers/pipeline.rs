use super::{boolean, identifier, number, punct, quoted_string};
use crate::analyzer::{core::Parser, prelude::*};
use crate::ast::{CaseBranch, FunctionCall, FunctionPipeline};
use crate::tokenizer::{TokenKind, TokenSpan};

/// `{ fn1 | fn2(args) | ... }`. Empty braces give an empty pipeline. A step
/// may be a `case` whose branches hold plain pipelines.
pub fn parse_pipeline() -> impl Parser<TokenSpan, FunctionPipeline> {
    with_context(
        braced_pipeline(|| {
            choice(vec![
                Box::new(parse_case_match()),
                Box::new(parse_function_call()),
            ])
        }),
        "pipeline",
    )
}

fn braced_pipeline<P, F>(step: F) -> impl Parser<TokenSpan, FunctionPipeline>
where
    P: Parser<TokenSpan, FunctionCall> + 'static,
    F: Fn() -> P,
{
    choice(vec![
        Box::new(map(
            tuple2(punct(TokenKind::OpenBrace), punct(TokenKind::CloseBrace)),
            |_| Vec::new(),
        )),
        Box::new(delimited(
            punct(TokenKind::OpenBrace),
            separated_list(step(), punct(TokenKind::Pipe)),
            punct(TokenKind::CloseBrace),
        )),
    ])
}

/// `name` or `name(arg, ...)`.
pub fn parse_function_call() -> impl Parser<TokenSpan, FunctionCall> {
    with_context(
        map(
            tuple2(identifier(), optional(parse_arguments())),
            |(name, args)| FunctionCall::new(name, args.unwrap_or_default()),
        ),
        "function call",
    )
}

/// `case "$output" { "error" { notify("failed") } default { execute("next.shire") } }`
fn parse_case_match() -> impl Parser<TokenSpan, FunctionCall> {
    with_context(
        map(
            tuple2(
                preceded(word("case"), parse_case_subject()),
                delimited(
                    punct(TokenKind::OpenBrace),
                    many1(parse_case_branch()),
                    punct(TokenKind::CloseBrace),
                ),
            ),
            |(subject, branches)| FunctionCall::case_match(subject, branches),
        ),
        "case",
    )
}

fn parse_case_subject() -> impl Parser<TokenSpan, String> {
    choice(vec![
        Box::new(quoted_string()),
        Box::new(map(
            preceded(punct(TokenKind::VariableSigil), identifier()),
            |name| format!("${}", name),
        )),
    ])
}

fn parse_case_branch() -> impl Parser<TokenSpan, CaseBranch> {
    map(
        tuple2(
            choice(vec![
                Box::new(map(quoted_string(), Some)),
                Box::new(map(identifier(), |name| (name != "default").then_some(name))),
            ]),
            braced_pipeline(parse_function_call),
        ),
        |(pattern, pipeline)| CaseBranch { pattern, pipeline },
    )
}

/// The identifier `text`.
fn word(text: &'static str) -> impl Parser<TokenSpan, ()> {
    as_unit(satisfy(
        move |t: &TokenSpan| (t.kind == TokenKind::Identifier && t.text == text).then_some(()),
        text,
    ))
}

fn parse_arguments() -> impl Parser<TokenSpan, Vec<serde_json::Value>> {
    choice(vec![
        Box::new(map(
            tuple2(punct(TokenKind::OpenParen), punct(TokenKind::CloseParen)),
            |_| Vec::new(),
        )),
        Box::new(delimited(
            punct(TokenKind::OpenParen),
            separated_list(parse_argument(), punct(TokenKind::Comma)),
            punct(TokenKind::CloseParen),
        )),
    ])
}

/// Arguments are strings, numbers, booleans, bare words or `$name`
/// references. Bare words and references are kept as strings; references
/// keep their `$` so the resolver can substitute them.
fn parse_argument() -> impl Parser<TokenSpan, serde_json::Value> {
    choice(vec![
        Box::new(map(quoted_string(), serde_json::Value::String)),
        Box::new(number()),
        Box::new(map(boolean(), serde_json::Value::Bool)),
        Box::new(map(
            preceded(punct(TokenKind::VariableSigil), identifier()),
            |name| serde_json::Value::String(format!("${}", name)),
        )),
        Box::new(map(identifier(), serde_json::Value::String)),
    ])
}
