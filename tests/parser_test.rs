use pretty_assertions::assert_eq;
use proptest::prelude::*;
use shire::{
    analyzer::parse_source,
    ast::{BodyNode, HookKind, SourcePattern},
    tokenizer::tokenize,
};

const HEADER: &str = r#"---
name: "Summarize code"
description: Generate a short summary
interaction: AppendCursor
model: gpt-4o
variables:
  "code"!: /src\/.*\.rs/ { read | head(40) }
  title: "Release notes"
  lines: { print("a") | lineNo }
functions:
  fmt: "format.py"(string, number): string
agents:
  - reviewer
  - "doc-writer"
when: { $fileName.contains(".rs") }
onStreamingEnd: { parseCode | saveFile("docs/out.md") }
afterStreaming: "next.shire"
retries: 3
extra:
  nested: true
---
"#;

#[test]
fn test_front_matter_round_trip() {
    let first = parse_source(HEADER).unwrap().front_matter.unwrap();
    let rendered = format!("{}\n", first);
    let second = parse_source(&rendered).unwrap().front_matter.unwrap();
    assert_eq!(second, first);
    assert_eq!(
        first.hook(HookKind::AfterStreaming).map(|p| p[0].name.as_str()),
        Some("execute")
    );
}

#[test]
fn test_body_after_header() {
    let source = format!("{}Review /file:src/main.rs#L1-L3 with @reviewer using $code\n", HEADER);
    let doc = parse_source(&source).unwrap();
    assert!(doc.errors.is_empty());
    assert!(doc.has_agent_mention());
    let kinds: Vec<&str> = doc
        .body
        .iter()
        .map(|node| match node {
            BodyNode::Text { .. } => "text",
            BodyNode::Command { .. } => "command",
            BodyNode::AgentMention { .. } => "agent",
            BodyNode::VariableRef { .. } => "variable",
            BodyNode::CodeBlock { .. } => "code",
            BodyNode::Comment { .. } => "comment",
            BodyNode::Error { .. } => "error",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["text", "command", "text", "agent", "text", "variable", "text"]
    );
    let code = doc.front_matter.unwrap();
    assert_eq!(code.variables[0].source, SourcePattern::Regex(r"src/.*\.rs".to_string()));
}

#[test]
fn test_sigils_inside_words_stay_text() {
    let doc = parse_source("mail me@example.com or see a/b and US$5").unwrap();
    assert_eq!(
        doc.body,
        vec![BodyNode::Text {
            text: "mail me@example.com or see a/b and US$5".to_string()
        }]
    );
}

proptest! {
    #[test]
    fn test_tokens_cover_input(source in "[ -~\n]{0,120}") {
        let tokens = tokenize(&source);
        let rebuilt: String = tokens.iter().map(|t| t.text.as_str()).collect();
        prop_assert_eq!(rebuilt, source);
    }

    #[test]
    fn test_plain_text_body_is_identity(source in "[a-zA-Z0-9 ,.!?:;'\"()\n]{0,200}") {
        let doc = parse_source(&source).unwrap();
        prop_assert!(doc.errors.is_empty());
        let rebuilt: String = doc.body.iter().map(ToString::to_string).collect();
        prop_assert_eq!(rebuilt, source);
    }
}
