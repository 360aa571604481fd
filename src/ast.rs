use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tokenizer::keyword::Keyword;
use crate::tokenizer::literal::quote;

/// Parsed script.
///
/// # Example
/// ```text
/// ---
/// name: "Summarize"
/// variables:
///   "code": /src\/.*\.rs/ { read | head(40) }
/// onStreamingEnd: { parseCode | saveFile("docs/summary.md") }
/// ---
/// Summarize the following code:
/// $code
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Document {
    pub front_matter: Option<FrontMatterBlock>,
    pub body: Vec<BodyNode>,
    /// Recoverable syntax errors, in source order.
    pub errors: Vec<SyntaxError>,
}

impl Document {
    pub fn has_agent_mention(&self) -> bool {
        self.body
            .iter()
            .any(|node| matches!(node, BodyNode::AgentMention { .. }))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{description} at line {line}, column {column}")]
pub struct SyntaxError {
    /// Byte offset into the source.
    pub offset: usize,
    pub line: usize,
    pub column: usize,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BodyNode {
    Text {
        text: String,
    },
    CodeBlock {
        language_id: Option<String>,
        /// Everything between the fences, including the line break after the opener.
        content: String,
    },
    Command {
        name: String,
        properties: BTreeMap<String, String>,
        argument: Option<String>,
    },
    VariableRef {
        name: String,
    },
    AgentMention {
        name: String,
    },
    Comment {
        label: String,
        text: String,
    },
    /// Source that could not be parsed, kept with the reason.
    Error {
        text: String,
        message: String,
    },
}

impl BodyNode {
    /// Code of a fenced block without the opener line break.
    pub fn code(&self) -> Option<&str> {
        match self {
            BodyNode::CodeBlock { content, .. } => Some(strip_opener_line(content)),
            _ => None,
        }
    }
}

fn strip_opener_line(content: &str) -> &str {
    match content.split_once('\n') {
        Some((first, rest)) if first.trim().is_empty() => rest,
        _ => content,
    }
}

impl fmt::Display for BodyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyNode::Text { text } => write!(f, "{}", text),
            BodyNode::CodeBlock {
                language_id,
                content,
            } => write!(
                f,
                "```{}{}```",
                language_id.as_deref().unwrap_or_default(),
                content
            ),
            BodyNode::Command {
                name,
                properties,
                argument,
            } => {
                write!(f, "/{}", name)?;
                if let Some(argument) = argument {
                    if argument.chars().any(char::is_whitespace) {
                        write!(f, ":{}", quote(argument))?;
                    } else {
                        write!(f, ":{}", argument)?;
                    }
                }
                match (properties.get("startLine"), properties.get("endLine")) {
                    (Some(start), Some(end)) => write!(f, "#L{}-L{}", start, end)?,
                    (Some(start), None) => write!(f, "#L{}", start)?,
                    _ => {
                        if let Some(fragment) = properties.get("fragment") {
                            write!(f, "#{}", fragment)?;
                        }
                    }
                }
                Ok(())
            }
            BodyNode::VariableRef { name } => write!(f, "${}", name),
            BodyNode::AgentMention { name } => write!(f, "@{}", name),
            BodyNode::Comment { label, text } => write!(f, "[{}]: {}", label, text),
            BodyNode::Error { text, .. } => write!(f, "{}", text),
        }
    }
}

/// Where a variable's initial value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum SourcePattern {
    /// Regular expression matched against project-relative file paths.
    Regex(String),
    Literal(String),
    None,
}

/// Name of the call a `case subject { ... }` step parses into.
pub const CASE_MATCH: &str = "caseMatch";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<serde_json::Value>,
    /// Branches of a `case` step; empty for ordinary calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<CaseBranch>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            args,
            branches: Vec::new(),
        }
    }

    /// `case subject { "a" { ... } default { ... } }`
    pub fn case_match(subject: impl Into<String>, branches: Vec<CaseBranch>) -> Self {
        Self {
            name: CASE_MATCH.to_string(),
            args: vec![serde_json::Value::String(subject.into())],
            branches,
        }
    }

    pub fn is_case_match(&self) -> bool {
        self.name == CASE_MATCH && !self.branches.is_empty()
    }

    /// First argument as text, if any.
    pub fn first_arg_text(&self) -> Option<String> {
        self.args.first().map(value_text)
    }
}

/// Renders a JSON argument the way it appears when substituted into text.
pub fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One arm of a `case` step. `pattern` is `None` for `default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseBranch {
    pub pattern: Option<String>,
    pub pipeline: FunctionPipeline,
}

impl CaseBranch {
    pub fn matches(&self, subject: &str) -> bool {
        self.pattern.as_deref() == Some(subject)
    }
}

impl fmt::Display for CaseBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pattern {
            Some(pattern) => write!(f, "{} {}", quote(pattern), PipelineDisplay(&self.pipeline)),
            None => write!(f, "default {}", PipelineDisplay(&self.pipeline)),
        }
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_case_match() {
            write!(f, "case {} {{", quote(&self.first_arg_text().unwrap_or_default()))?;
            for branch in &self.branches {
                write!(f, " {}", branch)?;
            }
            return write!(f, " }}");
        }
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self
                .args
                .iter()
                .map(|arg| match arg {
                    serde_json::Value::String(s) => quote(s),
                    other => other.to_string(),
                })
                .collect();
            write!(f, "({})", args.join(", "))?;
        }
        Ok(())
    }
}

pub type FunctionPipeline = Vec<FunctionCall>;

pub(crate) struct PipelineDisplay<'a>(pub &'a [FunctionCall]);

impl fmt::Display for PipelineDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{ }}");
        }
        let calls: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{{ {} }}", calls.join(" | "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub name: String,
    pub source: SourcePattern,
    pub pipeline: FunctionPipeline,
    /// A failing required variable fails the whole compilation.
    pub required: bool,
}

impl fmt::Display for VariableDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.name))?;
        if self.required {
            write!(f, "!")?;
        }
        write!(f, ":")?;
        match &self.source {
            SourcePattern::Regex(pattern) => write!(f, " /{}/", pattern.replace('/', "\\/"))?,
            SourcePattern::Literal(text) => write!(f, " {}", quote(text))?,
            SourcePattern::None => {
                return write!(f, " {}", PipelineDisplay(&self.pipeline));
            }
        }
        if !self.pipeline.is_empty() {
            write!(f, " {}", PipelineDisplay(&self.pipeline))?;
        }
        Ok(())
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    BeforeStreaming,
    OnStreaming,
    OnStreamingEnd,
    AfterStreaming,
}

impl HookKind {
    /// Hooks that only make sense around an agent response stream.
    pub fn requires_streaming(&self) -> bool {
        !matches!(self, HookKind::BeforeStreaming)
    }

    pub fn from_keyword(keyword: Keyword) -> Option<Self> {
        match keyword {
            Keyword::BeforeStreaming => Some(HookKind::BeforeStreaming),
            Keyword::OnStreaming => Some(HookKind::OnStreaming),
            Keyword::OnStreamingEnd => Some(HookKind::OnStreamingEnd),
            Keyword::AfterStreaming => Some(HookKind::AfterStreaming),
            Keyword::When => None,
        }
    }
}

/// Where the host should put the result.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
)]
pub enum InteractionMode {
    AppendCursor,
    AppendCursorStream,
    OutputFile,
    ReplaceSelection,
    ReplaceCurrentFile,
    InsertBeforeSelection,
    #[default]
    RunPanel,
    ChatPanel,
    OnPaste,
    StreamDiff,
}

/// A foreign function usable from pipelines, e.g. `"format": "fmt.py"(string): string`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub file: String,
    pub inputs: Vec<String>,
    pub output: Option<String>,
}

impl fmt::Display for FunctionDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", quote(&self.name), quote(&self.file))?;
        if !self.inputs.is_empty() || self.output.is_some() {
            write!(f, "({})", self.inputs.join(", "))?;
        }
        if let Some(output) = &self.output {
            write!(f, ": {}", output)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDeclaration {
    pub name: String,
    pub description: Option<String>,
}

/// Generic front-matter value, used while parsing and for keys without a
/// dedicated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FrontMatterValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Identifier(String),
    /// `/regex/ { pipeline }` or `"literal" { pipeline }`.
    Source {
        source: SourcePattern,
        pipeline: FunctionPipeline,
    },
    Pipeline(FunctionPipeline),
    /// Brace expression that is not a pipeline, kept as raw text.
    Expression(String),
    FunctionSignature {
        file: String,
        inputs: Vec<String>,
        output: Option<String>,
    },
    List(Vec<FrontMatterValue>),
    Object(Vec<FrontMatterEntry>),
}

impl FrontMatterValue {
    pub fn as_text(&self) -> Option<String> {
        match self {
            FrontMatterValue::String(s)
            | FrontMatterValue::Identifier(s)
            | FrontMatterValue::Expression(s) => Some(s.clone()),
            FrontMatterValue::Number(n) => Some(n.to_string()),
            FrontMatterValue::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for FrontMatterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontMatterValue::String(s) => write!(f, "{}", quote(s)),
            FrontMatterValue::Number(n) => write!(f, "{}", n),
            FrontMatterValue::Boolean(b) => write!(f, "{}", b),
            FrontMatterValue::Identifier(s) => write!(f, "{}", s),
            FrontMatterValue::Source { source, pipeline } => {
                match source {
                    SourcePattern::Regex(p) => write!(f, "/{}/", p.replace('/', "\\/"))?,
                    SourcePattern::Literal(s) => write!(f, "{}", quote(s))?,
                    SourcePattern::None => return write!(f, "{}", PipelineDisplay(pipeline)),
                }
                if !pipeline.is_empty() {
                    write!(f, " {}", PipelineDisplay(pipeline))?;
                }
                Ok(())
            }
            FrontMatterValue::Pipeline(pipeline) => write!(f, "{}", PipelineDisplay(pipeline)),
            FrontMatterValue::Expression(raw) => write!(f, "{{ {} }}", raw),
            FrontMatterValue::FunctionSignature {
                file,
                inputs,
                output,
            } => {
                write!(f, "{}({})", quote(file), inputs.join(", "))?;
                if let Some(output) = output {
                    write!(f, ": {}", output)?;
                }
                Ok(())
            }
            FrontMatterValue::List(items) => {
                let items: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
            FrontMatterValue::Object(entries) => {
                for entry in entries {
                    writeln!(f)?;
                    write_entry(f, 1, entry)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontMatterEntry {
    pub key: String,
    pub required: bool,
    pub value: FrontMatterValue,
}

fn write_entry(f: &mut fmt::Formatter<'_>, depth: usize, entry: &FrontMatterEntry) -> fmt::Result {
    let indent = "  ".repeat(depth);
    write!(f, "{}{}", indent, quote(&entry.key))?;
    if entry.required {
        write!(f, "!")?;
    }
    match &entry.value {
        FrontMatterValue::Object(children) => {
            write!(f, ":")?;
            for child in children {
                writeln!(f)?;
                write_entry(f, depth + 1, child)?;
            }
            Ok(())
        }
        value => write!(f, ": {}", value),
    }
}

/// Header of a script: metadata, variables, hooks, functions and agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontMatterBlock {
    pub name: Option<String>,
    pub description: Option<String>,
    pub interaction_mode: InteractionMode,
    pub variables: Vec<VariableDeclaration>,
    pub lifecycle_hooks: BTreeMap<HookKind, FunctionPipeline>,
    pub functions: Vec<FunctionDeclaration>,
    pub agents: Vec<AgentDeclaration>,
    /// Raw condition expression deciding whether the script applies.
    pub when: Option<String>,
    pub model: Option<String>,
    pub enabled: bool,
    /// Keys without a dedicated field, in declaration order.
    pub user_data: Vec<FrontMatterEntry>,
}

impl Default for FrontMatterBlock {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            interaction_mode: InteractionMode::default(),
            variables: Vec::new(),
            lifecycle_hooks: BTreeMap::new(),
            functions: Vec::new(),
            agents: Vec::new(),
            when: None,
            model: None,
            enabled: true,
            user_data: Vec::new(),
        }
    }
}

impl FrontMatterBlock {
    pub fn hook(&self, kind: HookKind) -> Option<&FunctionPipeline> {
        self.lifecycle_hooks.get(&kind)
    }

    pub fn requires_streaming(&self) -> bool {
        self.lifecycle_hooks
            .iter()
            .any(|(kind, pipeline)| kind.requires_streaming() && !pipeline.is_empty())
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDeclaration> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Canonical form, including the `---` delimiters.
impl fmt::Display for FrontMatterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---")?;
        if let Some(name) = &self.name {
            writeln!(f, "name: {}", quote(name))?;
        }
        if let Some(description) = &self.description {
            writeln!(f, "description: {}", quote(description))?;
        }
        writeln!(f, "interaction: {}", self.interaction_mode)?;
        if let Some(model) = &self.model {
            writeln!(f, "model: {}", quote(model))?;
        }
        if !self.enabled {
            writeln!(f, "enabled: false")?;
        }
        if let Some(when) = &self.when {
            writeln!(f, "when: {{ {} }}", when)?;
        }
        if !self.variables.is_empty() {
            writeln!(f, "variables:")?;
            for variable in &self.variables {
                writeln!(f, "  {}", variable)?;
            }
        }
        if !self.functions.is_empty() {
            writeln!(f, "functions:")?;
            for function in &self.functions {
                writeln!(f, "  {}", function)?;
            }
        }
        if !self.agents.is_empty() {
            writeln!(f, "agents:")?;
            for agent in &self.agents {
                match &agent.description {
                    Some(description) => {
                        writeln!(f, "  {}: {}", quote(&agent.name), quote(description))?
                    }
                    None => writeln!(f, "  - {}", quote(&agent.name))?,
                }
            }
        }
        for (kind, pipeline) in &self.lifecycle_hooks {
            writeln!(f, "{}: {}", kind, PipelineDisplay(pipeline))?;
        }
        for entry in &self.user_data {
            write_entry(f, 0, entry)?;
            writeln!(f)?;
        }
        write!(f, "---")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_node_display() {
        let mut properties = BTreeMap::new();
        properties.insert("startLine".to_string(), "1".to_string());
        properties.insert("endLine".to_string(), "3".to_string());
        let command = BodyNode::Command {
            name: "file".to_string(),
            properties,
            argument: Some("src/main.rs".to_string()),
        };
        assert_eq!(command.to_string(), "/file:src/main.rs#L1-L3");

        let block = BodyNode::CodeBlock {
            language_id: Some("rust".to_string()),
            content: "\nfn main() {}\n".to_string(),
        };
        assert_eq!(block.to_string(), "```rust\nfn main() {}\n```");
        assert_eq!(block.code(), Some("fn main() {}\n"));
    }

    #[test]
    fn test_variable_declaration_display() {
        let decl = VariableDeclaration {
            name: "logs".to_string(),
            source: SourcePattern::Regex("logs/.*\\.log".to_string()),
            pipeline: vec![
                FunctionCall::new("grep", vec![json!("ERROR")]),
                FunctionCall::new("head", vec![json!(5)]),
            ],
            required: true,
        };
        assert_eq!(
            decl.to_string(),
            r#""logs"!: /logs\/.*\.log/ { grep("ERROR") | head(5) }"#
        );
    }

    #[test]
    fn test_case_match_display() {
        let call = FunctionCall::case_match(
            "$output",
            vec![
                CaseBranch {
                    pattern: Some("error".to_string()),
                    pipeline: vec![FunctionCall::new("notify", vec![json!("failed")])],
                },
                CaseBranch {
                    pattern: None,
                    pipeline: vec![FunctionCall::new("execute", vec![json!("next.shire")])],
                },
            ],
        );
        assert!(call.is_case_match());
        assert_eq!(
            call.to_string(),
            r#"case "$output" { "error" { notify("failed") } default { execute("next.shire") } }"#
        );
        assert!(call.branches[0].matches("error"));
        assert!(!call.branches[1].matches("default"));
    }

    #[test]
    fn test_hook_streaming_requirements() {
        assert!(!HookKind::BeforeStreaming.requires_streaming());
        assert!(HookKind::OnStreamingEnd.requires_streaming());
        let mut block = FrontMatterBlock::default();
        block
            .lifecycle_hooks
            .insert(HookKind::BeforeStreaming, vec![FunctionCall::new("print", vec![])]);
        assert!(!block.requires_streaming());
        block
            .lifecycle_hooks
            .insert(HookKind::AfterStreaming, vec![FunctionCall::new("execute", vec![json!("next.shire")])]);
        assert!(block.requires_streaming());
    }

    #[test]
    fn test_interaction_mode_parsing() {
        assert_eq!(
            "AppendCursor".parse::<InteractionMode>().unwrap(),
            InteractionMode::AppendCursor
        );
        assert!("Nowhere".parse::<InteractionMode>().is_err());
    }
}
